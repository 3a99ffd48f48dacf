pub mod loader;
mod types;
pub mod watcher;

pub use types::*;
pub use watcher::{ConfigEvent, ConfigWatcher};
