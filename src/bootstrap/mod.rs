//! Process bootstrap: shared state wiring, server lifecycle and shutdown.

mod server;
mod shutdown;
mod state;

pub use server::Server;
pub use shutdown::{Shutdown, ShutdownState};
pub use state::{Ingested, Rejection, ServiceState, SharedServiceState, STORAGE_DEPENDENCY};

#[cfg(test)]
pub(crate) use state::test_support;
