//! Storage factory for creating storage backends.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{StorageBackend, StoreConfig};

use super::{MemoryStorage, PersistentStorage, SharedStorage};

/// Resolve the data directory.
fn resolve_data_dir(config_path: Option<&std::path::Path>) -> PathBuf {
    if let Some(path) = config_path {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        return std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path);
    }

    #[cfg(unix)]
    {
        if unsafe { libc::getuid() } == 0 {
            return PathBuf::from("/var/lib/dispatchd");
        }
    }

    dirs::data_dir()
        .map(|p| p.join("dispatchd"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local/share/dispatchd"))
                .unwrap_or_else(|| PathBuf::from("./data"))
        })
}

/// Create the acknowledgement / opt-in storage backend.
pub async fn create_storage(config: &StoreConfig) -> anyhow::Result<SharedStorage> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("using in-memory storage (volatile)");
            Ok(Arc::new(MemoryStorage::new()))
        }
        StorageBackend::Fjall => {
            let data_dir = resolve_data_dir(config.fjall.path.as_deref());
            std::fs::create_dir_all(&data_dir)?;
            tracing::info!(path = %data_dir.display(), "using persistent storage");
            Ok(PersistentStorage::open(&data_dir).await? as SharedStorage)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Channel;
    use crate::store::test_support::pending_sms;
    use std::path::Path;

    #[test]
    fn test_resolve_data_dir_explicit_absolute() {
        let path = Path::new("/custom/data/path");
        assert_eq!(resolve_data_dir(Some(path)), path);
    }

    #[test]
    fn test_resolve_data_dir_explicit_relative() {
        let resolved = resolve_data_dir(Some(Path::new("./my-data")));
        assert!(resolved.ends_with("my-data"));
    }

    #[test]
    fn test_resolve_data_dir_none_uses_system() {
        let resolved = resolve_data_dir(None);
        let path_str = resolved.to_string_lossy();
        assert!(
            path_str.contains("dispatchd") || path_str.ends_with("data"),
            "resolved path should contain dispatchd: {}",
            path_str
        );
    }

    #[tokio::test]
    async fn test_create_memory_storage() {
        let storage = create_storage(&StoreConfig::memory()).await.unwrap();
        assert!(storage.insert(pending_sms("r1")));
        assert!(storage
            .get_by_reference_and_channel("r1", Channel::Sms)
            .is_some());
    }

    #[tokio::test]
    async fn test_create_fjall_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = create_storage(&StoreConfig::fjall(dir.path().join("acks")))
            .await
            .unwrap();
        assert!(storage.insert(pending_sms("r1")));
        assert!(storage.is_ready());
    }
}
