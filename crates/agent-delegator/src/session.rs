use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use delegation_core::SessionKey;
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::Result;

/// Load the unattended session key kept at `path`, creating it on first use.
/// The root delegation names this key as its delegate, so it must survive
/// restarts for issued sub-delegations to stay redeemable.
pub fn load_or_create_session_key(path: &Path) -> Result<SessionKey> {
    match fs::read_to_string(path) {
        Ok(encoded) => Ok(SessionKey::from_hex(&encoded)?),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let key = SessionKey::random();
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let mut temp = NamedTempFile::new_in(dir)?;
            temp.write_all(key.to_hex().as_bytes())?;
            temp.as_file().sync_all()?;
            // Another process may have won the race; keep whichever landed first.
            match temp.persist_noclobber(path) {
                Ok(_) => {
                    info!(address = ?key.address(), "created session key");
                    Ok(key)
                }
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                    Ok(SessionKey::from_hex(&fs::read_to_string(path)?)?)
                }
                Err(err) => Err(err.error.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.key");
        let first = load_or_create_session_key(&path).unwrap();
        let second = load_or_create_session_key(&path).unwrap();
        assert_eq!(first.address(), second.address());
    }
}
