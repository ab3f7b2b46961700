use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use ethers_core::types::Address;
use ethers_signers::{LocalWallet, Signer};
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PoolError, Result};

/// Per-wallet secp256k1 secrets, one hex file per wallet id. Files are
/// written through a temp file, which is created owner-only.
#[derive(Debug, Clone)]
pub struct KeyVault {
    dir: PathBuf,
}

impl KeyVault {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create and store a fresh key, returning its wallet id and address.
    pub fn generate(&self) -> Result<(String, Address)> {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let id = format!("wallet-{}", Uuid::new_v4().simple());

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(hex::encode(wallet.signer().to_bytes()).as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(self.key_path(&id))
            .map_err(|err| PoolError::Io(err.error))?;

        debug!(wallet_id = %id, address = ?wallet.address(), "generated pool wallet key");
        Ok((id, wallet.address()))
    }

    pub fn load(&self, id: &str) -> Result<LocalWallet> {
        let encoded = match fs::read_to_string(self.key_path(id)) {
            Ok(encoded) => encoded,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(PoolError::WalletNotFound(id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let secret = hex::decode(encoded.trim())
            .map_err(|err| PoolError::Key(format!("key for {id} is not hex: {err}")))?;
        LocalWallet::from_bytes(&secret)
            .map_err(|err| PoolError::Key(format!("key for {id} is invalid: {err}")))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.key_path(id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn key_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.key"))
    }
}
