use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ethers_core::types::Address;
use ethers_signers::LocalWallet;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::keys::KeyVault;
use crate::lock::{FileLock, LockConfig, PoolLock};

pub const POOL_FILE: &str = "wallet-pool.json";
pub const LOCK_FILE: &str = "wallet-pool.lock";
const KEYS_DIR: &str = "wallet-keys";
const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Idle,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolWallet {
    pub id: String,
    pub address: Address,
    pub status: WalletStatus,
    pub assigned_to: Option<String>,
    pub created_at: u64,
    pub last_used_at: u64,
}

impl PoolWallet {
    /// `active` exactly when an owner is recorded.
    pub fn is_consistent(&self) -> bool {
        (self.status == WalletStatus::Active) == self.assigned_to.is_some()
    }

    fn make_idle(&mut self, now: u64) {
        self.status = WalletStatus::Idle;
        self.assigned_to = None;
        self.last_used_at = now;
    }
}

/// Tells the pool whether a recorded owner still exists.
pub trait OwnerDirectory: Send + Sync {
    fn exists(&self, owner: &str) -> bool;
}

/// Treats every owner as present, so healing only repairs flag mismatches.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeOwnersPresent;

impl OwnerDirectory for AssumeOwnersPresent {
    fn exists(&self, _owner: &str) -> bool {
        true
    }
}

/// The persisted pool document and its state transitions. Callers hold the
/// pool lock around every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRecord {
    #[serde(default)]
    pub wallets: Vec<PoolWallet>,
}

impl PoolRecord {
    /// Force inconsistent or orphaned wallets back to idle. Returns how many
    /// were repaired.
    pub fn heal(&mut self, owners: &dyn OwnerDirectory, now: u64) -> usize {
        let mut repaired = 0;
        for wallet in &mut self.wallets {
            let orphaned = match (&wallet.status, &wallet.assigned_to) {
                (WalletStatus::Active, Some(owner)) => !owners.exists(owner),
                (WalletStatus::Idle, None) => false,
                _ => true,
            };
            if orphaned {
                warn!(wallet_id = %wallet.id, owner = ?wallet.assigned_to, "healing pool wallet back to idle");
                wallet.make_idle(now);
                repaired += 1;
            }
        }
        repaired
    }

    /// Assign an idle wallet to `owner`, creating one through `create` when
    /// none is idle. An owner that already holds a wallet gets it back.
    pub fn assign(
        &mut self,
        owner: &str,
        now: u64,
        create: impl FnOnce() -> Result<(String, Address)>,
    ) -> Result<PoolWallet> {
        if let Some(existing) = self
            .wallets
            .iter()
            .find(|wallet| wallet.assigned_to.as_deref() == Some(owner))
        {
            return Ok(existing.clone());
        }

        let idle = self
            .wallets
            .iter()
            .enumerate()
            .filter(|(_, wallet)| {
                wallet.status == WalletStatus::Idle && wallet.assigned_to.is_none()
            })
            .min_by_key(|(_, wallet)| wallet.last_used_at)
            .map(|(index, _)| index);

        let index = match idle {
            Some(index) => index,
            None => {
                let (id, address) = create()?;
                self.wallets.push(PoolWallet {
                    id,
                    address,
                    status: WalletStatus::Idle,
                    assigned_to: None,
                    created_at: now,
                    last_used_at: now,
                });
                self.wallets.len() - 1
            }
        };
        let wallet = &mut self.wallets[index];
        wallet.status = WalletStatus::Active;
        wallet.assigned_to = Some(owner.to_string());
        wallet.last_used_at = now;
        Ok(wallet.clone())
    }

    /// Returns false when the wallet was already idle.
    pub fn release(&mut self, wallet_id: &str, now: u64) -> Result<bool> {
        let wallet = self.find_mut(wallet_id)?;
        let was_active = wallet.status == WalletStatus::Active || wallet.assigned_to.is_some();
        wallet.make_idle(now);
        Ok(was_active)
    }

    /// Remove an idle wallet from the pool.
    pub fn remove(&mut self, wallet_id: &str) -> Result<PoolWallet> {
        let wallet = self.find_mut(wallet_id)?;
        if let Some(owner) = &wallet.assigned_to {
            return Err(PoolError::WalletBusy {
                id: wallet_id.to_string(),
                owner: owner.clone(),
            });
        }
        let index = self
            .wallets
            .iter()
            .position(|wallet| wallet.id == wallet_id)
            .ok_or_else(|| PoolError::WalletNotFound(wallet_id.to_string()))?;
        Ok(self.wallets.remove(index))
    }

    /// Drop idle wallets unused for at least `max_age_days`.
    pub fn cleanup_idle(&mut self, max_age_days: u32, now: u64) -> Vec<PoolWallet> {
        let cutoff = now.saturating_sub(u64::from(max_age_days) * SECONDS_PER_DAY);
        let (evicted, kept) = std::mem::take(&mut self.wallets)
            .into_iter()
            .partition(|wallet| {
                wallet.status == WalletStatus::Idle
                    && wallet.assigned_to.is_none()
                    && wallet.last_used_at <= cutoff
            });
        self.wallets = kept;
        evicted
    }

    pub fn is_consistent(&self) -> bool {
        self.wallets.iter().all(PoolWallet::is_consistent)
    }

    fn find_mut(&mut self, wallet_id: &str) -> Result<&mut PoolWallet> {
        self.wallets
            .iter_mut()
            .find(|wallet| wallet.id == wallet_id)
            .ok_or_else(|| PoolError::WalletNotFound(wallet_id.to_string()))
    }
}

/// File-backed wallet pool shared by every process using the same data
/// directory.
pub struct WalletPoolManager {
    pool_path: PathBuf,
    lock: Arc<dyn PoolLock>,
    vault: KeyVault,
    owners: Arc<dyn OwnerDirectory>,
}

impl WalletPoolManager {
    pub fn open(
        dir: impl AsRef<Path>,
        lock: Arc<dyn PoolLock>,
        owners: Arc<dyn OwnerDirectory>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            pool_path: dir.join(POOL_FILE),
            lock,
            vault: KeyVault::open(dir.join(KEYS_DIR))?,
            owners,
        })
    }

    /// Pool guarded by `<dir>/wallet-pool.lock`.
    pub fn with_file_lock(
        dir: impl AsRef<Path>,
        config: LockConfig,
        owners: Arc<dyn OwnerDirectory>,
    ) -> Result<Self> {
        let lock = Arc::new(FileLock::new(dir.as_ref().join(LOCK_FILE), config));
        Self::open(dir, lock, owners)
    }

    pub async fn assign_wallet(&self, owner: &str) -> Result<PoolWallet> {
        let owners = self.owners.as_ref();
        let vault = &self.vault;
        let mut generated = None;
        let outcome = self
            .mutate(|record| {
                let now = now_secs();
                record.heal(owners, now);
                record.assign(owner, now, || {
                    let created = vault.generate()?;
                    generated = Some(created.0.clone());
                    Ok(created)
                })
            })
            .await;
        let wallet = match outcome {
            Ok(wallet) => wallet,
            Err(err) => {
                if let Some(wallet_id) = generated {
                    self.discard_unsaved_key(&wallet_id);
                }
                return Err(err);
            }
        };
        info!(wallet_id = %wallet.id, owner, address = ?wallet.address, "assigned pool wallet");
        Ok(wallet)
    }

    /// Drop a key generated during a failed assignment unless the pool
    /// record made it to disk anyway.
    fn discard_unsaved_key(&self, wallet_id: &str) {
        match self.wallet(wallet_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(err) = self.vault.delete(wallet_id) {
                    warn!(wallet_id, "could not delete unsaved wallet key: {err}");
                }
            }
            Err(err) => warn!(wallet_id, "could not check pool for unsaved wallet: {err}"),
        }
    }

    pub async fn release_wallet(&self, wallet_id: &str) -> Result<bool> {
        let released = self
            .mutate(move |record| record.release(wallet_id, now_secs()))
            .await?;
        debug!(wallet_id, released, "released pool wallet");
        Ok(released)
    }

    /// Remove an idle wallet and its key.
    pub async fn remove_wallet(&self, wallet_id: &str) -> Result<PoolWallet> {
        let vault = &self.vault;
        self.mutate(move |record| {
            let removed = record.remove(wallet_id)?;
            vault.delete(&removed.id)?;
            Ok(removed)
        })
        .await
    }

    /// Evict long-unused idle wallets, returning their ids.
    pub async fn cleanup_idle_wallets(&self, max_age_days: u32) -> Result<Vec<String>> {
        let vault = &self.vault;
        let evicted = self
            .mutate(move |record| {
                let evicted = record.cleanup_idle(max_age_days, now_secs());
                for wallet in &evicted {
                    vault.delete(&wallet.id)?;
                }
                Ok(evicted)
            })
            .await?;
        if !evicted.is_empty() {
            info!(count = evicted.len(), max_age_days, "evicted idle pool wallets");
        }
        Ok(evicted.into_iter().map(|wallet| wallet.id).collect())
    }

    pub async fn heal(&self) -> Result<usize> {
        let owners = Arc::clone(&self.owners);
        self.mutate(move |record| Ok(record.heal(owners.as_ref(), now_secs())))
            .await
    }

    pub fn wallets(&self) -> Result<Vec<PoolWallet>> {
        Ok(self.load()?.wallets)
    }

    pub fn wallet(&self, wallet_id: &str) -> Result<Option<PoolWallet>> {
        Ok(self
            .load()?
            .wallets
            .into_iter()
            .find(|wallet| wallet.id == wallet_id))
    }

    pub fn private_key(&self, wallet_id: &str) -> Result<LocalWallet> {
        self.vault.load(wallet_id)
    }

    /// Lock, load, apply `f`, save, and release on every path. Nothing is
    /// written when `f` fails.
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PoolRecord) -> Result<T> + Send,
        T: Send,
    {
        let token = self.lock.acquire().await?;
        let outcome = self.load().and_then(|mut record| {
            let value = f(&mut record)?;
            self.save(&record)?;
            Ok(value)
        });
        let released = self.lock.release(token).await;
        let value = outcome?;
        released?;
        Ok(value)
    }

    fn load(&self) -> Result<PoolRecord> {
        match fs::read(&self.pool_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(PoolRecord::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, record: &PoolRecord) -> Result<()> {
        let parent = self.pool_path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut temp, record)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.pool_path)
            .map_err(|err| PoolError::Io(err.error))?;
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLock;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct KnownOwners(Mutex<HashSet<String>>);

    impl KnownOwners {
        fn new(owners: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(owners.iter().map(|o| o.to_string()).collect())))
        }

        fn forget(&self, owner: &str) {
            self.0.lock().unwrap().remove(owner);
        }
    }

    impl OwnerDirectory for KnownOwners {
        fn exists(&self, owner: &str) -> bool {
            self.0.lock().unwrap().contains(owner)
        }
    }

    fn manager(dir: &Path, owners: Arc<KnownOwners>) -> WalletPoolManager {
        WalletPoolManager::open(dir, Arc::new(MemoryLock::default()), owners).unwrap()
    }

    #[tokio::test]
    async fn assign_reuses_idle_wallets() {
        let dir = tempfile::tempdir().unwrap();
        let pool = manager(dir.path(), KnownOwners::new(&["a", "b"]));

        let first = pool.assign_wallet("a").await.unwrap();
        assert_eq!(first.status, WalletStatus::Active);
        assert_eq!(pool.assign_wallet("a").await.unwrap().id, first.id);

        assert!(pool.release_wallet(&first.id).await.unwrap());
        let second = pool.assign_wallet("b").await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(pool.wallets().unwrap().len(), 1);

        let key = pool.private_key(&second.id).unwrap();
        assert_eq!(ethers_signers::Signer::address(&key), second.address);
    }

    #[tokio::test]
    async fn orphaned_assignments_are_healed_on_assign() {
        let dir = tempfile::tempdir().unwrap();
        let owners = KnownOwners::new(&["gone", "next"]);
        let pool = manager(dir.path(), owners.clone());

        let held = pool.assign_wallet("gone").await.unwrap();
        owners.forget("gone");
        let reassigned = pool.assign_wallet("next").await.unwrap();
        assert_eq!(reassigned.id, held.id);
        assert_eq!(reassigned.assigned_to.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn failed_save_leaves_no_orphan_key() {
        let dir = tempfile::tempdir().unwrap();
        let vault = KeyVault::open(dir.path().join(KEYS_DIR)).unwrap();
        let pool = WalletPoolManager {
            // Loads as empty, but the temp file for the save cannot be created.
            pool_path: dir.path().join("missing").join(POOL_FILE),
            lock: Arc::new(MemoryLock::default()),
            vault: vault.clone(),
            owners: Arc::new(AssumeOwnersPresent),
        };

        assert!(matches!(pool.assign_wallet("a").await, Err(PoolError::Io(_))));
        assert_eq!(fs::read_dir(vault.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn busy_wallets_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = manager(dir.path(), KnownOwners::new(&["a"]));
        let wallet = pool.assign_wallet("a").await.unwrap();

        assert!(matches!(
            pool.remove_wallet(&wallet.id).await,
            Err(PoolError::WalletBusy { .. })
        ));
        pool.release_wallet(&wallet.id).await.unwrap();
        pool.remove_wallet(&wallet.id).await.unwrap();
        assert!(pool.wallet(&wallet.id).unwrap().is_none());
        assert!(pool.private_key(&wallet.id).is_err());
        assert!(matches!(
            pool.release_wallet("missing").await,
            Err(PoolError::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_old_idle_wallets() {
        let dir = tempfile::tempdir().unwrap();
        let pool = manager(dir.path(), KnownOwners::new(&["a", "b"]));
        let a = pool.assign_wallet("a").await.unwrap();
        let b = pool.assign_wallet("b").await.unwrap();
        pool.release_wallet(&a.id).await.unwrap();

        assert!(pool.cleanup_idle_wallets(1).await.unwrap().is_empty());
        let evicted = pool.cleanup_idle_wallets(0).await.unwrap();
        assert_eq!(evicted, vec![a.id.clone()]);
        assert!(pool.wallet(&b.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn heal_repairs_flag_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let pool = manager(dir.path(), KnownOwners::new(&[]));
        let record = PoolRecord {
            wallets: vec![PoolWallet {
                id: "w".into(),
                address: Address::zero(),
                status: WalletStatus::Active,
                assigned_to: None,
                created_at: 0,
                last_used_at: 0,
            }],
        };
        pool.save(&record).unwrap();
        assert_eq!(pool.heal().await.unwrap(), 1);
        assert!(pool.wallets().unwrap()[0].is_consistent());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Assign(u8),
        Release(u8),
        Heal(Vec<u8>),
        Remove(u8),
        Corrupt(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Assign),
            (0u8..8).prop_map(Op::Release),
            proptest::collection::vec(0u8..6, 0..6).prop_map(Op::Heal),
            (0u8..8).prop_map(Op::Remove),
            (0u8..8).prop_map(Op::Corrupt),
        ]
    }

    struct Present(HashSet<String>);

    impl OwnerDirectory for Present {
        fn exists(&self, owner: &str) -> bool {
            self.0.contains(owner)
        }
    }

    proptest! {
        #[test]
        fn active_iff_assigned_after_heal_and_transitions(ops in proptest::collection::vec(op(), 1..60)) {
            let mut record = PoolRecord::default();
            let mut counter = 0u32;
            for (step, op) in ops.into_iter().enumerate() {
                let now = step as u64;
                match op {
                    Op::Assign(owner) => {
                        let wallet = record.assign(&format!("agent-{owner}"), now, || {
                            counter += 1;
                            Ok((format!("w{counter}"), Address::from_low_u64_be(u64::from(counter))))
                        }).unwrap();
                        prop_assert_eq!(wallet.status, WalletStatus::Active);
                    }
                    Op::Release(idx) => {
                        if let Some(id) = record.wallets.get(idx as usize).map(|w| w.id.clone()) {
                            record.release(&id, now).unwrap();
                        }
                    }
                    Op::Heal(alive) => {
                        let owners = Present(alive.iter().map(|o| format!("agent-{o}")).collect());
                        record.heal(&owners, now);
                    }
                    Op::Remove(idx) => {
                        if let Some(id) = record.wallets.get(idx as usize).map(|w| w.id.clone()) {
                            let busy = record.wallets[idx as usize].assigned_to.is_some();
                            prop_assert_eq!(record.remove(&id).is_err(), busy);
                        }
                    }
                    Op::Corrupt(idx) => {
                        // Simulates a crash between two field writes.
                        if let Some(wallet) = record.wallets.get_mut(idx as usize) {
                            wallet.status = WalletStatus::Active;
                            wallet.assigned_to = None;
                        }
                        record.heal(&AssumeOwnersPresent, now);
                    }
                }
                prop_assert!(record.is_consistent());
                let mut owners = HashSet::new();
                for wallet in &record.wallets {
                    if let Some(owner) = &wallet.assigned_to {
                        prop_assert!(owners.insert(owner.clone()), "owner holds two wallets");
                    }
                }
            }
        }
    }
}
