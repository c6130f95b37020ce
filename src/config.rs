//! Minimal account and disc-set configuration: which accounts exist, their
//! storage quota, and which directories back each one's object store.
//!
//! Full section-file parsing (the kind that would let an admin define
//! arbitrary typed config sections) is out of scope here; this is a flat
//! JSON document loaded once at daemon startup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use crate::raid::DiscSet;

/// One account's storage location and quota.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    pub account_id: u32,
    pub disc_set: DiscSetConfig,
    pub soft_limit_bytes: u64,
    pub hard_limit_bytes: u64,
}

/// On-disc shape of a [`DiscSet`]: either a single directory or three,
/// striped.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DiscSetConfig {
    Single { dir: PathBuf, block_size: u64 },
    Triple {
        disc0: PathBuf,
        disc1: PathBuf,
        disc2: PathBuf,
        block_size: u64,
    },
}

impl DiscSetConfig {
    pub fn to_disc_set(&self) -> DiscSet {
        match self {
            DiscSetConfig::Single { dir, block_size } => DiscSet::single(dir.clone(), *block_size),
            DiscSetConfig::Triple {
                disc0,
                disc1,
                disc2,
                block_size,
            } => DiscSet::triple(disc0.clone(), disc1.clone(), disc2.clone(), *block_size),
        }
    }
}

/// All configured accounts, keyed by account ID.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    pub accounts: HashMap<u32, AccountConfig>,
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: StoreConfig =
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        for (id, account) in &config.accounts {
            if account.account_id != *id {
                bail!(
                    "account {} has mismatched account_id {} in config",
                    id,
                    account.account_id
                );
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }

    pub fn account(&self, account_id: u32) -> Option<&AccountConfig> {
        self.accounts.get(&account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_json() {
        let mut config = StoreConfig::default();
        config.accounts.insert(
            1,
            AccountConfig {
                account_id: 1,
                disc_set: DiscSetConfig::Single {
                    dir: PathBuf::from("/var/lib/store/0"),
                    block_size: 4096,
                },
                soft_limit_bytes: 1_000_000,
                hard_limit_bytes: 2_000_000,
            },
        );

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        config.save(&path).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        let account = loaded.account(1).unwrap();
        assert_eq!(account.soft_limit_bytes, 1_000_000);
        assert!(matches!(account.disc_set, DiscSetConfig::Single { block_size: 4096, .. }));
    }

    #[test]
    fn rejects_mismatched_account_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(
            &path,
            r#"{"accounts":{"1":{"account_id":2,"disc_set":{"dir":"/x","block_size":4096},"soft_limit_bytes":0,"hard_limit_bytes":0}}}"#,
        )
        .unwrap();
        assert!(StoreConfig::load(&path).is_err());
    }
}
