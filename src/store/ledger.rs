//! Per-account info record: the authoritative block-usage counters and
//! object-ID allocator, persisted as a single small object through the
//! striped storage layer.
//!
//! Counters are trusted between housekeeping passes; housekeeping recomputes
//! them from a directory walk and calls [`AccountLedger::correct_all_used_values`]
//! when drift is found.

use std::io::{Read, Write};

use anyhow::{bail, Context, Error};

use crate::raid::{self, DiscSet, RaidFileWriter};

const LEDGER_MAGIC_V1: u32 = 0x696e_6631; // "inf1"
const LEDGER_OBJECT_NAME: &str = "info";

/// Number of mutations [`AccountLedger::save`] will buffer before forcing a
/// flush even when called with `allow_delay = true`.
pub const SAVE_DELAY_WINDOW: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLedger {
    pub account_id: u32,
    pub last_object_id: u64,
    pub blocks_used: u64,
    pub blocks_in_old_files: u64,
    pub blocks_in_deleted_files: u64,
    pub blocks_in_directories: u64,
    pub soft_limit_blocks: u64,
    pub hard_limit_blocks: u64,
    pub client_marker: u64,
    pub name: String,
    pub read_only: bool,

    /// Mutations applied since the last flush to storage.
    dirty_count: u32,
}

impl AccountLedger {
    pub fn new(account_id: u32, name: String, soft_limit_blocks: u64, hard_limit_blocks: u64) -> Self {
        Self {
            account_id,
            last_object_id: 0,
            blocks_used: 0,
            blocks_in_old_files: 0,
            blocks_in_deleted_files: 0,
            blocks_in_directories: 0,
            soft_limit_blocks,
            hard_limit_blocks,
            client_marker: 0,
            name,
            read_only: false,
            dirty_count: 0,
        }
    }

    /// Allocate and return the next object ID, marking the ledger dirty.
    pub fn allocate_object_id(&mut self) -> u64 {
        self.last_object_id += 1;
        self.dirty_count += 1;
        self.last_object_id
    }

    pub fn change_blocks_used(&mut self, delta: i64) {
        self.blocks_used = apply_delta(self.blocks_used, delta);
        self.dirty_count += 1;
    }

    pub fn change_blocks_in_old_files(&mut self, delta: i64) {
        self.blocks_in_old_files = apply_delta(self.blocks_in_old_files, delta);
        self.dirty_count += 1;
    }

    pub fn change_blocks_in_deleted_files(&mut self, delta: i64) {
        self.blocks_in_deleted_files = apply_delta(self.blocks_in_deleted_files, delta);
        self.dirty_count += 1;
    }

    pub fn change_blocks_in_directories(&mut self, delta: i64) {
        self.blocks_in_directories = apply_delta(self.blocks_in_directories, delta);
        self.dirty_count += 1;
    }

    /// Would accepting `additional_blocks` more push usage over the hard
    /// limit? The caller rejects the mutation with `StorageLimitExceeded`
    /// if so.
    pub fn would_exceed_hard_limit(&self, additional_blocks: i64) -> bool {
        apply_delta(self.blocks_used, additional_blocks) > self.hard_limit_blocks
    }

    pub fn blocks_over_soft_limit(&self) -> u64 {
        self.blocks_used.saturating_sub(self.soft_limit_blocks)
    }

    /// Housekeeping calls this after an independent recount to fix drift
    /// between the counters and what's actually on disc.
    pub fn correct_all_used_values(
        &mut self,
        blocks_used: u64,
        blocks_in_old_files: u64,
        blocks_in_deleted_files: u64,
        blocks_in_directories: u64,
    ) {
        self.blocks_used = blocks_used;
        self.blocks_in_old_files = blocks_in_old_files;
        self.blocks_in_deleted_files = blocks_in_deleted_files;
        self.blocks_in_directories = blocks_in_directories;
        self.dirty_count += 1;
    }

    /// Flush to storage if there's anything to flush and either the caller
    /// insists (`allow_delay = false`, e.g. session finish) or the delay
    /// window has been exceeded.
    pub fn save(&mut self, disc_set: &DiscSet, allow_delay: bool) -> Result<(), Error> {
        if self.dirty_count == 0 {
            return Ok(());
        }
        if allow_delay && self.dirty_count < SAVE_DELAY_WINDOW {
            return Ok(());
        }
        self.force_save(disc_set)
    }

    pub fn force_save(&mut self, disc_set: &DiscSet) -> Result<(), Error> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        let mut w = RaidFileWriter::create(disc_set, LEDGER_OBJECT_NAME)?;
        w.write_all(&buf)?;
        w.commit(disc_set.is_raided())?;
        self.dirty_count = 0;
        Ok(())
    }

    pub fn load(disc_set: &DiscSet, account_id: u32) -> Result<Self, Error> {
        let (mut stream, _mode) = raid::open(disc_set, LEDGER_OBJECT_NAME)
            .with_context(|| format!("loading ledger for account {}", account_id))?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        let mut ledger = Self::read_from(&mut &buf[..])?;
        if ledger.account_id != account_id {
            bail!(
                "ledger account_id mismatch: expected {}, found {}",
                account_id,
                ledger.account_id
            );
        }
        ledger.dirty_count = 0;
        Ok(ledger)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&LEDGER_MAGIC_V1.to_be_bytes())?;
        w.write_all(&self.account_id.to_be_bytes())?;
        w.write_all(&self.last_object_id.to_be_bytes())?;
        w.write_all(&self.blocks_used.to_be_bytes())?;
        w.write_all(&self.blocks_in_old_files.to_be_bytes())?;
        w.write_all(&self.blocks_in_deleted_files.to_be_bytes())?;
        w.write_all(&self.blocks_in_directories.to_be_bytes())?;
        w.write_all(&self.soft_limit_blocks.to_be_bytes())?;
        w.write_all(&self.hard_limit_blocks.to_be_bytes())?;
        w.write_all(&self.client_marker.to_be_bytes())?;
        w.write_all(&[self.read_only as u8])?;
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() > u16::MAX as usize {
            bail!("account name too long");
        }
        w.write_all(&(name_bytes.len() as u16).to_be_bytes())?;
        w.write_all(name_bytes)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).context("reading ledger magic")?;
        if u32::from_be_bytes(magic) != LEDGER_MAGIC_V1 {
            bail!("bad ledger magic (not a v1 info record)");
        }
        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let account_id = u32::from_be_bytes(buf4);

        let mut buf8 = [0u8; 8];
        let mut read_u64 = |r: &mut R| -> Result<u64, Error> {
            r.read_exact(&mut buf8)?;
            Ok(u64::from_be_bytes(buf8))
        };
        let last_object_id = read_u64(r)?;
        let blocks_used = read_u64(r)?;
        let blocks_in_old_files = read_u64(r)?;
        let blocks_in_deleted_files = read_u64(r)?;
        let blocks_in_directories = read_u64(r)?;
        let soft_limit_blocks = read_u64(r)?;
        let hard_limit_blocks = read_u64(r)?;
        let client_marker = read_u64(r)?;

        let mut flag = [0u8; 1];
        r.read_exact(&mut flag)?;
        let read_only = flag[0] != 0;

        let mut len_buf = [0u8; 2];
        r.read_exact(&mut len_buf)?;
        let name_len = u16::from_be_bytes(len_buf) as usize;
        let mut name_bytes = vec![0u8; name_len];
        r.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes).context("ledger account name is not valid utf-8")?;

        Ok(Self {
            account_id,
            last_object_id,
            blocks_used,
            blocks_in_old_files,
            blocks_in_deleted_files,
            blocks_in_directories,
            soft_limit_blocks,
            hard_limit_blocks,
            client_marker,
            name,
            read_only,
            dirty_count: 0,
        })
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value + delta as u64
    } else {
        value.saturating_sub((-delta) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_and_save_round_trips() {
        let dir = tempdir().unwrap();
        let disc_set = DiscSet::single(dir.path().to_path_buf(), 4096);
        let mut ledger = AccountLedger::new(1, "acct".to_string(), 1000, 2000);

        let id1 = ledger.allocate_object_id();
        let id2 = ledger.allocate_object_id();
        assert_eq!((id1, id2), (1, 2));

        ledger.change_blocks_used(50);
        ledger.force_save(&disc_set).unwrap();

        let loaded = AccountLedger::load(&disc_set, 1).unwrap();
        assert_eq!(loaded.last_object_id, 2);
        assert_eq!(loaded.blocks_used, 50);
    }

    #[test]
    fn delayed_save_waits_for_window() {
        let dir = tempdir().unwrap();
        let disc_set = DiscSet::single(dir.path().to_path_buf(), 4096);
        let mut ledger = AccountLedger::new(1, "acct".to_string(), 1000, 2000);
        ledger.force_save(&disc_set).unwrap();

        ledger.change_blocks_used(1);
        ledger.save(&disc_set, true).unwrap();
        assert!(AccountLedger::load(&disc_set, 1).unwrap().blocks_used == 0);

        for _ in 0..SAVE_DELAY_WINDOW {
            ledger.change_blocks_used(1);
        }
        ledger.save(&disc_set, true).unwrap();
        assert!(AccountLedger::load(&disc_set, 1).unwrap().blocks_used > 0);
    }

    #[test]
    fn hard_limit_check() {
        let mut ledger = AccountLedger::new(1, "acct".to_string(), 100, 200);
        ledger.change_blocks_used(150);
        assert!(!ledger.would_exceed_hard_limit(40));
        assert!(ledger.would_exceed_hard_limit(60));
    }
}
