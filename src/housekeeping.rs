//! Background reclamation pass: walks every configured account's directory
//! tree, ranks deleted/old-version entries for removal, and deletes down to
//! each account's soft limit -- stitching patch chains back together as
//! entries in the middle of a chain are reclaimed.
//!
//! Runs as its own loop (the daemon forks or spawns a thread for it once at
//! startup) so a live session never has to do this work inline. Lock
//! contention with live sessions is arbitrated entirely through
//! [`crate::store::lock::HousekeepingIpc`]: this module never blocks
//! indefinitely on an account's lock, and checks the IPC channel between
//! units of work so it can release an account early.

use std::collections::HashMap;

use anyhow::{Context as _, Error};
use log::{info, warn};

use crate::cipher::Keystore;
use crate::codec;
use crate::config::StoreConfig;
use crate::raid::{self, DiscSet, RaidFileWriter};
use crate::store::context::{object_path, resolve_plaintext};
use crate::store::directory::{DirectoryEntry, EntryFlags, StoreDirectory};
use crate::store::ledger::AccountLedger;
use crate::store::lock::{AccountLock, HousekeepingIpc};

/// How many lock attempts (1 second apart) to make before skipping an
/// account for this round.
const LOCK_ATTEMPTS: u32 = 3;

/// A deleted/old-version entry considered for removal, ranked by how long
/// it's been superseded and how far back in its name's version history it
/// sits.
#[derive(Debug, Clone)]
struct Candidate {
    dir_id: u64,
    object_id: u64,
    /// How many newer entries of the same name exist above this one; 0
    /// would be the live entry itself (never a candidate).
    age_within_mark: u32,
    size_blocks: u64,
}

fn candidate_rank_key(c: &Candidate) -> (std::cmp::Reverse<u32>, u32, u64) {
    // age desc, mark-number asc, object ID asc: oldest-superseded first,
    // ties broken toward the lower version number then lower object ID.
    (std::cmp::Reverse(c.age_within_mark), c.age_within_mark, c.object_id)
}

struct ScanTotals {
    blocks_used: u64,
    blocks_in_old_files: u64,
    blocks_in_deleted_files: u64,
    blocks_in_directories: u64,
}

/// Recursively scans `dir_id` and its subtree: accumulates block-usage
/// totals, eagerly deletes RemoveASAP entries that are also Deleted or
/// OldVersion, and gathers removal candidates from the rest.
fn scan_directory(
    disc_set: &DiscSet,
    dir_id: u64,
    totals: &mut ScanTotals,
    candidates: &mut Vec<Candidate>,
    empty_dirs: &mut Vec<u64>,
) -> Result<(), Error> {
    let (mut stream, _mode) = raid::open(disc_set, &object_path(dir_id))
        .with_context(|| format!("opening directory {} during scan", dir_id))?;
    let mut bytes = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut bytes)?;
    totals.blocks_in_directories += round_up_to_blocks(bytes.len() as u64, disc_set.block_size());
    let mut dir = StoreDirectory::read_from(&mut &bytes[..])?;

    let mut removed_eagerly = false;
    dir.entries.retain(|e| {
        let eager = e.flags.contains(EntryFlags::REMOVE_ASAP)
            && (e.flags.contains(EntryFlags::DELETED) || e.flags.contains(EntryFlags::OLD_VERSION));
        if eager {
            removed_eagerly = true;
        }
        !eager
    });
    if removed_eagerly {
        save_directory(disc_set, dir_id, &dir)?;
    }

    let mut by_name: HashMap<Vec<u8>, Vec<&DirectoryEntry>> = HashMap::new();
    for entry in &dir.entries {
        by_name.entry(entry.name_bytes().to_vec()).or_default().push(entry);
    }

    let child_dirs: Vec<u64> = dir
        .entries
        .iter()
        .filter(|e| e.flags.contains(EntryFlags::DIRECTORY))
        .map(|e| e.object_id)
        .collect();

    for entry in &dir.entries {
        if entry.flags.contains(EntryFlags::DIRECTORY) {
            continue;
        }
        totals.blocks_used += entry.size_blocks;
        if entry.flags.contains(EntryFlags::OLD_VERSION) {
            totals.blocks_in_old_files += entry.size_blocks;
        }
        if entry.flags.contains(EntryFlags::DELETED) {
            totals.blocks_in_deleted_files += entry.size_blocks;
        }
        if !entry.is_deleted() && !entry.flags.contains(EntryFlags::OLD_VERSION) {
            continue;
        }
        let siblings = &by_name[entry.name_bytes()];
        let age = siblings
            .iter()
            .position(|e| e.object_id == entry.object_id)
            .unwrap_or(0) as u32;
        candidates.push(Candidate {
            dir_id,
            object_id: entry.object_id,
            age_within_mark: age,
            size_blocks: entry.size_blocks,
        });
    }

    if dir.entries.is_empty() && dir_id != 0 {
        empty_dirs.push(dir_id);
    }

    for child in child_dirs {
        scan_directory(disc_set, child, totals, candidates, empty_dirs)?;
    }
    Ok(())
}

fn round_up_to_blocks(bytes: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        0
    } else {
        (bytes + block_size - 1) / block_size
    }
}

fn save_directory(disc_set: &DiscSet, object_id: u64, directory: &StoreDirectory) -> Result<(), Error> {
    let mut buf = Vec::new();
    directory.write_to(&mut buf)?;
    let mut w = RaidFileWriter::create(disc_set, &object_path(object_id))?;
    w.write_all(&buf)?;
    w.commit(disc_set.is_raided())
}

fn load_object_bytes(disc_set: &DiscSet, object_id: u64) -> Result<Vec<u8>, Error> {
    let (mut stream, _mode) = raid::open(disc_set, &object_path(object_id))?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut buf)?;
    Ok(buf)
}

/// Cap on how many candidates a single scan keeps in memory, expressed as
/// a multiple of the account's deletion target (in blocks) plus a floor so
/// small accounts still get a usable candidate set.
fn candidate_cap(deletion_target_blocks: u64) -> usize {
    (deletion_target_blocks as usize).saturating_mul(4).max(256)
}

/// One account's worth of the scan: acquires the lock, scans, corrects
/// drifted counters, and deletes candidates down to the soft limit.
/// Returns `Ok(true)` if the account was fully processed, `Ok(false)` if
/// the lock could not be acquired or housekeeping was asked to yield
/// partway through.
pub fn process_account(
    disc_set: &DiscSet,
    account_root: &std::path::Path,
    keystore: &Keystore,
    account_id: u32,
    ipc: &HousekeepingIpc,
) -> Result<bool, Error> {
    let lock = match AccountLock::try_acquire(account_root, LOCK_ATTEMPTS)? {
        Some(lock) => lock,
        None => return Ok(false),
    };

    let mut ledger = AccountLedger::load(disc_set, account_id)?;
    let deletion_target = ledger.blocks_over_soft_limit();

    let mut totals = ScanTotals {
        blocks_used: 0,
        blocks_in_old_files: 0,
        blocks_in_deleted_files: 0,
        blocks_in_directories: 0,
    };
    let mut candidates = Vec::new();
    let mut empty_dirs = Vec::new();
    scan_directory(disc_set, 0, &mut totals, &mut candidates, &mut empty_dirs)?;

    let cap = candidate_cap(deletion_target);
    candidates.sort_by_key(candidate_rank_key);
    candidates.reverse();
    if candidates.len() > cap {
        info!(
            "account {}: dropping {} lowest-ranked deletion candidates over cap {}",
            account_id,
            candidates.len() - cap,
            cap
        );
        candidates.truncate(cap);
    }

    if totals.blocks_used != ledger.blocks_used
        || totals.blocks_in_old_files != ledger.blocks_in_old_files
        || totals.blocks_in_deleted_files != ledger.blocks_in_deleted_files
        || totals.blocks_in_directories != ledger.blocks_in_directories
    {
        ledger.correct_all_used_values(
            totals.blocks_used,
            totals.blocks_in_old_files,
            totals.blocks_in_deleted_files,
            totals.blocks_in_directories,
        );
        ledger.force_save(disc_set)?;
    }

    let mut freed = 0u64;
    let mut dirs_touched_empty: Vec<u64> = Vec::new();
    for candidate in &candidates {
        if freed >= deletion_target {
            break;
        }
        if ipc.should_yield_account(account_id) {
            drop(lock);
            return Ok(false);
        }
        freed += candidate.size_blocks;
        let became_empty = delete_candidate(disc_set, keystore, candidate)?;
        if became_empty {
            dirs_touched_empty.push(candidate.dir_id);
        }
    }
    dirs_touched_empty.extend(empty_dirs);

    ledger.change_blocks_used(-(freed as i64));
    ledger.force_save(disc_set)?;

    collapse_empty_directories(disc_set, account_id, dirs_touched_empty)?;

    drop(lock);
    Ok(true)
}

/// Delete one candidate entry, rewriting its neighbors if it sat inside a
/// patch chain. Returns whether the containing directory is now empty.
fn delete_candidate(disc_set: &DiscSet, keystore: &Keystore, candidate: &Candidate) -> Result<bool, Error> {
    let (mut stream, _mode) = raid::open(disc_set, &object_path(candidate.dir_id))?;
    let mut bytes = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut bytes)?;
    let mut dir = StoreDirectory::read_from(&mut &bytes[..])?;

    let entry = match dir.find_by_object_id(candidate.object_id) {
        Some(e) => e.clone(),
        None => return Ok(false), // already gone (eager RemoveASAP pass beat us to it)
    };

    let has_older = entry.depends_older != 0;
    let has_newer = entry.depends_newer != 0;

    match (has_older, has_newer) {
        (false, false) => {
            // Standalone full: nothing to rewire, just drop it.
        }
        (false, true) => {
            // Tail of chain: only a newer neighbor points back at us.
            if let Some(newer) = dir.find_by_object_id_mut(entry.depends_newer) {
                newer.depends_older = 0;
            }
        }
        (true, false) => {
            // Head of chain: we're a reverse patch whose base is this
            // entry's own object, and the older neighbor depends_newer
            // points at us. Fold our reverse-patch content onto the
            // older neighbor so it becomes a standalone full again.
            rewire_head(disc_set, keystore, &mut dir, &entry)?;
        }
        (true, true) => {
            rewire_middle(disc_set, keystore, &mut dir, &entry)?;
        }
    }

    dir.entries.retain(|e| e.object_id != candidate.object_id);
    save_directory(disc_set, candidate.dir_id, &dir)?;
    Ok(dir.entries.is_empty())
}

fn rewire_head(disc_set: &DiscSet, keystore: &Keystore, dir: &mut StoreDirectory, entry: &DirectoryEntry) -> Result<(), Error> {
    let older_id = entry.depends_older;
    let older_entry = dir
        .find_by_object_id(older_id)
        .cloned()
        .context("head rewrite: older neighbor missing from directory")?;
    let older_bytes = load_object_bytes(disc_set, older_id)?;
    let older_decoded = codec::decode_stream(&older_bytes[..], keystore)?;

    // `entry` is the newest link in the chain (whole file); the older
    // neighbor's reverse patch is expressed against entry's own plaintext
    // and block layout.
    let entry_bytes = load_object_bytes(disc_set, entry.object_id)?;
    let entry_decoded = codec::decode_stream(&entry_bytes[..], keystore)?;
    let entry_plaintext = codec::decode_body(keystore, &entry_decoded, None)?;
    let rebuilt_older_plaintext = codec::combine(keystore, &older_decoded, &entry_plaintext, &entry_decoded.index)?;

    let whole = codec::collapse_to_whole_file(
        keystore,
        &rebuilt_older_plaintext,
        dir.container_id,
        older_entry.modification_time_us,
        older_entry.name_bytes(),
        &older_entry.attributes,
    )?;
    let new_blocks = round_up_to_blocks(whole.len() as u64, disc_set.block_size());
    let mut w = RaidFileWriter::create(disc_set, &object_path(older_id))?;
    w.write_all(&whole)?;
    w.commit(true)?;

    if let Some(older_mut) = dir.find_by_object_id_mut(older_id) {
        older_mut.depends_newer = 0;
        older_mut.size_blocks = new_blocks;
    }
    Ok(())
}

fn rewire_middle(disc_set: &DiscSet, keystore: &Keystore, dir: &mut StoreDirectory, entry: &DirectoryEntry) -> Result<(), Error> {
    let older_id = entry.depends_older;
    let newer_id = entry.depends_newer;

    let older_entry = dir
        .find_by_object_id(older_id)
        .cloned()
        .context("middle rewrite: older neighbor missing")?;
    let older_bytes = load_object_bytes(disc_set, older_id)?;
    let older_decoded = codec::decode_stream(&older_bytes[..], keystore)?;
    let this_bytes = load_object_bytes(disc_set, entry.object_id)?;
    let this_decoded = codec::decode_stream(&this_bytes[..], keystore)?;

    // The newer neighbor's plaintext is the base both `entry`'s patch and
    // (transitively, through `entry`) `older_id`'s patch are expressed
    // against; combine_patches folds `older_id`'s patch to depend on it
    // directly instead of on `entry`'s now-disappearing plaintext.
    let newer_bytes = load_object_bytes(disc_set, newer_id)?;
    let newer_decoded = codec::decode_stream(&newer_bytes[..], keystore)?;
    let newer_plaintext = resolve_plaintext(disc_set, keystore, dir, newer_id)?;

    let mut keep_alive = ();
    let combined = codec::combine_patches(
        keystore,
        &this_decoded,
        &newer_plaintext,
        &newer_decoded.index,
        &older_decoded,
        dir.container_id,
        newer_id,
        older_entry.name_bytes(),
        &older_entry.attributes,
        &mut keep_alive,
    )?;
    let new_blocks = round_up_to_blocks(combined.len() as u64, disc_set.block_size());
    let mut w = RaidFileWriter::create(disc_set, &object_path(older_id))?;
    w.write_all(&combined)?;
    w.commit(true)?;

    if let Some(older_mut) = dir.find_by_object_id_mut(older_id) {
        older_mut.depends_newer = newer_id;
        older_mut.size_blocks = new_blocks;
    }
    if let Some(newer_mut) = dir.find_by_object_id_mut(newer_id) {
        newer_mut.depends_older = older_id;
    }
    Ok(())
}

/// Iteratively remove directories that turned empty and whose parent
/// entry is flagged Deleted, until nothing more qualifies. Root (ID 0) is
/// never a candidate.
fn collapse_empty_directories(disc_set: &DiscSet, account_id: u32, mut queue: Vec<u64>) -> Result<(), Error> {
    use std::collections::HashSet;
    let mut seen = HashSet::new();

    while let Some(dir_id) = queue.pop() {
        if dir_id == 0 || !seen.insert(dir_id) {
            continue;
        }
        let (mut stream, _mode) = match raid::open(disc_set, &object_path(dir_id)) {
            Ok(v) => v,
            Err(_) => continue, // already removed this pass
        };
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut bytes)?;
        let dir = StoreDirectory::read_from(&mut &bytes[..])?;
        if !dir.entries.is_empty() {
            continue;
        }
        let parent_id = dir.container_id;
        if parent_id == dir_id {
            continue;
        }

        let (mut parent_stream, _mode) = raid::open(disc_set, &object_path(parent_id))?;
        let mut parent_bytes = Vec::new();
        std::io::Read::read_to_end(&mut parent_stream, &mut parent_bytes)?;
        let mut parent = StoreDirectory::read_from(&mut &parent_bytes[..])?;

        // find_by_object_id does not filter Deleted entries, unlike find_by_name.
        let parent_entry_deleted = parent
            .find_by_object_id(dir_id)
            .map(|e| e.flags.contains(EntryFlags::DELETED))
            .unwrap_or(false);
        if !parent_entry_deleted {
            continue;
        }

        remove_object(disc_set, dir_id)?;
        parent.entries.retain(|e| e.object_id != dir_id);
        save_directory(disc_set, parent_id, &parent)?;

        if parent.entries.is_empty() {
            queue.push(parent_id);
        }
        info!("account {}: removed empty deleted directory {}", account_id, dir_id);
    }
    Ok(())
}

fn remove_object(disc_set: &DiscSet, object_id: u64) -> Result<(), Error> {
    let path = object_path(object_id);
    for disc in disc_set.discs() {
        for suffix in ["rf", "rfw"] {
            let candidate = disc.join(format!("{path}.{suffix}"));
            if candidate.exists() {
                std::fs::remove_file(&candidate)?;
            }
        }
    }
    Ok(())
}

/// One pass over every configured account. Skips accounts whose lock is
/// contended and logs a warning rather than treating that as fatal --
/// they'll be picked up again next round.
pub fn run_pass(config: &StoreConfig, keystore: &Keystore, ipc: &HousekeepingIpc) {
    for (account_id, account) in &config.accounts {
        if ipc.poll().is_some() {
            warn!("housekeeping pass interrupted by signal, stopping early");
            return;
        }
        let disc_set = account.disc_set.to_disc_set();
        let account_root = disc_set.discs()[0].clone();
        match process_account(&disc_set, &account_root, keystore, *account_id, ipc) {
            Ok(true) => info!("account {}: housekeeping pass complete", account_id),
            Ok(false) => info!("account {}: skipped this round (lock contention or yield)", account_id),
            Err(e) => warn!("account {}: housekeeping pass failed: {:#}", account_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherTag;
    use crate::store::context::Context;
    use tempfile::tempdir;

    fn keystore() -> Keystore {
        let len = CipherTag::Aes128Cbc.openssl_cipher().key_len();
        Keystore::new(vec![1; len], vec![2; len], CipherTag::Aes128Cbc).unwrap()
    }

    fn encode_whole(keystore: &Keystore, name: &[u8], mtime: u64, plaintext: &[u8]) -> Vec<u8> {
        use crate::codec::{ChunkSizeConfig, EncodeParams, FileKind};
        let params = EncodeParams {
            keystore,
            container_id: 0,
            modification_time_us: mtime,
            filename: name,
            attributes: b"",
            compress: true,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        codec::encode_whole_file(plaintext, plaintext.len() as u64, FileKind::Regular, &params, &mut out).unwrap();
        out
    }

    fn encode_diff_against(keystore: &Keystore, name: &[u8], mtime: u64, plaintext: &[u8], old_id: u64, old_bytes: &[u8]) -> Vec<u8> {
        use crate::codec::{ChunkSizeConfig, EncodeParams};
        let old_index = codec::decode_stream(old_bytes, keystore).unwrap().index;
        let params = EncodeParams {
            keystore,
            container_id: 0,
            modification_time_us: mtime,
            filename: name,
            attributes: b"",
            compress: true,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        let mut keep_alive = ();
        codec::encode_diff(plaintext, old_id, &old_index, &params, &mut out, &mut keep_alive).unwrap();
        out
    }

    #[test]
    fn deletes_old_version_down_to_soft_limit() {
        let dir = tempdir().unwrap();
        let disc_set = DiscSet::single(dir.path().to_path_buf(), 4096);
        let root = StoreDirectory::new(0);
        save_directory(&disc_set, 0, &root).unwrap();

        let ledger = AccountLedger::new(1, "acct".into(), 1, 1_000_000);
        let ks = keystore();
        let mut ctx = Context::new(1, false, disc_set.clone(), ks.clone(), ledger);

        let v1 = vec![1u8; 20_000];
        let stream1 = encode_whole(&ks, b"a.bin", 1000, &v1);
        let id1 = ctx.add_file(0, 1000, b"a.bin", b"", 0, &stream1).unwrap();
        let mut v2 = v1.clone();
        v2[0] = 2;
        let old_bytes = load_object_bytes(&disc_set, id1).unwrap();
        let stream2 = encode_diff_against(&ks, b"a.bin", 2000, &v2, id1, &old_bytes);
        let _id2 = ctx.add_file(0, 2000, b"a.bin", b"", id1, &stream2).unwrap();
        ctx.ledger.force_save(&disc_set).unwrap();

        let ipc = HousekeepingIpc::new();
        let processed = process_account(&disc_set, dir.path(), &keystore(), 1, &ipc).unwrap();
        assert!(processed);

        let final_dir = StoreDirectory::read_from(&mut &load_object_bytes(&disc_set, 0).unwrap()[..]).unwrap();
        assert!(final_dir.find_by_object_id(id1).is_none() || !final_dir.entries.iter().any(|e| e.object_id == id1));
    }

    #[test]
    fn candidate_cap_has_a_floor() {
        assert_eq!(candidate_cap(0), 256);
        assert_eq!(candidate_cap(1000), 4000);
    }
}
