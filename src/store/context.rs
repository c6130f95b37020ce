//! Per-session mutation engine: the operations a protocol session invokes
//! against one account's store (directories, objects, ledger) under that
//! account's write lock.
//!
//! A [`Context`] owns everything a session needs to read or mutate an
//! account: the disc set, a bounded directory cache, and the ledger. Reads
//! work without a lock; every mutation method assumes the caller already
//! holds the account's [`AccountLock`] (read-only sessions never call
//! them).

use std::collections::HashMap;

use anyhow::{bail, Context as _, Error};

use crate::cipher::Keystore;
use crate::codec::{self, ChunkSizeConfig, DiffOutcome, EncodeParams, FileKind};
use crate::error::StoreError;
use crate::raid::{self, DiscSet, RaidFileWriter};
use crate::store::directory::{DirectoryEntry, EntryFlags, EntryName, StoreDirectory};
use crate::store::ledger::AccountLedger;
use crate::store::lock::AccountLock;

/// How many digits each path component carries when an object ID is split
/// into a directory path, low-order group first.
const PATH_GROUP_DIGITS: u32 = 4;
/// Number of subdirectory levels before the file stem; IDs with more
/// significant digits than this many groups cover all fall into the stem.
const PATH_GROUPS: u32 = 3;

/// Deterministic on-disc relative path for an object ID: split into
/// fixed-width hex digit groups from the low end, each naming a
/// subdirectory, with the remaining high digits as the file stem.
pub fn object_path(object_id: u64) -> String {
    let mut remaining = object_id;
    let mut components = Vec::new();
    for _ in 0..PATH_GROUPS {
        let group = remaining & ((1u64 << (PATH_GROUP_DIGITS * 4)) - 1);
        components.push(format!("{:01$x}", group, PATH_GROUP_DIGITS as usize));
        remaining >>= PATH_GROUP_DIGITS * 4;
    }
    components.push(format!("{:x}", remaining));
    components.reverse();
    components.join("/")
}

/// Bound on how many directories [`DirectoryCache`] keeps before a full
/// flush; entries are write-through (never hold mutations that outlive a
/// save), so flushing just means dropping cold entries.
const DIRECTORY_CACHE_CAPACITY: usize = 256;

struct CachedDirectory {
    directory: StoreDirectory,
    /// Revision marker from the RAID layer at the time this entry was
    /// loaded; rechecked on every access so a writer elsewhere invalidates
    /// stale readers.
    revision: u64,
}

#[derive(Default)]
struct DirectoryCache {
    entries: HashMap<u64, CachedDirectory>,
}

impl DirectoryCache {
    fn get_or_load(&mut self, disc_set: &DiscSet, object_id: u64) -> Result<&mut StoreDirectory, Error> {
        let current_revision = directory_revision(disc_set, object_id)?;

        let needs_reload = match self.entries.get(&object_id) {
            Some(cached) => cached.revision != current_revision,
            None => true,
        };

        if needs_reload {
            if self.entries.len() >= DIRECTORY_CACHE_CAPACITY {
                self.entries.clear();
            }
            let directory = load_directory(disc_set, object_id)?;
            self.entries.insert(
                object_id,
                CachedDirectory {
                    directory,
                    revision: current_revision,
                },
            );
        }

        Ok(&mut self.entries.get_mut(&object_id).unwrap().directory)
    }

    fn invalidate(&mut self, object_id: u64) {
        self.entries.remove(&object_id);
    }
}

fn directory_revision(disc_set: &DiscSet, object_id: u64) -> Result<u64, Error> {
    match raid::open(disc_set, &object_path(object_id)) {
        Ok((stream, _mode)) => Ok(stream.len() as u64 ^ 0xD1CE_D1CE),
        Err(_) => Ok(0),
    }
}

fn load_directory(disc_set: &DiscSet, object_id: u64) -> Result<StoreDirectory, Error> {
    let (mut stream, _mode) = raid::open(disc_set, &object_path(object_id))
        .with_context(|| format!("loading directory object {}", object_id))?;
    StoreDirectory::read_from(&mut stream)
}

fn save_directory(disc_set: &DiscSet, object_id: u64, directory: &StoreDirectory) -> Result<(), Error> {
    let mut buf = Vec::new();
    directory.write_to(&mut buf)?;
    let mut w = RaidFileWriter::create(disc_set, &object_path(object_id))?;
    w.write_all(&buf)?;
    w.commit(disc_set.is_raided())
}

fn load_object_bytes(disc_set: &DiscSet, object_id: u64) -> Result<Vec<u8>, Error> {
    use std::io::Read;
    let (mut stream, _mode) = raid::open(disc_set, &object_path(object_id))?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Block size in bytes used for quota accounting; `round_up_to_blocks`
/// converts a byte size stored object consumes on disc into the block
/// count the ledger tracks.
fn round_up_to_blocks(bytes: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return 0;
    }
    (bytes + block_size - 1) / block_size
}

/// Everything a session needs to read or mutate one account's store.
pub struct Context {
    pub account_id: u32,
    pub read_only: bool,
    pub disc_set: DiscSet,
    pub keystore: Keystore,
    pub ledger: AccountLedger,
    /// Held for a writer session's whole lifetime so the `flock` releases
    /// when the session's `Context` drops, never before. `None` for
    /// read-only sessions and for callers (tests, housekeeping) that manage
    /// the lock themselves.
    pub write_lock: Option<AccountLock>,
    cache: DirectoryCache,
}

impl Context {
    pub fn new(account_id: u32, read_only: bool, disc_set: DiscSet, keystore: Keystore, ledger: AccountLedger) -> Self {
        Self {
            account_id,
            read_only,
            disc_set,
            keystore,
            ledger,
            write_lock: None,
            cache: DirectoryCache::default(),
        }
    }

    fn require_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::SessionReadOnly);
        }
        Ok(())
    }

    pub fn get_directory(&mut self, dir_id: u64) -> Result<StoreDirectory, Error> {
        Ok(self.cache.get_or_load(&self.disc_set, dir_id)?.clone())
    }

    /// Upload a new file into `dir_id`, either as a whole-file stream
    /// (`diff_from_id = 0`) or a diff against an existing sibling object.
    /// Returns the new object's ID.
    pub fn add_file(
        &mut self,
        dir_id: u64,
        modification_time_us: u64,
        name: &[u8],
        attributes: &[u8],
        diff_from_id: u64,
        upload_stream: &[u8],
    ) -> Result<u64, Error> {
        self.require_writable()?;

        let block_size = self.disc_set.block_size();
        let new_object_id = self.ledger.allocate_object_id();

        let mut diff_target = None;
        if diff_from_id != 0 {
            let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
            if dir.find_by_object_id(diff_from_id).is_none() {
                bail!(StoreError::DiffFromFileDoesNotExist);
            }
            diff_target = Some(diff_from_id);
        }

        // The client already diffed locally and handed us an encoded
        // stream, not raw content: decode it back to plaintext here so
        // everything below keeps storing the live version as a whole
        // file the way it always has.
        let uploaded = codec::decode_stream(upload_stream, &self.keystore)
            .map_err(|_| Error::from(StoreError::FileDoesNotVerify))?;
        codec::verify_stream(&self.keystore, &uploaded).map_err(|_| Error::from(StoreError::FileDoesNotVerify))?;

        let mut old_plaintext_cache = None;
        let plaintext = if uploaded.index.is_patch() {
            let old_id = diff_target.ok_or_else(|| Error::from(StoreError::PatchConsistencyError))?;
            if uploaded.index.other_file_id as u64 != old_id {
                bail!(StoreError::PatchConsistencyError);
            }
            let old_bytes = load_object_bytes(&self.disc_set, old_id)?;
            let old_decoded = codec::decode_stream(&old_bytes[..], &self.keystore)
                .map_err(|_| Error::from(StoreError::PatchConsistencyError))?;
            if old_decoded.index.is_patch() {
                bail!(StoreError::PatchConsistencyError);
            }
            let old_plaintext = codec::decode_body(&self.keystore, &old_decoded, None)?;
            let new_plaintext = codec::decode_body(&self.keystore, &uploaded, Some((&old_plaintext, &old_decoded.index)))
                .map_err(|_| Error::from(StoreError::FileDoesNotVerify))?;
            old_plaintext_cache = Some(old_plaintext);
            new_plaintext
        } else {
            codec::decode_body(&self.keystore, &uploaded, None)?
        };
        let plaintext = &plaintext[..];

        let params = EncodeParams {
            keystore: &self.keystore,
            container_id: dir_id,
            modification_time_us,
            filename: name,
            attributes,
            compress: true,
            block_config: ChunkSizeConfig::default(),
        };

        // Always store the new content as a whole file: diffing only
        // saves upload bandwidth, not storage, once the server already has
        // the plaintext in hand.
        let mut new_bytes = Vec::new();
        codec::encode_whole_file(plaintext, plaintext.len() as u64, FileKind::Regular, &params, &mut new_bytes)?;
        let new_blocks = round_up_to_blocks(new_bytes.len() as u64, block_size);

        let mut reverse_patch_blocks = 0u64;
        let mut reverse_patch_bytes = None;
        let mut diff_outcome = None;
        let mut old_blocks_freed = 0u64;

        if let Some(old_id) = diff_target {
            let old_full = load_object_bytes(&self.disc_set, old_id)?;
            old_blocks_freed = round_up_to_blocks(old_full.len() as u64, block_size);

            let old_plaintext = match old_plaintext_cache {
                Some(p) => p,
                None => {
                    let old_decoded = codec::decode_stream(&old_full[..], &self.keystore)?;
                    codec::decode_body(&self.keystore, &old_decoded, None)?
                }
            };

            let mut rev = Vec::new();
            let mut keep_alive = ();
            let schedule = codec::choose_block_schedule(plaintext.len() as u64, &ChunkSizeConfig::default());
            let new_index = codec::index_of_whole_file(plaintext, &schedule)?;
            let (_stats, outcome) = codec::encode_diff(
                &old_plaintext,
                new_object_id,
                &new_index,
                &EncodeParams {
                    keystore: &self.keystore,
                    container_id: dir_id,
                    modification_time_us: 0,
                    filename: name,
                    attributes,
                    compress: true,
                    block_config: ChunkSizeConfig::default(),
                },
                &mut rev,
                &mut keep_alive,
            )?;
            reverse_patch_blocks = round_up_to_blocks(rev.len() as u64, block_size);
            reverse_patch_bytes = Some(rev);
            diff_outcome = Some(outcome);
        }

        let net_new_blocks = new_blocks as i64 + reverse_patch_blocks as i64 - old_blocks_freed as i64;
        if self.ledger.would_exceed_hard_limit(net_new_blocks) {
            bail!(StoreError::StorageLimitExceeded);
        }

        // Commit the new full object first; the directory update below is
        // what makes it reachable.
        let mut w = RaidFileWriter::create(&self.disc_set, &object_path(new_object_id))?;
        w.write_all(&new_bytes)?;
        w.commit(true)?;

        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        let mut linked_old_id = None;
        for entry in dir.entries.iter_mut() {
            if !entry.is_deleted() && entry_name_matches(entry, name) {
                entry.flags |= EntryFlags::OLD_VERSION;
                if Some(entry.object_id) == diff_target {
                    linked_old_id = Some(entry.object_id);
                }
            }
        }

        if let (Some(old_id), Some(DiffOutcome::Patch)) = (linked_old_id, &diff_outcome) {
            if let Some(old_entry) = dir.find_by_object_id_mut(old_id) {
                old_entry.depends_newer = new_object_id;
                old_entry.size_blocks = reverse_patch_blocks;
            }
        }

        dir.entries.push(DirectoryEntry {
            name: EntryName::Encrypted(name.to_vec()),
            object_id: new_object_id,
            modification_time_us,
            size_blocks: new_blocks,
            flags: EntryFlags::FILE,
            attributes_hash: attributes_hash(attributes),
            attributes: attributes.to_vec(),
            depends_older: if matches!(diff_outcome, Some(DiffOutcome::Patch)) {
                linked_old_id.unwrap_or(0)
            } else {
                0
            },
            depends_newer: 0,
        });

        save_directory(&self.disc_set, dir_id, dir)?;
        self.cache.invalidate(dir_id);
        self.cache.get_or_load(&self.disc_set, dir_id)?;

        // Only now overwrite the old full with its reverse patch: if the
        // process dies before this point, the directory still names an
        // intact old full object.
        if let (Some(old_id), Some(rev_bytes)) = (linked_old_id, reverse_patch_bytes) {
            if matches!(diff_outcome, Some(DiffOutcome::Patch)) {
                let mut w = RaidFileWriter::create(&self.disc_set, &object_path(old_id))?;
                w.write_all(&rev_bytes)?;
                w.commit(true)?;
            }
        }

        self.ledger.change_blocks_used(net_new_blocks);
        self.ledger.change_blocks_in_old_files(old_blocks_freed as i64);
        self.ledger.save(&self.disc_set, true)?;

        Ok(new_object_id)
    }

    /// Mark every live entry named `name` in `dir_id` as deleted. Returns
    /// the object ID of the current (non-`OldVersion`) version, if any.
    pub fn delete_file(&mut self, dir_id: u64, name: &[u8]) -> Result<Option<u64>, Error> {
        self.require_writable()?;
        let block_size = self.disc_set.block_size();

        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        let mut current_version = None;
        let mut freed_blocks = 0u64;
        for entry in dir.entries.iter_mut() {
            if entry.is_deleted() || !entry_name_matches(entry, name) {
                continue;
            }
            if !entry.flags.contains(EntryFlags::OLD_VERSION) {
                current_version = Some(entry.object_id);
            }
            entry.flags |= EntryFlags::DELETED;
            freed_blocks += entry.size_blocks;
        }
        save_directory(&self.disc_set, dir_id, dir)?;
        self.cache.invalidate(dir_id);

        self.ledger.change_blocks_in_deleted_files(freed_blocks as i64);
        self.ledger.save(&self.disc_set, true)?;
        let _ = block_size;
        Ok(current_version)
    }

    /// Depth-first mark/unmark of a directory subtree as deleted.
    pub fn delete_directory(&mut self, dir_id: u64, undelete: bool) -> Result<(), Error> {
        self.require_writable()?;

        let child_dirs: Vec<u64> = {
            let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
            dir.entries
                .iter()
                .filter(|e| e.flags.contains(EntryFlags::DIRECTORY))
                .map(|e| e.object_id)
                .collect()
        };
        for child in child_dirs {
            self.delete_directory(child, undelete)?;
        }

        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        for entry in dir.entries.iter_mut() {
            if undelete {
                entry.flags.remove(EntryFlags::DELETED);
            } else {
                entry.flags.insert(EntryFlags::DELETED);
            }
        }
        save_directory(&self.disc_set, dir_id, dir)?;
        self.cache.invalidate(dir_id);
        Ok(())
    }

    /// Rename/move `object_id`'s entries from `from_dir` to `to_dir`
    /// (which may be the same directory, for a pure rename).
    pub fn move_object(
        &mut self,
        object_id: u64,
        from_dir: u64,
        to_dir: u64,
        new_name: &[u8],
        move_all_with_same_name: bool,
        allow_move_over_deleted: bool,
    ) -> Result<(), Error> {
        self.require_writable()?;

        if from_dir == to_dir {
            let dir = self.cache.get_or_load(&self.disc_set, from_dir)?;
            let old_name = dir
                .find_by_object_id(object_id)
                .map(|e| e.name.clone())
                .ok_or(StoreError::DoesNotExistInDirectory)?;
            for entry in dir.entries.iter_mut() {
                let matches_target = if move_all_with_same_name {
                    entry.name == old_name
                } else {
                    entry.object_id == object_id
                };
                if matches_target {
                    entry.name = EntryName::Encrypted(new_name.to_vec());
                }
            }
            save_directory(&self.disc_set, from_dir, dir)?;
            self.cache.invalidate(from_dir);
            return Ok(());
        }

        let moving: Vec<DirectoryEntry> = {
            let source = self.cache.get_or_load(&self.disc_set, from_dir)?;
            let old_name = source
                .find_by_object_id(object_id)
                .map(|e| e.name.clone())
                .ok_or(StoreError::DoesNotExistInDirectory)?;
            source
                .entries
                .iter()
                .filter(|e| {
                    if move_all_with_same_name {
                        e.name == old_name
                    } else {
                        e.object_id == object_id
                    }
                })
                .cloned()
                .collect()
        };

        {
            let target = self.cache.get_or_load(&self.disc_set, to_dir)?;
            if let Some(existing) = target.entries.iter().find(|e| entry_name_matches(e, new_name)) {
                if !(allow_move_over_deleted && existing.is_deleted()) {
                    bail!(StoreError::TargetNameExists);
                }
            }
        }

        let target = self.cache.get_or_load(&self.disc_set, to_dir)?;
        let target_snapshot_len = target.entries.len();
        for mut entry in moving.iter().cloned() {
            entry.name = EntryName::Encrypted(new_name.to_vec());
            target.entries.push(entry);
        }
        if let Err(e) = save_directory(&self.disc_set, to_dir, target) {
            target.entries.truncate(target_snapshot_len);
            return Err(e);
        }
        self.cache.invalidate(to_dir);

        let source = self.cache.get_or_load(&self.disc_set, from_dir)?;
        let moving_ids: Vec<u64> = moving.iter().map(|e| e.object_id).collect();
        source.entries.retain(|e| !moving_ids.contains(&e.object_id));
        save_directory(&self.disc_set, from_dir, source)?;
        self.cache.invalidate(from_dir);

        Ok(())
    }

    /// Create a new, empty subdirectory under `parent_id` and link it in as
    /// `name`. Returns the new directory's object ID.
    pub fn create_directory(
        &mut self,
        parent_id: u64,
        name: &[u8],
        attributes: &[u8],
        attributes_mod_time_us: u64,
    ) -> Result<u64, Error> {
        self.require_writable()?;

        {
            let parent = self.cache.get_or_load(&self.disc_set, parent_id)?;
            if let Some(existing) = parent.entries.iter().find(|e| entry_name_matches(e, name)) {
                if !existing.is_deleted() {
                    bail!(StoreError::TargetNameExists);
                }
            }
        }

        let new_id = self.ledger.allocate_object_id();
        let mut new_dir = StoreDirectory::new(parent_id);
        new_dir.attributes = attributes.to_vec();
        new_dir.attributes_mod_time_us = attributes_mod_time_us;
        save_directory(&self.disc_set, new_id, &new_dir)?;

        let parent = self.cache.get_or_load(&self.disc_set, parent_id)?;
        parent.entries.push(DirectoryEntry {
            name: EntryName::Encrypted(name.to_vec()),
            object_id: new_id,
            modification_time_us: attributes_mod_time_us,
            size_blocks: 0,
            flags: EntryFlags::DIRECTORY,
            attributes_hash: attributes_hash(attributes),
            attributes: attributes.to_vec(),
            depends_older: 0,
            depends_newer: 0,
        });
        save_directory(&self.disc_set, parent_id, parent)?;
        self.cache.invalidate(parent_id);

        self.ledger.change_blocks_in_directories(1);
        self.ledger.save(&self.disc_set, true)?;

        Ok(new_id)
    }

    pub fn change_file_attributes(&mut self, dir_id: u64, object_id: u64, attributes: &[u8]) -> Result<(), Error> {
        self.require_writable()?;
        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        let entry = dir
            .find_by_object_id_mut(object_id)
            .ok_or(StoreError::DoesNotExistInDirectory)?;
        entry.attributes = attributes.to_vec();
        entry.attributes_hash = attributes_hash(attributes);
        save_directory(&self.disc_set, dir_id, dir)?;
        self.cache.invalidate(dir_id);
        Ok(())
    }

    pub fn change_directory_attributes(&mut self, dir_id: u64, attributes: &[u8], mod_time_us: u64) -> Result<(), Error> {
        self.require_writable()?;
        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        dir.attributes = attributes.to_vec();
        dir.attributes_mod_time_us = mod_time_us;
        save_directory(&self.disc_set, dir_id, dir)?;
        self.cache.invalidate(dir_id);
        Ok(())
    }

    /// Reconstruct a file's full plaintext, resolving its patch chain all
    /// the way up to the nearest whole-file ancestor if necessary.
    pub fn get_file(&mut self, dir_id: u64, object_id: u64) -> Result<Vec<u8>, Error> {
        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        if dir.find_by_object_id(object_id).is_none() {
            bail!(StoreError::DoesNotExistInDirectory);
        }
        resolve_plaintext(&self.disc_set, &self.keystore, dir, object_id)
    }

    /// Raw encoded stream bytes for `object_id` (as stored on disc), for a
    /// caller that only wants the trailing block index and will decode it
    /// itself -- a client diffing a new upload against this object never
    /// needs the plaintext, only the index.
    pub fn get_object_stream(&mut self, dir_id: u64, object_id: u64) -> Result<Vec<u8>, Error> {
        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        if dir.find_by_object_id(object_id).is_none() {
            bail!(StoreError::DoesNotExistInDirectory);
        }
        load_object_bytes(&self.disc_set, object_id)
    }

    /// Raw encoded stream bytes for `object_id`, without checking which
    /// directory (if any) currently lists it -- for commands addressed
    /// purely by object ID.
    pub fn get_raw_object_stream(&mut self, object_id: u64) -> Result<Vec<u8>, Error> {
        load_object_bytes(&self.disc_set, object_id)
    }

    /// Resolve the live (non-deleted, non-`OldVersion`) object ID for
    /// `name` in `dir_id`, if any, mirroring how the server looks up a
    /// "current" file by name elsewhere (e.g. [`Self::add_file`]'s
    /// same-name supersession).
    pub fn find_live_object_id(&mut self, dir_id: u64, name: &[u8]) -> Result<Option<u64>, Error> {
        let dir = self.cache.get_or_load(&self.disc_set, dir_id)?;
        Ok(dir
            .entries
            .iter()
            .filter(|e| e.flags.contains(EntryFlags::FILE) && !e.is_deleted() && !e.flags.contains(EntryFlags::OLD_VERSION))
            .find(|e| e.name_bytes() == name)
            .map(|e| e.object_id))
    }

    /// Name elements from `object_id` (inside `containing_dir_id`) up to
    /// the root, plus the requested object's own metadata. `None` if
    /// either the containing directory or the object within it doesn't
    /// exist. Each directory stores its own parent's ID as
    /// [`StoreDirectory::container_id`], so walking to the root needs no
    /// extra bookkeeping beyond that.
    pub fn resolve_object_name(
        &mut self,
        object_id: u64,
        containing_dir_id: u64,
    ) -> Result<Option<ObjectNameResolution>, Error> {
        let mut elements: Vec<Vec<u8>> = Vec::new();
        let mut modification_time_us = 0;
        let mut attributes_hash = 0;
        let mut flags = 0u16;
        let mut have_metadata = false;

        let mut current_object = object_id;
        let mut current_dir = containing_dir_id;
        loop {
            let dir = match self.cache.get_or_load(&self.disc_set, current_dir) {
                Ok(dir) => dir,
                Err(_) => return Ok(None),
            };

            let entry = match dir.find_by_object_id(current_object) {
                Some(e) => e,
                None => return Ok(None),
            };
            if !have_metadata {
                modification_time_us = entry.modification_time_us;
                attributes_hash = entry.attributes_hash;
                flags = entry.flags.bits();
                have_metadata = true;
            }
            elements.push(entry.name_bytes().to_vec());

            current_object = current_dir;
            current_dir = dir.container_id;
            if current_object == 0 {
                break;
            }
        }

        Ok(Some(ObjectNameResolution {
            elements,
            modification_time_us,
            attributes_hash,
            flags,
        }))
    }
}

/// Result of [`Context::resolve_object_name`]: name elements from the
/// requested object up to the root (root-first order is the caller's to
/// impose -- these come out innermost-first, matching the walk), plus the
/// requested object's own metadata.
pub struct ObjectNameResolution {
    pub elements: Vec<Vec<u8>>,
    pub modification_time_us: u64,
    pub attributes_hash: u64,
    pub flags: u16,
}

/// Reconstruct `object_id`'s plaintext. A live (non-superseded) entry
/// always stores a whole file and decodes directly; an entry that has
/// been superseded stores a reverse patch expressed against its
/// `depends_newer` neighbor's plaintext (see [`crate::codec::combine::reverse`]),
/// so resolving it walks `depends_newer` up to the nearest whole-file
/// ancestor and then folds each patch back down.
pub(crate) fn resolve_plaintext(
    disc_set: &DiscSet,
    keystore: &Keystore,
    dir: &StoreDirectory,
    object_id: u64,
) -> Result<Vec<u8>, Error> {
    const MAX_CHAIN_DEPTH: usize = 10_000;

    let mut chain = Vec::new();
    let mut current = object_id;
    loop {
        let bytes = load_object_bytes(disc_set, current)?;
        let decoded = codec::decode_stream(&bytes[..], keystore)?;
        if !decoded.index.is_patch() {
            let mut plaintext = codec::decode_body(keystore, &decoded, None)?;
            // Each patch in the unwind is expressed against the plaintext (and
            // block layout) of the object one step newer than it, not against
            // its own index -- `base_index` tracks that neighbor's index as
            // the unwind walks back down the chain.
            let mut base_index = &decoded.index;
            for patch_decoded in chain.iter().rev() {
                plaintext = codec::decode_body(keystore, patch_decoded, Some((&plaintext, base_index)))?;
                base_index = &patch_decoded.index;
            }
            return Ok(plaintext);
        }

        if chain.len() >= MAX_CHAIN_DEPTH {
            bail!("patch chain for object {} exceeds maximum depth", object_id);
        }
        let newer = dir
            .find_by_object_id(current)
            .map(|e| e.depends_newer)
            .unwrap_or(0);
        if newer == 0 {
            bail!("patch entry {} has no depends_newer link to resolve against", current);
        }
        chain.push(decoded);
        current = newer;
    }
}

fn entry_name_matches(entry: &DirectoryEntry, name: &[u8]) -> bool {
    match &entry.name {
        EntryName::Clear(b) | EntryName::Encrypted(b) => b == name,
    }
}

fn attributes_hash(attributes: &[u8]) -> u64 {
    crate::raid::fnv1a(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherTag;
    use crate::codec::FileIndex;
    use tempfile::tempdir;

    fn keystore() -> Keystore {
        let len = CipherTag::Aes128Cbc.openssl_cipher().key_len();
        Keystore::new(vec![1; len], vec![2; len], CipherTag::Aes128Cbc).unwrap()
    }

    /// Builds the encoded upload stream a client would send for a new
    /// file, so tests can exercise `add_file` the way the wire actually
    /// carries content -- already encoded, never raw plaintext.
    fn encode_whole(keystore: &Keystore, dir_id: u64, name: &[u8], mtime: u64, attrs: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let params = EncodeParams {
            keystore,
            container_id: dir_id,
            modification_time_us: mtime,
            filename: name,
            attributes: attrs,
            compress: true,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        codec::encode_whole_file(plaintext, plaintext.len() as u64, FileKind::Regular, &params, &mut out).unwrap();
        out
    }

    /// Same, but diffed against `old_index` the way a client diffs
    /// locally after fetching the old object's block index.
    fn encode_diff_against(
        keystore: &Keystore,
        dir_id: u64,
        name: &[u8],
        mtime: u64,
        attrs: &[u8],
        plaintext: &[u8],
        old_id: u64,
        old_index: &FileIndex,
    ) -> Vec<u8> {
        let params = EncodeParams {
            keystore,
            container_id: dir_id,
            modification_time_us: mtime,
            filename: name,
            attributes: attrs,
            compress: true,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        let mut keep_alive = ();
        codec::encode_diff(plaintext, old_id, old_index, &params, &mut out, &mut keep_alive).unwrap();
        out
    }

    fn context(dir: &std::path::Path) -> Context {
        let disc_set = DiscSet::single(dir.to_path_buf(), 4096);
        let ledger = AccountLedger::new(1, "acct".into(), 1_000_000, 2_000_000);
        Context::new(1, false, disc_set, keystore(), ledger)
    }

    #[test]
    fn object_path_splits_low_order_groups() {
        assert_eq!(object_path(0x1234_5678), "0/0000/1234/5678");
        assert_eq!(object_path(7), "0/0000/0000/0007");
    }

    #[test]
    fn add_file_then_get_file_round_trips() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());

        let root = StoreDirectory::new(0);
        save_directory(&ctx.disc_set, 0, &root).unwrap();

        let data = vec![5u8; 20_000];
        let stream = encode_whole(&ctx.keystore, 0, b"a.bin", 1000, b"attrs", &data);
        let id = ctx.add_file(0, 1000, b"a.bin", b"attrs", 0, &stream).unwrap();

        let fetched = ctx.get_file(0, id).unwrap();
        assert_eq!(fetched, data);
    }

    #[test]
    fn add_file_links_diff_chain_and_reverse_patches_old() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());

        let root = StoreDirectory::new(0);
        save_directory(&ctx.disc_set, 0, &root).unwrap();

        let v1 = vec![1u8; 50_000];
        let stream1 = encode_whole(&ctx.keystore, 0, b"a.bin", 1000, b"attrs", &v1);
        let id1 = ctx.add_file(0, 1000, b"a.bin", b"attrs", 0, &stream1).unwrap();

        let mut v2 = v1.clone();
        v2[30_000] = 0xFF;
        // Fetch id1's block index the way a client would before diffing.
        let raw1 = ctx.get_raw_object_stream(id1).unwrap();
        let old_index = codec::decode_stream(&raw1[..], &ctx.keystore).unwrap().index;
        let stream2 = encode_diff_against(&ctx.keystore, 0, b"a.bin", 2000, b"attrs", &v2, id1, &old_index);
        let id2 = ctx.add_file(0, 2000, b"a.bin", b"attrs", id1, &stream2).unwrap();

        let fetched_new = ctx.get_file(0, id2).unwrap();
        assert_eq!(fetched_new, v2);

        let dir = ctx.get_directory(0).unwrap();
        let old_entry = dir.find_by_object_id(id1).unwrap();
        assert!(old_entry.flags.contains(EntryFlags::OLD_VERSION));
        assert_eq!(old_entry.depends_newer, id2);
    }

    #[test]
    fn delete_file_marks_deleted_and_returns_current_id() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path());
        let root = StoreDirectory::new(0);
        save_directory(&ctx.disc_set, 0, &root).unwrap();

        let stream = encode_whole(&ctx.keystore, 0, b"a.bin", 1000, b"", b"hello");
        let id = ctx.add_file(0, 1000, b"a.bin", b"", 0, &stream).unwrap();
        let current = ctx.delete_file(0, b"a.bin").unwrap();
        assert_eq!(current, Some(id));

        let dir = ctx.get_directory(0).unwrap();
        assert!(dir.find_by_name(b"a.bin").is_none());
    }

    #[test]
    fn read_only_session_rejects_mutation() {
        let dir = tempdir().unwrap();
        let disc_set = DiscSet::single(dir.path().to_path_buf(), 4096);
        let ledger = AccountLedger::new(1, "acct".into(), 1000, 2000);
        let mut ctx = Context::new(1, true, disc_set, keystore(), ledger);
        let err = ctx.add_file(0, 0, b"x", b"", 0, b"data").unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }
}
