//! Per-directory client-side sync state.
//!
//! Mirrors a directory on the server: remembers whether it has been
//! synced before and a checksum of its last-seen state so an unchanged
//! directory costs one `stat` per pass instead of a round trip. Grounded
//! on the recursive stat-digest-compare shape of
//! `BackupClientDirectoryRecord::SyncDirectory`; OS access and the wire
//! session are both external collaborators here, reached only through
//! [`FileSource`]/[`AttributeSource`] and [`StoreClient`] so this module
//! stays testable without a filesystem or a live server.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Error};

use crate::checksum::strong_checksum;
use crate::cipher::Keystore;
use crate::codec::{self, ChunkSizeConfig, DiffOutcome, EncodeParams, FileIndex, FileKind};

/// One directory entry as the local filesystem reports it. Exclude-list
/// filtering happens before entries reach here -- this module only sees
/// what it should consider backing up.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub name: String,
    pub is_dir: bool,
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub modification_time_us: u64,
    pub attr_modification_time_us: u64,
    pub size: u64,
}

/// Read-only view onto the local filesystem tree being backed up.
pub trait FileSource {
    fn stat_dir(&self, path: &Path) -> std::io::Result<LocalEntry>;
    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<LocalEntry>>;
    fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

/// Extended attributes and the encoded attribute blob the server stores
/// alongside an object. Kept separate from [`FileSource`] because on most
/// platforms it is backed by a different syscall family (xattr vs stat).
pub trait AttributeSource {
    fn extended_attributes(&self, path: &Path) -> std::io::Result<Vec<u8>>;
    fn encode_attributes(&self, entry: &LocalEntry, xattrs: &[u8]) -> Vec<u8>;
}

/// One entry as the server's directory listing reports it.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub object_id: u64,
    pub name: Vec<u8>,
    pub is_directory: bool,
    pub modification_time_us: u64,
}

/// The session operations a sync pass needs. A thin wrapper over the
/// command/reply protocol on the real client; tests substitute an
/// in-memory fake.
pub trait StoreClient {
    fn list_directory(&mut self, dir_id: u64) -> Result<Vec<RemoteEntry>, Error>;
    /// Fetch the block index of an existing server object, so its content
    /// can be diffed against locally before anything is uploaded.
    fn get_block_index(&mut self, object_id: u64) -> Result<FileIndex, Error>;
    fn create_directory(
        &mut self,
        parent_id: u64,
        name: &[u8],
        attributes: &[u8],
        attributes_mod_time_us: u64,
    ) -> Result<u64, Error>;
    /// `content` is already an encoded stream -- a whole-file encode, or,
    /// when `diff_from_id` is non-zero, a patch diffed locally against
    /// that object's block index.
    fn store_file(
        &mut self,
        dir_id: u64,
        name: &[u8],
        modification_time_us: u64,
        attributes: &[u8],
        diff_from_id: u64,
        content: &[u8],
    ) -> Result<u64, Error>;
    fn move_object(
        &mut self,
        object_id: u64,
        from_dir: u64,
        to_dir: u64,
        new_name: &[u8],
    ) -> Result<(), Error>;
}

/// Maps a local inode, as seen on the previous run, to the server object
/// and containing directory it was last uploaded as -- the basis for
/// rename detection without re-uploading file content.
pub trait InodeMap {
    fn lookup(&self, inode: u64) -> Option<(u64, u64)>;
    fn record(&mut self, inode: u64, object_id: u64, containing_dir_id: u64);
}

#[derive(Debug, Default)]
pub struct InMemoryInodeMap {
    entries: HashMap<u64, (u64, u64)>,
}

impl InodeMap for InMemoryInodeMap {
    fn lookup(&self, inode: u64) -> Option<(u64, u64)> {
        self.entries.get(&inode).copied()
    }

    fn record(&mut self, inode: u64, object_id: u64, containing_dir_id: u64) {
        self.entries.insert(inode, (object_id, containing_dir_id));
    }
}

/// Parameters for a sync pass, mostly timing thresholds that decide
/// whether a recently-touched file is uploaded now or deferred.
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Start of the "recently modified, might still be changing" window.
    pub sync_period_start_us: u64,
    /// End of that window -- usually close to the pass's start time.
    pub sync_period_end_us: u64,
    /// A file pending inside the window longer than this is uploaded
    /// anyway, so a file that is touched every few seconds still backs up
    /// eventually.
    pub max_upload_wait_us: u64,
    /// Files stamped further in the future than this (clock skew, buggy
    /// tools) are uploaded on the next pass rather than trusted now.
    pub max_file_time_in_future_us: u64,
    /// Files above this size get an inode-map pending-entry when deferred;
    /// below it, deferral isn't worth the bookkeeping.
    pub file_tracking_size_threshold: u64,
    /// Files above this size that already exist on the server get their
    /// old block index fetched and diffed against locally before upload;
    /// smaller files are always uploaded whole.
    pub diffing_upload_size_threshold: u64,
}

fn digest_entries(
    dir_stat: &LocalEntry,
    dir_xattrs: &[u8],
    files: &[LocalEntry],
    dirs: &[LocalEntry],
) -> [u8; 16] {
    let mut buf = Vec::new();
    buf.extend_from_slice(&dir_stat.mode.to_ne_bytes());
    buf.extend_from_slice(&dir_stat.uid.to_ne_bytes());
    buf.extend_from_slice(&dir_stat.gid.to_ne_bytes());
    buf.extend_from_slice(&dir_stat.inode.to_ne_bytes());
    buf.extend_from_slice(&dir_stat.flags.to_ne_bytes());
    buf.extend_from_slice(dir_xattrs);
    for entry in files {
        buf.extend_from_slice(&entry.modification_time_us.to_ne_bytes());
        buf.extend_from_slice(&entry.attr_modification_time_us.to_ne_bytes());
        buf.extend_from_slice(&entry.size.to_ne_bytes());
        buf.extend_from_slice(entry.name.as_bytes());
    }
    // Subdirectory names (not their contents) are folded in too, so a
    // created/removed/renamed subdirectory invalidates the short-circuit
    // even though its own mtime/size never show up above.
    for entry in dirs {
        buf.extend_from_slice(entry.name.as_bytes());
    }
    // Checksum is compared only against a value computed the same way on
    // this host, so byte order of the inputs above doesn't matter.
    strong_checksum(&buf).unwrap_or([0u8; 16])
}

/// Per-directory record memoized across sync passes.
#[derive(Debug)]
pub struct DirectoryRecord {
    object_id: u64,
    sub_dir_name: String,
    initial_sync_done: bool,
    state_checksum: [u8; 16],
    pending_entries: HashMap<String, u64>,
    children: HashMap<String, DirectoryRecord>,
}

impl DirectoryRecord {
    pub fn new(object_id: u64, sub_dir_name: impl Into<String>) -> Self {
        Self {
            object_id,
            sub_dir_name: sub_dir_name.into(),
            initial_sync_done: false,
            state_checksum: [0u8; 16],
            pending_entries: HashMap::new(),
            children: HashMap::new(),
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    fn in_sync_window(&self, params: &SyncParams, mtime_us: u64) -> bool {
        mtime_us >= params.sync_period_start_us && mtime_us <= params.sync_period_end_us
    }

    /// Recursively sync this directory and its subtree against the
    /// server, starting from `local_path`. `containing_dir_id` is this
    /// directory's parent on the server, needed only for rename targets.
    pub fn sync(
        &mut self,
        params: &SyncParams,
        containing_dir_id: u64,
        local_path: &Path,
        now_us: u64,
        files: &dyn FileSource,
        attrs: &dyn AttributeSource,
        client: &mut dyn StoreClient,
        inode_map: &mut dyn InodeMap,
        keystore: &Keystore,
    ) -> Result<(), Error> {
        let dir_stat = files
            .stat_dir(local_path)
            .with_context(|| format!("stat {:?}", local_path))?;
        inode_map.record(dir_stat.inode, self.object_id, containing_dir_id);

        let dir_xattrs = attrs.extended_attributes(local_path).unwrap_or_default();
        let entries = files
            .read_dir(local_path)
            .with_context(|| format!("reading directory {:?}", local_path))?;

        let (dirs, mut kept_files): (Vec<LocalEntry>, Vec<LocalEntry>) =
            entries.into_iter().partition(|e| e.is_dir);
        kept_files.sort_by(|a, b| a.name.cmp(&b.name));

        let digest = digest_entries(&dir_stat, &dir_xattrs, &kept_files, &dirs);
        let unchanged = self.initial_sync_done && digest == self.state_checksum;

        if !unchanged {
            self.reconcile_files(
                params,
                local_path,
                now_us,
                &kept_files,
                &dirs,
                files,
                attrs,
                client,
                inode_map,
                keystore,
            )?;
            self.state_checksum = digest;
            self.initial_sync_done = true;
        }

        for dir_entry in &dirs {
            if let Some(child) = self.children.get_mut(&dir_entry.name) {
                let mut child_path = local_path.to_path_buf();
                child_path.push(&dir_entry.name);
                child.sync(
                    params,
                    self.object_id,
                    &child_path,
                    now_us,
                    files,
                    attrs,
                    client,
                    inode_map,
                    keystore,
                )?;
            }
        }

        Ok(())
    }

    fn reconcile_files(
        &mut self,
        params: &SyncParams,
        local_path: &Path,
        now_us: u64,
        kept_files: &[LocalEntry],
        dirs: &[LocalEntry],
        files: &dyn FileSource,
        attrs: &dyn AttributeSource,
        client: &mut dyn StoreClient,
        inode_map: &mut dyn InodeMap,
        keystore: &Keystore,
    ) -> Result<(), Error> {
        let remote = client.list_directory(self.object_id)?;
        let mut remote_files: HashMap<Vec<u8>, &RemoteEntry> = HashMap::new();
        let mut remote_dirs: HashMap<Vec<u8>, &RemoteEntry> = HashMap::new();
        for entry in &remote {
            if entry.is_directory {
                remote_dirs.insert(entry.name.clone(), entry);
            } else {
                remote_files.insert(entry.name.clone(), entry);
            }
        }

        let mut still_pending = HashMap::new();

        for entry in kept_files {
            if entry.modification_time_us > now_us + params.max_file_time_in_future_us {
                // Clock skew or a buggy tool stamped this file in the
                // future; leave it for a later pass rather than trust it.
                continue;
            }

            let remote_entry = remote_files.get(entry.name.as_bytes()).copied();
            let changed = match remote_entry {
                None => true,
                Some(r) => r.modification_time_us != entry.modification_time_us,
            };
            if !changed {
                still_pending.remove(&entry.name);
                continue;
            }

            let first_seen = *self
                .pending_entries
                .get(&entry.name)
                .unwrap_or(&now_us);
            let pending_age = now_us.saturating_sub(first_seen);
            let deferred = self.in_sync_window(params, entry.modification_time_us)
                && pending_age < params.max_upload_wait_us;

            if deferred {
                if entry.size >= params.file_tracking_size_threshold {
                    still_pending.insert(entry.name.clone(), first_seen);
                }
                continue;
            }

            self.upload_one(
                local_path,
                entry,
                remote_entry,
                files,
                attrs,
                client,
                inode_map,
                params,
                keystore,
            )?;
        }

        self.pending_entries = still_pending;

        // Keep `children` in step with the live subdirectory names: reuse
        // the server's object ID when one already exists under that name,
        // otherwise create it. A child whose directory vanished locally
        // is left in place -- the server-side listing reconciles deletes
        // the same way it does for removed files.
        for dir_entry in dirs {
            if self.children.contains_key(&dir_entry.name) {
                continue;
            }
            let object_id = match remote_dirs.get(dir_entry.name.as_bytes()) {
                Some(r) => r.object_id,
                None => {
                    let mut path = local_path.to_path_buf();
                    path.push(&dir_entry.name);
                    let xattrs = attrs.extended_attributes(&path).unwrap_or_default();
                    let attributes = attrs.encode_attributes(dir_entry, &xattrs);
                    client.create_directory(
                        self.object_id,
                        dir_entry.name.as_bytes(),
                        &attributes,
                        dir_entry.attr_modification_time_us,
                    )?
                }
            };
            self.children
                .insert(dir_entry.name.clone(), DirectoryRecord::new(object_id, dir_entry.name.clone()));
        }

        Ok(())
    }

    fn upload_one(
        &mut self,
        local_path: &Path,
        entry: &LocalEntry,
        remote_entry: Option<&RemoteEntry>,
        files: &dyn FileSource,
        attrs: &dyn AttributeSource,
        client: &mut dyn StoreClient,
        inode_map: &mut dyn InodeMap,
        params: &SyncParams,
        keystore: &Keystore,
    ) -> Result<(), Error> {
        // A new name with an inode we've seen before, pointing at a live
        // server object, is a rename: move it rather than re-upload.
        if remote_entry.is_none() {
            if let Some((object_id, prev_dir_id)) = inode_map.lookup(entry.inode) {
                client.move_object(object_id, prev_dir_id, self.object_id, entry.name.as_bytes())?;
                inode_map.record(entry.inode, object_id, self.object_id);
                return Ok(());
            }
        }

        let mut path = local_path.to_path_buf();
        path.push(&entry.name);
        let content = files
            .read_file(&path)
            .with_context(|| format!("reading {:?}", path))?;
        let xattrs = attrs.extended_attributes(&path).unwrap_or_default();
        let attributes = attrs.encode_attributes(entry, &xattrs);

        // Diffing happens here, before anything crosses the wire: fetch
        // the old block index and diff locally, so only the changed
        // chunks are ever uploaded.
        let diff_against = match remote_entry {
            Some(r) if entry.size > params.diffing_upload_size_threshold => {
                client.get_block_index(r.object_id).ok().map(|idx| (r.object_id, idx))
            }
            _ => None,
        };

        let (encoded, diff_from_id) =
            encode_for_upload(keystore, self.object_id, entry, &attributes, &content, diff_against)?;

        let object_id = client.store_file(
            self.object_id,
            entry.name.as_bytes(),
            entry.modification_time_us,
            &attributes,
            diff_from_id,
            &encoded,
        )?;
        inode_map.record(entry.inode, object_id, self.object_id);
        Ok(())
    }
}

/// Encode `content` for upload: diffed against `diff_against`'s block
/// index when one is given and an overlap is actually found, otherwise
/// as a whole file.
fn encode_for_upload(
    keystore: &Keystore,
    container_id: u64,
    entry: &LocalEntry,
    attributes: &[u8],
    content: &[u8],
    diff_against: Option<(u64, FileIndex)>,
) -> Result<(Vec<u8>, u64), Error> {
    let params = EncodeParams {
        keystore,
        container_id,
        modification_time_us: entry.modification_time_us,
        filename: entry.name.as_bytes(),
        attributes,
        compress: true,
        block_config: ChunkSizeConfig::default(),
    };

    if let Some((old_id, old_index)) = diff_against {
        let mut out = Vec::new();
        let mut keep_alive = ();
        let (_stats, outcome) = codec::encode_diff(content, old_id, &old_index, &params, &mut out, &mut keep_alive)?;
        if matches!(outcome, DiffOutcome::Patch) {
            return Ok((out, old_id));
        }
    }

    let mut out = Vec::new();
    codec::encode_whole_file(content, content.len() as u64, FileKind::Regular, &params, &mut out)?;
    Ok((out, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;

    use crate::cipher::CipherTag;

    fn test_keystore() -> Keystore {
        let len = CipherTag::Aes128Cbc.openssl_cipher().key_len();
        Keystore::new(vec![3; len], vec![4; len], CipherTag::Aes128Cbc).unwrap()
    }

    struct FakeFs {
        dirs: Map<String, LocalEntry>,
        listings: Map<String, Vec<LocalEntry>>,
        contents: Map<String, Vec<u8>>,
    }

    impl FileSource for FakeFs {
        fn stat_dir(&self, path: &Path) -> std::io::Result<LocalEntry> {
            Ok(self.dirs[&path.to_string_lossy().into_owned()].clone())
        }
        fn read_dir(&self, path: &Path) -> std::io::Result<Vec<LocalEntry>> {
            Ok(self.listings[&path.to_string_lossy().into_owned()].clone())
        }
        fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
            Ok(self.contents[&path.to_string_lossy().into_owned()].clone())
        }
    }

    struct FakeAttrs;
    impl AttributeSource for FakeAttrs {
        fn extended_attributes(&self, _path: &Path) -> std::io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn encode_attributes(&self, _entry: &LocalEntry, _xattrs: &[u8]) -> Vec<u8> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct FakeClient {
        next_id: u64,
        stored: RefCell<Vec<(u64, Vec<u8>, u64)>>,
    }

    impl StoreClient for FakeClient {
        fn list_directory(&mut self, _dir_id: u64) -> Result<Vec<RemoteEntry>, Error> {
            Ok(Vec::new())
        }
        fn get_block_index(&mut self, _object_id: u64) -> Result<FileIndex, Error> {
            Err(anyhow::anyhow!("no such object"))
        }
        fn create_directory(&mut self, _parent_id: u64, _name: &[u8], _attributes: &[u8], _t: u64) -> Result<u64, Error> {
            self.next_id += 1;
            Ok(self.next_id)
        }
        fn store_file(
            &mut self,
            dir_id: u64,
            name: &[u8],
            _modification_time_us: u64,
            _attributes: &[u8],
            diff_from_id: u64,
            _content: &[u8],
        ) -> Result<u64, Error> {
            self.next_id += 1;
            self.stored.borrow_mut().push((dir_id, name.to_vec(), diff_from_id));
            Ok(self.next_id)
        }
        fn move_object(&mut self, _object_id: u64, _from_dir: u64, _to_dir: u64, _new_name: &[u8]) -> Result<(), Error> {
            Ok(())
        }
    }

    fn entry(name: &str, is_dir: bool, mtime: u64, size: u64, inode: u64) -> LocalEntry {
        LocalEntry {
            name: name.to_string(),
            is_dir,
            inode,
            mode: 0o755,
            uid: 0,
            gid: 0,
            flags: 0,
            modification_time_us: mtime,
            attr_modification_time_us: mtime,
            size,
        }
    }

    fn default_params() -> SyncParams {
        SyncParams {
            sync_period_start_us: 0,
            sync_period_end_us: 0,
            max_upload_wait_us: 1_000_000,
            max_file_time_in_future_us: 1_000_000,
            file_tracking_size_threshold: 64,
            diffing_upload_size_threshold: 1_000_000,
        }
    }

    #[test]
    fn uploads_new_file_once_then_skips_unchanged_pass() {
        let root = entry(".", true, 100, 0, 1);
        let file_a = entry("a.txt", false, 200, 10, 2);

        let mut dirs = Map::new();
        dirs.insert("/root".to_string(), root);
        let mut listings = Map::new();
        listings.insert("/root".to_string(), vec![file_a.clone()]);
        let mut contents = Map::new();
        contents.insert("/root/a.txt".to_string(), b"hello".to_vec());

        let fs = FakeFs { dirs, listings, contents };
        let attrs = FakeAttrs;
        let mut client = FakeClient::default();
        let mut inode_map = InMemoryInodeMap::default();
        let params = default_params();
        let keystore = test_keystore();

        let mut record = DirectoryRecord::new(0, "");
        record
            .sync(&params, 0, Path::new("/root"), 1_000_000, &fs, &attrs, &mut client, &mut inode_map, &keystore)
            .unwrap();
        assert_eq!(client.stored.borrow().len(), 1);
        assert!(record.initial_sync_done);

        // Second pass over the same state: the digest hasn't changed, so
        // reconcile_files (and thus list_directory/store_file) never runs.
        record
            .sync(&params, 0, Path::new("/root"), 1_000_001, &fs, &attrs, &mut client, &mut inode_map, &keystore)
            .unwrap();
        assert_eq!(client.stored.borrow().len(), 1);
    }

    #[test]
    fn large_changed_file_against_existing_server_copy_is_diffed() {
        let root = entry(".", true, 100, 0, 1);
        let file_a = entry("big.bin", false, 500, 2_000_000, 2);

        let mut dirs = Map::new();
        dirs.insert("/root".to_string(), root);
        let mut listings = Map::new();
        listings.insert("/root".to_string(), vec![file_a]);
        let mut contents = Map::new();
        contents.insert("/root/big.bin".to_string(), vec![0u8; 16]);

        let fs = FakeFs { dirs, listings, contents };
        let attrs = FakeAttrs;

        struct ClientWithExisting {
            inner: FakeClient,
        }
        impl StoreClient for ClientWithExisting {
            fn list_directory(&mut self, dir_id: u64) -> Result<Vec<RemoteEntry>, Error> {
                let _ = dir_id;
                Ok(vec![RemoteEntry {
                    object_id: 77,
                    name: b"big.bin".to_vec(),
                    is_directory: false,
                    modification_time_us: 1,
                }])
            }
            fn get_block_index(&mut self, object_id: u64) -> Result<FileIndex, Error> {
                let _ = object_id;
                // Old server copy has the same bytes the local file still
                // has, so diffing against it finds a full match.
                let old_content = vec![0u8; 16];
                let schedule = codec::choose_block_schedule(old_content.len() as u64, &ChunkSizeConfig::default());
                codec::index_of_whole_file(&old_content, &schedule)
            }
            fn create_directory(&mut self, p: u64, n: &[u8], a: &[u8], t: u64) -> Result<u64, Error> {
                self.inner.create_directory(p, n, a, t)
            }
            fn store_file(
                &mut self,
                dir_id: u64,
                name: &[u8],
                t: u64,
                a: &[u8],
                diff_from_id: u64,
                content: &[u8],
            ) -> Result<u64, Error> {
                self.inner.store_file(dir_id, name, t, a, diff_from_id, content)
            }
            fn move_object(&mut self, o: u64, f: u64, to: u64, n: &[u8]) -> Result<(), Error> {
                self.inner.move_object(o, f, to, n)
            }
        }

        let mut client = ClientWithExisting { inner: FakeClient::default() };
        let mut inode_map = InMemoryInodeMap::default();
        let params = default_params();
        let keystore = test_keystore();

        let mut record = DirectoryRecord::new(0, "");
        record
            .sync(&params, 0, Path::new("/root"), 1_000_000, &fs, &attrs, &mut client, &mut inode_map, &keystore)
            .unwrap();

        let stored = client.inner.stored.borrow();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].2, 77);
    }
}
