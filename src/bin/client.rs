//! Backup client: connects to a store server, logs in, and runs one sync
//! pass of a local directory tree.
//!
//! Usage: `strataguard-backup-client <server-addr> <account-id> <local-dir>
//! <remote-root-object-id>`.
//! Exclude-list filtering, a real xattr syscall backend, and a persistent
//! inode map across invocations are boundary concerns this binary leaves
//! minimal: see [`client::directory_record`] for the traits that would
//! carry a fuller implementation without touching the sync algorithm.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context as _, Error};
use log::info;

use strataguard_backup::cipher::{CipherTag, Keystore};
use strataguard_backup::client::directory_record::{
    AttributeSource, DirectoryRecord, FileSource, InMemoryInodeMap, LocalEntry, RemoteEntry, StoreClient, SyncParams,
};
use strataguard_backup::codec::{self, FileIndex};
use strataguard_backup::protocol::{Command, LoginFlags, Reply, PROTOCOL_VERSION};
use strataguard_backup::store::directory::StoreDirectory;
use strataguard_backup::wire::{read_frame, write_frame};

fn now_us() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

/// Reads directory entries and file content with plain `std::fs`; no
/// exclude-list matching, no special handling for symlinks or device
/// files.
struct FsFileSource;

impl FileSource for FsFileSource {
    fn stat_dir(&self, path: &Path) -> std::io::Result<LocalEntry> {
        stat_entry(path)
    }

    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<LocalEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            out.push(stat_entry(&entry.path())?);
        }
        Ok(out)
    }

    fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

fn stat_entry(path: &Path) -> std::io::Result<LocalEntry> {
    let meta = std::fs::symlink_metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(LocalEntry {
        name,
        is_dir: meta.is_dir(),
        inode: meta.ino(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        flags: 0,
        modification_time_us: meta.mtime() as u64 * 1_000_000 + (meta.mtime_nsec() as u64) / 1_000,
        attr_modification_time_us: meta.ctime() as u64 * 1_000_000 + (meta.ctime_nsec() as u64) / 1_000,
        size: meta.size(),
    })
}

/// Extended attributes aren't read from the filesystem here -- this stays
/// an empty blob until a real xattr backend is wired in. The encoded
/// attribute format is an opaque blob as far as the server is concerned,
/// so this stays simple: mode/uid/gid plus the xattr bytes verbatim.
struct FsAttributeSource;

impl AttributeSource for FsAttributeSource {
    fn extended_attributes(&self, _path: &Path) -> std::io::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn encode_attributes(&self, entry: &LocalEntry, xattrs: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + xattrs.len());
        buf.extend_from_slice(&entry.mode.to_be_bytes());
        buf.extend_from_slice(&entry.uid.to_be_bytes());
        buf.extend_from_slice(&entry.gid.to_be_bytes());
        buf.extend_from_slice(xattrs);
        buf
    }
}

/// Drives the command/reply protocol over one TCP connection. A session is
/// synchronous (one frame out, one frame in), matching how the server
/// reads it.
struct SessionClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    keystore: Keystore,
}

impl SessionClient {
    fn connect(addr: &str, account_id: u32, read_only: bool, keystore: Keystore) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).with_context(|| format!("connecting to {}", addr))?;
        let reader = BufReader::new(stream.try_clone().context("cloning socket")?);
        let writer = BufWriter::new(stream);
        let mut session = Self { reader, writer, keystore };

        match session.call(Command::Version { client_version: PROTOCOL_VERSION })? {
            Reply::Version { server_version } if server_version == PROTOCOL_VERSION => {}
            Reply::Version { server_version } => bail!("server speaks protocol {}, we speak {}", server_version, PROTOCOL_VERSION),
            other => bail!("unexpected reply to Version: {:?}", other),
        }

        let flags = if read_only { LoginFlags::READ_ONLY } else { LoginFlags::empty() };
        match session.call(Command::Login { account_id, flags })? {
            Reply::LoginConfirmed { blocks_used, soft_limit, .. } => {
                info!("logged in to account {}: {}/{} blocks used", account_id, blocks_used, soft_limit);
            }
            Reply::Error(e) => bail!("login failed: {}", e),
            other => bail!("unexpected reply to Login: {:?}", other),
        }

        Ok(session)
    }

    fn call(&mut self, command: Command) -> Result<Reply, Error> {
        write_frame(&mut self.writer, &command)?;
        read_frame(&mut self.reader)
    }

    fn finish(mut self) -> Result<(), Error> {
        match self.call(Command::Finished)? {
            Reply::Finished => Ok(()),
            other => bail!("unexpected reply to Finished: {:?}", other),
        }
    }
}

impl StoreClient for SessionClient {
    fn list_directory(&mut self, dir_id: u64) -> Result<Vec<RemoteEntry>, Error> {
        match self.call(Command::ListDirectory { dir_id })? {
            Reply::SuccessWithStream { stream, .. } => {
                let dir = StoreDirectory::read_from(&mut &stream[..])?;
                Ok(dir
                    .entries
                    .iter()
                    .filter(|e| !e.is_deleted())
                    .map(|e| RemoteEntry {
                        object_id: e.object_id,
                        name: e.name_bytes().to_vec(),
                        is_directory: e.flags.contains(strataguard_backup::store::directory::EntryFlags::DIRECTORY),
                        modification_time_us: e.modification_time_us,
                    })
                    .collect())
            }
            Reply::Error(e) => Err(anyhow!("listing directory {}: {}", dir_id, e)),
            other => Err(anyhow!("unexpected reply to ListDirectory: {:?}", other)),
        }
    }

    fn get_block_index(&mut self, object_id: u64) -> Result<FileIndex, Error> {
        match self.call(Command::GetBlockIndexByID { object_id })? {
            Reply::SuccessWithStream { stream, .. } => {
                codec::decode_index_only(std::io::Cursor::new(&stream), &self.keystore)
            }
            Reply::Error(e) => Err(anyhow!("fetching block index for {}: {}", object_id, e)),
            other => Err(anyhow!("unexpected reply to GetBlockIndexByID: {:?}", other)),
        }
    }

    fn create_directory(&mut self, parent_id: u64, name: &[u8], attributes: &[u8], attributes_mod_time_us: u64) -> Result<u64, Error> {
        match self.call(Command::CreateDirectory {
            parent_id,
            attributes: attributes.to_vec(),
            attributes_mod_time_us,
            name: name.to_vec(),
        })? {
            Reply::Success { object_id } => Ok(object_id),
            Reply::Error(e) => Err(anyhow!("creating directory: {}", e)),
            other => Err(anyhow!("unexpected reply to CreateDirectory: {:?}", other)),
        }
    }

    fn store_file(
        &mut self,
        dir_id: u64,
        name: &[u8],
        modification_time_us: u64,
        attributes: &[u8],
        diff_from_id: u64,
        content: &[u8],
    ) -> Result<u64, Error> {
        match self.call(Command::StoreFile {
            dir_id,
            modification_time_us,
            name: name.to_vec(),
            attributes: attributes.to_vec(),
            diff_from_id,
            content: content.to_vec(),
        })? {
            Reply::Success { object_id } => Ok(object_id),
            Reply::Error(e) => Err(anyhow!("storing file: {}", e)),
            other => Err(anyhow!("unexpected reply to StoreFile: {:?}", other)),
        }
    }

    fn move_object(&mut self, object_id: u64, from_dir: u64, to_dir: u64, new_name: &[u8]) -> Result<(), Error> {
        match self.call(Command::MoveObject {
            object_id,
            from_dir,
            to_dir,
            new_name: new_name.to_vec(),
            move_all_with_same_name: false,
            allow_move_over_deleted: false,
        })? {
            Reply::Success { .. } => Ok(()),
            Reply::Error(e) => Err(anyhow!("moving object {}: {}", object_id, e)),
            other => Err(anyhow!("unexpected reply to MoveObject: {:?}", other)),
        }
    }
}

/// Default timing thresholds: no "recently modified, might still be
/// changing" window unless the caller sets one, so every changed file
/// uploads on the pass that notices it.
fn default_sync_params() -> SyncParams {
    SyncParams {
        sync_period_start_us: 0,
        sync_period_end_us: 0,
        max_upload_wait_us: 0,
        max_file_time_in_future_us: 60 * 1_000_000,
        file_tracking_size_threshold: 4096,
        diffing_upload_size_threshold: 64 * 1024,
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 6 {
        bail!(
            "usage: {} <server-addr> <account-id> <local-dir> <remote-root-object-id> <keystore-file>",
            args[0]
        );
    }
    let server_addr = &args[1];
    let account_id: u32 = args[2].parse().context("parsing account id")?;
    let local_dir = PathBuf::from(&args[3]);
    let root_object_id: u64 = args[4].parse().context("parsing remote root object id")?;
    let keystore_path = PathBuf::from(&args[5]);

    // The client needs its own keystore to encode uploads (and decode
    // fetched block indexes) locally, before anything reaches the wire.
    let keystore = Keystore::load(&keystore_path, CipherTag::preferred())?;
    let sync_keystore = keystore.clone();

    let mut client = SessionClient::connect(server_addr, account_id, false, keystore)?;
    let files = FsFileSource;
    let attrs = FsAttributeSource;
    let mut inode_map = InMemoryInodeMap::default();
    let mut root = DirectoryRecord::new(root_object_id, "");

    root.sync(
        &default_sync_params(),
        root_object_id,
        &local_dir,
        now_us(),
        &files,
        &attrs,
        &mut client,
        &mut inode_map,
        &sync_keystore,
    )?;

    info!("sync pass complete for account {}", account_id);
    client.finish()?;
    Ok(())
}
