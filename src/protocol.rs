//! Session command/reply state machine: Version -> Login -> Commands.
//!
//! A session is single-threaded and synchronous: one command frame in, one
//! reply frame (plus an optional attached stream) out, dispatched here
//! against a [`Context`]. The actual socket framing lives in the server
//! binary; this module only knows about phases, typed commands, and the
//! mapping from a [`StoreError`] to a wire-visible reply.

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::context::Context;
use crate::store::directory::StoreDirectory;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Version,
    Login,
    Commands,
}

bitflags::bitflags! {
    #[derive(Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct LoginFlags: u32 {
        const READ_ONLY = 0x0001;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Version { client_version: u32 },
    Login { account_id: u32, flags: LoginFlags },
    Finished,
    ListDirectory { dir_id: u64 },
    GetObject { object_id: u64 },
    GetFile { object_id: u64, dir_id: u64 },
    /// Walk the parent chain from `object_id` (inside `containing_dir_id`)
    /// up to the root, streaming each name element along the way.
    GetObjectName { object_id: u64, containing_dir_id: u64 },
    /// Fetch the block index of an existing object, for a client that
    /// wants to diff a new upload against it without fetching its content.
    GetBlockIndexByID { object_id: u64 },
    /// Same, but resolving the live object by name within a directory
    /// rather than by ID directly.
    GetBlockIndexByName { dir_id: u64, name: Vec<u8> },
    StoreFile {
        dir_id: u64,
        modification_time_us: u64,
        name: Vec<u8>,
        attributes: Vec<u8>,
        diff_from_id: u64,
        content: Vec<u8>,
    },
    CreateDirectory {
        parent_id: u64,
        attributes: Vec<u8>,
        attributes_mod_time_us: u64,
        name: Vec<u8>,
    },
    ChangeDirAttributes {
        dir_id: u64,
        attributes: Vec<u8>,
        attributes_mod_time_us: u64,
    },
    SetReplacementFileAttributes {
        dir_id: u64,
        object_id: u64,
        attributes: Vec<u8>,
    },
    DeleteFile { dir_id: u64, name: Vec<u8> },
    DeleteDirectory { dir_id: u64 },
    UndeleteDirectory { dir_id: u64 },
    SetClientStoreMarker { marker: u64 },
    MoveObject {
        object_id: u64,
        from_dir: u64,
        to_dir: u64,
        new_name: Vec<u8>,
        move_all_with_same_name: bool,
        allow_move_over_deleted: bool,
    },
    GetAccountUsage,
    GetIsAlive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Version { server_version: u32 },
    LoginConfirmed {
        client_marker: u64,
        blocks_used: u64,
        soft_limit: u64,
        hard_limit: u64,
    },
    Finished,
    Success { object_id: u64 },
    /// `Success` variants that also carry an attached byte stream for the
    /// client to read after the reply frame (directory listings, file
    /// contents).
    SuccessWithStream { object_id: u64, stream: Vec<u8> },
    AccountUsage {
        blocks_used: u64,
        soft_limit: u64,
        hard_limit: u64,
        block_size: u64,
    },
    /// Reply to `GetObjectName`. `count` is the number of name elements
    /// streamed after this reply (innermost first), 0 meaning the object
    /// or its containing directory doesn't exist.
    ObjectName {
        count: u32,
        modification_time_us: u64,
        attributes_hash: u64,
        flags: u16,
        name_elements: Vec<Vec<u8>>,
    },
    IsAlive,
    Error(StoreError),
}

/// Drives one session's phase transitions and command dispatch against a
/// [`Context`]. The context is only constructed once login succeeds
/// (it needs the account ID to load the right disc set and keystore), so
/// before that this only tracks phase and the pending account ID.
pub struct Session {
    phase: Phase,
    pub context: Option<Context>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Version,
            context: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Handle a command, given a context factory used only by `Login` to
    /// build the session's [`Context`] (it needs to open the account's
    /// ledger and disc set, which is environment-specific enough that the
    /// caller supplies it rather than this module reaching into config).
    pub fn handle(
        &mut self,
        command: Command,
        build_context: impl FnOnce(u32, bool) -> Result<Context, Error>,
    ) -> Reply {
        match self.dispatch(command, build_context) {
            Ok(reply) => reply,
            Err(store_err) => Reply::Error(store_err),
        }
    }

    fn dispatch(
        &mut self,
        command: Command,
        build_context: impl FnOnce(u32, bool) -> Result<Context, Error>,
    ) -> Result<Reply, StoreError> {
        match (&self.phase, command) {
            (Phase::Version, Command::Version { client_version }) => {
                if client_version != PROTOCOL_VERSION {
                    return Err(StoreError::WrongVersion);
                }
                self.phase = Phase::Login;
                Ok(Reply::Version {
                    server_version: PROTOCOL_VERSION,
                })
            }
            (_, Command::Version { .. }) => Err(StoreError::NotInRightProtocolPhase),

            (Phase::Login, Command::Login { account_id, flags }) => {
                let read_only = flags.contains(LoginFlags::READ_ONLY);
                let context = build_context(account_id, read_only).map_err(|_| StoreError::BadLogin)?;
                let reply = Reply::LoginConfirmed {
                    client_marker: context.ledger.client_marker,
                    blocks_used: context.ledger.blocks_used,
                    soft_limit: context.ledger.soft_limit_blocks,
                    hard_limit: context.ledger.hard_limit_blocks,
                };
                self.context = Some(context);
                self.phase = Phase::Commands;
                Ok(reply)
            }
            (_, Command::Login { .. }) => Err(StoreError::NotInRightProtocolPhase),

            (Phase::Commands, command) => self.dispatch_command(command),
            (_, _) => Err(StoreError::NotInRightProtocolPhase),
        }
    }

    fn dispatch_command(&mut self, command: Command) -> Result<Reply, StoreError> {
        let context = self.context.as_mut().expect("commands phase implies a context");

        match command {
            Command::Finished => {
                if !context.read_only {
                    context.ledger.force_save(&context.disc_set).map_err(internal_err)?;
                }
                Ok(Reply::Finished)
            }

            Command::ListDirectory { dir_id } => {
                let dir: StoreDirectory = context.get_directory(dir_id).map_err(|_| StoreError::DoesNotExist)?;
                let mut stream = Vec::new();
                dir.write_to(&mut stream).map_err(internal_err)?;
                Ok(Reply::SuccessWithStream {
                    object_id: dir_id,
                    stream,
                })
            }

            Command::GetObject { object_id } => {
                let content = context.get_file(0, object_id).map_err(|_| StoreError::DoesNotExist)?;
                Ok(Reply::SuccessWithStream {
                    object_id,
                    stream: content,
                })
            }

            Command::GetFile { object_id, dir_id } => {
                let content = context.get_file(dir_id, object_id).map_err(|_| StoreError::DoesNotExist)?;
                Ok(Reply::SuccessWithStream {
                    object_id,
                    stream: content,
                })
            }

            Command::GetObjectName { object_id, containing_dir_id } => {
                match context.resolve_object_name(object_id, containing_dir_id).map_err(internal_err)? {
                    Some(resolution) => Ok(Reply::ObjectName {
                        count: resolution.elements.len() as u32,
                        modification_time_us: resolution.modification_time_us,
                        attributes_hash: resolution.attributes_hash,
                        flags: resolution.flags,
                        name_elements: resolution.elements,
                    }),
                    None => Ok(Reply::ObjectName {
                        count: 0,
                        modification_time_us: 0,
                        attributes_hash: 0,
                        flags: 0,
                        name_elements: Vec::new(),
                    }),
                }
            }

            Command::GetBlockIndexByID { object_id } => {
                let stream = context.get_raw_object_stream(object_id).map_err(|_| StoreError::DoesNotExist)?;
                Ok(Reply::SuccessWithStream { object_id, stream })
            }

            Command::GetBlockIndexByName { dir_id, name } => {
                let resolved = context.find_live_object_id(dir_id, &name).map_err(internal_err)?;
                match resolved {
                    Some(object_id) => {
                        let stream = context.get_object_stream(dir_id, object_id).map_err(internal_err)?;
                        Ok(Reply::SuccessWithStream { object_id, stream })
                    }
                    None => Ok(Reply::SuccessWithStream { object_id: 0, stream: Vec::new() }),
                }
            }

            Command::StoreFile {
                dir_id,
                modification_time_us,
                name,
                attributes,
                diff_from_id,
                content,
            } => {
                let id = context
                    .add_file(dir_id, modification_time_us, &name, &attributes, diff_from_id, &content)
                    .map_err(store_err)?;
                Ok(Reply::Success { object_id: id })
            }

            Command::CreateDirectory {
                parent_id,
                attributes,
                attributes_mod_time_us,
                name,
            } => {
                let new_id = context
                    .create_directory(parent_id, &name, &attributes, attributes_mod_time_us)
                    .map_err(store_err)?;
                Ok(Reply::Success { object_id: new_id })
            }

            Command::ChangeDirAttributes {
                dir_id,
                attributes,
                attributes_mod_time_us,
            } => {
                context
                    .change_directory_attributes(dir_id, &attributes, attributes_mod_time_us)
                    .map_err(store_err)?;
                Ok(Reply::Success { object_id: dir_id })
            }

            Command::SetReplacementFileAttributes {
                dir_id,
                object_id,
                attributes,
            } => {
                context
                    .change_file_attributes(dir_id, object_id, &attributes)
                    .map_err(store_err)?;
                Ok(Reply::Success { object_id })
            }

            Command::DeleteFile { dir_id, name } => {
                let id = context.delete_file(dir_id, &name).map_err(store_err)?;
                Ok(Reply::Success { object_id: id.unwrap_or(0) })
            }

            Command::DeleteDirectory { dir_id } => {
                if dir_id == 0 {
                    return Err(StoreError::CannotDeleteRoot);
                }
                context.delete_directory(dir_id, false).map_err(store_err)?;
                Ok(Reply::Success { object_id: dir_id })
            }

            Command::UndeleteDirectory { dir_id } => {
                context.delete_directory(dir_id, true).map_err(store_err)?;
                Ok(Reply::Success { object_id: dir_id })
            }

            Command::SetClientStoreMarker { marker } => {
                if context.read_only {
                    return Err(StoreError::SessionReadOnly);
                }
                context.ledger.client_marker = marker;
                context.ledger.force_save(&context.disc_set).map_err(internal_err)?;
                Ok(Reply::Success { object_id: marker })
            }

            Command::MoveObject {
                object_id,
                from_dir,
                to_dir,
                new_name,
                move_all_with_same_name,
                allow_move_over_deleted,
            } => {
                context
                    .move_object(object_id, from_dir, to_dir, &new_name, move_all_with_same_name, allow_move_over_deleted)
                    .map_err(store_err)?;
                Ok(Reply::Success { object_id })
            }

            Command::GetAccountUsage => Ok(Reply::AccountUsage {
                blocks_used: context.ledger.blocks_used,
                soft_limit: context.ledger.soft_limit_blocks,
                hard_limit: context.ledger.hard_limit_blocks,
                block_size: context.disc_set.block_size(),
            }),

            Command::GetIsAlive => Ok(Reply::IsAlive),

            Command::Version { .. } | Command::Login { .. } => Err(StoreError::NotInRightProtocolPhase),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an internal `anyhow::Error` that has nothing better to say for
/// itself into `PatchConsistencyError`, the closest-fitting catch-all
/// wire error for a server-side invariant violation.
fn internal_err(_: Error) -> StoreError {
    StoreError::PatchConsistencyError
}

/// Unwrap a `StoreError` carried inside an `anyhow::Error` (as produced by
/// `bail!(StoreError::...)` in the context layer), falling back to the
/// catch-all for genuinely unexpected failures.
fn store_err(err: Error) -> StoreError {
    err.downcast::<StoreError>().unwrap_or(StoreError::PatchConsistencyError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherTag, Keystore};
    use crate::raid::DiscSet;
    use crate::store::ledger::AccountLedger;
    use tempfile::tempdir;

    fn encode_whole(keystore: &Keystore, dir_id: u64, name: &[u8], mtime: u64, plaintext: &[u8]) -> Vec<u8> {
        use crate::codec::{self, ChunkSizeConfig, EncodeParams, FileKind};
        let params = EncodeParams {
            keystore,
            container_id: dir_id,
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

    fn test_keystore() -> Keystore {
        let len = CipherTag::Aes128Cbc.openssl_cipher().key_len();
        Keystore::new(vec![1; len], vec![2; len], CipherTag::Aes128Cbc).unwrap()
    }

    fn make_context(dir: &std::path::Path, read_only: bool) -> Context {
        let disc_set = DiscSet::single(dir.to_path_buf(), 4096);
        let keystore = test_keystore();
        let ledger = AccountLedger::new(1, "acct".into(), 1_000_000, 2_000_000);
        let root = StoreDirectory::new(0);
        let mut buf = Vec::new();
        root.write_to(&mut buf).unwrap();
        let mut w = crate::raid::RaidFileWriter::create(&disc_set, &crate::store::context::object_path(0)).unwrap();
        w.write_all(&buf).unwrap();
        w.commit(false).unwrap();
        Context::new(1, read_only, disc_set, keystore, ledger)
    }

    #[test]
    fn version_then_login_then_command() {
        let dir = tempdir().unwrap();
        let mut session = Session::new();

        let reply = session.handle(
            Command::Version { client_version: PROTOCOL_VERSION },
            |_, _| unreachable!(),
        );
        assert!(matches!(reply, Reply::Version { .. }));
        assert_eq!(session.phase(), Phase::Login);

        let reply = session.handle(
            Command::Login {
                account_id: 1,
                flags: LoginFlags::empty(),
            },
            |_account, read_only| Ok(make_context(dir.path(), read_only)),
        );
        assert!(matches!(reply, Reply::LoginConfirmed { .. }));
        assert_eq!(session.phase(), Phase::Commands);

        let reply = session.handle(Command::GetIsAlive, |_, _| unreachable!());
        assert!(matches!(reply, Reply::IsAlive));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut session = Session::new();
        let reply = session.handle(Command::Version { client_version: 999 }, |_, _| unreachable!());
        assert!(matches!(reply, Reply::Error(StoreError::WrongVersion)));
    }

    #[test]
    fn command_before_login_is_rejected() {
        let mut session = Session::new();
        let reply = session.handle(Command::GetIsAlive, |_, _| unreachable!());
        assert!(matches!(reply, Reply::Error(StoreError::NotInRightProtocolPhase)));
    }

    #[test]
    fn read_only_session_rejects_store_file() {
        let dir = tempdir().unwrap();
        let mut session = Session::new();
        session.handle(Command::Version { client_version: PROTOCOL_VERSION }, |_, _| unreachable!());
        session.handle(
            Command::Login {
                account_id: 1,
                flags: LoginFlags::READ_ONLY,
            },
            |_account, read_only| Ok(make_context(dir.path(), read_only)),
        );

        let reply = session.handle(
            Command::StoreFile {
                dir_id: 0,
                modification_time_us: 0,
                name: b"f".to_vec(),
                attributes: Vec::new(),
                diff_from_id: 0,
                content: b"data".to_vec(),
            },
            |_, _| unreachable!(),
        );
        assert!(matches!(reply, Reply::Error(StoreError::SessionReadOnly)));
    }

    fn logged_in_session(dir: &std::path::Path) -> Session {
        let mut session = Session::new();
        session.handle(Command::Version { client_version: PROTOCOL_VERSION }, |_, _| unreachable!());
        session.handle(
            Command::Login { account_id: 1, flags: LoginFlags::empty() },
            |_account, read_only| Ok(make_context(dir, read_only)),
        );
        session
    }

    #[test]
    fn store_file_then_get_block_index_then_diffed_store_reconstructs() {
        let dir = tempdir().unwrap();
        let mut session = logged_in_session(dir.path());
        let keystore = test_keystore();

        let v1 = vec![7u8; 20_000];
        let stream1 = encode_whole(&keystore, 0, b"a.bin", 1000, &v1);
        let reply = session.handle(
            Command::StoreFile {
                dir_id: 0,
                modification_time_us: 1000,
                name: b"a.bin".to_vec(),
                attributes: Vec::new(),
                diff_from_id: 0,
                content: stream1,
            },
            |_, _| unreachable!(),
        );
        let id1 = match reply {
            Reply::Success { object_id } => object_id,
            other => panic!("unexpected reply: {:?}", other),
        };

        let reply = session.handle(Command::GetBlockIndexByID { object_id: id1 }, |_, _| unreachable!());
        let old_index = match reply {
            Reply::SuccessWithStream { stream, .. } => {
                crate::codec::decode_index_only(std::io::Cursor::new(stream), &keystore).unwrap()
            }
            other => panic!("unexpected reply: {:?}", other),
        };

        let mut v2 = v1.clone();
        v2[10_000] = 0xAA;
        let mut diffed = Vec::new();
        let mut keep_alive = ();
        crate::codec::encode_diff(
            &v2,
            id1,
            &old_index,
            &crate::codec::EncodeParams {
                keystore: &keystore,
                container_id: 0,
                modification_time_us: 2000,
                filename: b"a.bin",
                attributes: b"",
                compress: true,
                block_config: crate::codec::ChunkSizeConfig::default(),
            },
            &mut diffed,
            &mut keep_alive,
        )
        .unwrap();

        let reply = session.handle(
            Command::StoreFile {
                dir_id: 0,
                modification_time_us: 2000,
                name: b"a.bin".to_vec(),
                attributes: Vec::new(),
                diff_from_id: id1,
                content: diffed,
            },
            |_, _| unreachable!(),
        );
        let id2 = match reply {
            Reply::Success { object_id } => object_id,
            other => panic!("unexpected reply: {:?}", other),
        };

        let reply = session.handle(Command::GetFile { object_id: id2, dir_id: 0 }, |_, _| unreachable!());
        match reply {
            Reply::SuccessWithStream { stream, .. } => assert_eq!(stream, v2),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn get_object_name_walks_parent_chain() {
        let dir = tempdir().unwrap();
        let mut session = logged_in_session(dir.path());
        let keystore = test_keystore();

        let reply = session.handle(
            Command::CreateDirectory {
                parent_id: 0,
                attributes: Vec::new(),
                attributes_mod_time_us: 0,
                name: b"sub".to_vec(),
            },
            |_, _| unreachable!(),
        );
        let sub_id = match reply {
            Reply::Success { object_id } => object_id,
            other => panic!("unexpected reply: {:?}", other),
        };

        let stream = encode_whole(&keystore, sub_id, b"f.txt", 1000, b"hi");
        let reply = session.handle(
            Command::StoreFile {
                dir_id: sub_id,
                modification_time_us: 1000,
                name: b"f.txt".to_vec(),
                attributes: Vec::new(),
                diff_from_id: 0,
                content: stream,
            },
            |_, _| unreachable!(),
        );
        let file_id = match reply {
            Reply::Success { object_id } => object_id,
            other => panic!("unexpected reply: {:?}", other),
        };

        let reply = session.handle(Command::GetObjectName { object_id: file_id, containing_dir_id: sub_id }, |_, _| unreachable!());
        match reply {
            Reply::ObjectName { count, name_elements, .. } => {
                assert_eq!(count, 2);
                assert_eq!(name_elements, vec![b"f.txt".to_vec(), b"sub".to_vec()]);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn get_block_index_by_name_resolves_live_object() {
        let dir = tempdir().unwrap();
        let mut session = logged_in_session(dir.path());
        let keystore = test_keystore();

        let stream = encode_whole(&keystore, 0, b"a.bin", 1000, b"content");
        session.handle(
            Command::StoreFile {
                dir_id: 0,
                modification_time_us: 1000,
                name: b"a.bin".to_vec(),
                attributes: Vec::new(),
                diff_from_id: 0,
                content: stream,
            },
            |_, _| unreachable!(),
        );

        let reply = session.handle(Command::GetBlockIndexByName { dir_id: 0, name: b"a.bin".to_vec() }, |_, _| unreachable!());
        match reply {
            Reply::SuccessWithStream { object_id, stream } => {
                assert_ne!(object_id, 0);
                let index = crate::codec::decode_index_only(std::io::Cursor::new(stream), &keystore).unwrap();
                assert!(!index.is_patch());
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = session.handle(Command::GetBlockIndexByName { dir_id: 0, name: b"missing".to_vec() }, |_, _| unreachable!());
        match reply {
            Reply::SuccessWithStream { object_id, stream } => {
                assert_eq!(object_id, 0);
                assert!(stream.is_empty());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
