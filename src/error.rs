//! Typed errors for the parts of the system that cross a module boundary.
//!
//! [`StoreError`] carries exactly the wire-visible kinds from the protocol
//! design (version/login/phase errors, not-found, quota, patch-chain
//! consistency). Anything else -- format corruption, short reads, invariant
//! violations -- propagates as [`anyhow::Error`] and is only ever handled by
//! closing the session; it is deliberately not part of this enum so that it
//! can't accidentally leak onto the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that the protocol layer maps to a typed `Error` reply.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("client protocol version not supported")]
    WrongVersion,

    #[error("login rejected")]
    BadLogin,

    #[error("could not acquire write lock for account")]
    CannotLockStoreForWriting,

    #[error("session is read-only")]
    SessionReadOnly,

    #[error("command not valid in current protocol phase")]
    NotInRightProtocolPhase,

    #[error("object does not exist")]
    DoesNotExist,

    #[error("object does not exist in directory")]
    DoesNotExistInDirectory,

    #[error("cannot delete the root directory")]
    CannotDeleteRoot,

    #[error("directory already exists")]
    DirectoryAlreadyExists,

    #[error("target name already exists")]
    TargetNameExists,

    #[error("diff-from file does not exist")]
    DiffFromFileDoesNotExist,

    #[error("uploaded file does not verify")]
    FileDoesNotVerify,

    #[error("account storage limit exceeded")]
    StorageLimitExceeded,

    #[error("patch chain is inconsistent")]
    PatchConsistencyError,
}

/// Errors that are never sent to a client: they are programming/format
/// errors that cause the owning session to abort.
#[derive(Debug, Error)]
pub enum InternalError {
    #[error("backup store file has a bad or unrecognized format: {0}")]
    BadStoreFile(String),

    #[error("could not read the entire structure from the stream")]
    CouldntReadEntireStructure,

    #[error("block entry encoding didn't give the expected length")]
    BlockEntryLengthMismatch,

    #[error("cannot diff against an incomplete store file")]
    CannotDiffIncompleteFile,

    #[error("file added to the store does not verify")]
    AddedFileDoesNotVerify,

    #[error("file added to the store exceeds the storage limit")]
    AddedFileExceedsStorageLimit,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Result alias for code that only ever fails with a wire-visible error.
pub type StoreResult<T> = Result<T, StoreError>;
