//! Core of an encrypted, content-deduplicated backup store.
//!
//! # Data flow
//!
//! A client walks a local directory tree ([`client::directory_record`]),
//! diffs file contents against a block index the server already holds
//! ([`codec`], using [`checksum`] and [`cipher`]), and uploads a minimized
//! encrypted patch over the session protocol ([`protocol`]). The server
//! applies the patch under a per-account write lock
//! ([`store::lock`]), persists the result through the striped storage
//! layer ([`raid`]), and updates the account's directory objects
//! ([`store::directory`]) and quota ledger ([`store::ledger`]). A
//! background task ([`housekeeping`]) reclaims space and keeps the ledger
//! honest.
//!
//! # Layering
//!
//! ```text
//! protocol       -- version/login/command state machine
//!   |
//! store::context -- per-session mutation engine (AddFile, DeleteFile, ...)
//!   |
//! store::{directory,ledger,lock}
//!   |
//! codec          -- whole-file / diff encode, decode, verify, combine
//!   |
//! checksum, cipher
//!   |
//! raid           -- striped on-disc object store
//!   |
//! io             -- uniform byte stream abstraction
//! ```
//!
//! `housekeeping` and `client` sit beside this stack: housekeeping drives
//! `store::context` under the account lock between sessions, and
//! `client::directory_record` is the client-side counterpart that decides
//! what to upload.

pub mod error;
pub mod io;
pub mod checksum;
pub mod cipher;
pub mod codec;
pub mod raid;
pub mod config;
pub mod store;
pub mod protocol;
pub mod housekeeping;
pub mod client;
pub mod wire;
