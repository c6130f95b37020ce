//! File content codec: turning plaintext file data into an encrypted,
//! deduplicated stream and back, plus the patch arithmetic needed to keep
//! a chain of diffs consistent as old versions are reclaimed.
//!
//! Submodules are layered bottom-up: [`wire`] is the raw byte format,
//! [`block_size`] decides how a file is chunked, [`index`] is the decoded
//! in-memory form of a stream's metadata, [`encode`]/[`decode`] move
//! between plaintext and stream bytes, and [`combine`] operates purely on
//! decoded streams and plaintext.

pub mod block_size;
pub mod combine;
pub mod decode;
pub mod encode;
pub mod index;
pub mod wire;

pub use block_size::{choose_block_schedule, BlockSchedule, ChunkSizeConfig};
pub use combine::{collapse_to_whole_file, combine, combine_patches, reverse};
pub use decode::{decode_attributes, decode_body, decode_index_only, decode_name, decode_stream, verify_stream, DecodedStream};
pub use encode::{encode_diff, encode_whole_file, index_of_whole_file, DiffOutcome, EncodeParams, EncodeStats, FileKind};
pub use index::{BlockLocation, FileIndex, FileIndexEntry};
