//! In-memory representation of a decoded block index, shared by the diff
//! scanner, the decoder, and `combine`/`reverse`/`combine_patches`.

use crate::checksum::StrongChecksum;

/// One logical block's metadata, decrypted from the wire. `location`
/// records where its bytes physically live: in this stream's own chunk
/// body (`DataBlock`) or in another file's body by block number
/// (`OtherFileBlock`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    /// Bytes are chunk number `chunk_index` of this stream, `encoded_len`
    /// bytes once encoded.
    DataBlock { chunk_index: u64, encoded_len: u64 },
    /// Bytes live at block `old_block_index` of the file this stream is a
    /// patch against.
    OtherFileBlock { old_block_index: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct FileIndexEntry {
    pub clear_size: u32,
    pub weak: u32,
    pub strong: StrongChecksum,
    pub location: BlockLocation,
}

impl FileIndexEntry {
    pub fn is_data(&self) -> bool {
        matches!(self.location, BlockLocation::DataBlock { .. })
    }
}

/// A fully decoded block index: the metadata half of a file stream,
/// without the chunk bodies.
#[derive(Debug, Clone)]
pub struct FileIndex {
    pub other_file_id: i64,
    pub entry_iv_base: u64,
    pub entries: Vec<FileIndexEntry>,
}

impl FileIndex {
    pub fn is_patch(&self) -> bool {
        self.other_file_id != 0
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.is_data())
    }

    pub fn total_clear_len(&self) -> u64 {
        self.entries.iter().map(|e| e.clear_size as u64).sum()
    }

    /// Byte offset in the (logical, decoded) file where block `index`
    /// begins.
    pub fn block_offset(&self, index: u64) -> u64 {
        self.entries[..index as usize]
            .iter()
            .map(|e| e.clear_size as u64)
            .sum()
    }
}
