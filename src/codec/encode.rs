//! Whole-file and diff encoding: turning a plaintext file into a stream of
//! encrypted chunks plus a block index, either from scratch or as a patch
//! against a previously stored version using content-defined matching with
//! size prioritization.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{Context, Error};

use crate::checksum::{strong_checksum, ChecksumIndex, IndexEntry, RollingChecksum};
use crate::cipher::{encode_chunk, encrypt_index_entry, Keystore};
use crate::io::KeepAlive;

use super::block_size::{block_len, choose_block_schedule, ChunkSizeConfig};
use super::index::{BlockLocation, FileIndex, FileIndexEntry};
use super::wire::{
    write_attributes, write_framed, BlockIndexHeader, NameEncoding, RawBlockIndexEntry,
    StreamHeader, StreamOptions, MAX_CLEAR_HINT_SLOP,
};

/// Up to this many of the old file's distinct block sizes are tried during
/// diff matching, ordered by how much of the old file they cover.
const MAX_RETAINED_SIZES: usize = 4;
/// Sizes at or below this are never used as a diff match unit: matching
/// against tiny blocks costs more in scan time than it could ever save in
/// upload bytes.
const MIN_DIFF_BLOCK_SIZE: u64 = 256;
/// Abort the scan once found matches exceed this multiple of the old
/// file's block count -- a scan that keeps finding far more matches than
/// there are blocks is almost certainly thrashing on a degenerate input.
const MAX_MATCH_MULTIPLE: usize = 8;

pub struct EncodeParams<'a> {
    pub keystore: &'a Keystore,
    pub container_id: u64,
    pub modification_time_us: u64,
    /// Cleartext filename; encrypted into the stream.
    pub filename: &'a [u8],
    /// Cleartext attribute blob; encrypted into the stream.
    pub attributes: &'a [u8],
    pub compress: bool,
    pub block_config: ChunkSizeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Symlink,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeStats {
    pub num_blocks: u64,
    pub new_chunk_count: u64,
    pub matched_block_count: u64,
}

/// Encode a whole file. `source` must yield exactly `file_len` bytes. For
/// `FileKind::Symlink`, `file_len` is ignored and the stream carries zero
/// data blocks.
pub fn encode_whole_file<R: Read, W: Write>(
    mut source: R,
    file_len: u64,
    kind: FileKind,
    params: &EncodeParams,
    mut out: W,
) -> Result<EncodeStats, Error> {
    let schedule = if kind == FileKind::Symlink {
        super::block_size::BlockSchedule {
            num_blocks: 0,
            block_size: 0,
            last_block_size: 0,
        }
    } else {
        choose_block_schedule(file_len, &params.block_config)
    };

    let max_hint = schedule.block_size.max(schedule.last_block_size) as u32 + MAX_CLEAR_HINT_SLOP;

    let options = if kind == FileKind::Symlink {
        StreamOptions::SYMLINK
    } else {
        StreamOptions::empty()
    };

    let header = StreamHeader {
        num_blocks: schedule.num_blocks,
        container_id: params.container_id,
        modification_time_us: params.modification_time_us,
        max_block_clear_hint: max_hint,
        options,
    };
    header.write_to(&mut out)?;

    let encrypted_name = encode_chunk(params.keystore, params.filename, false)?;
    write_framed(&mut out, NameEncoding::Encrypted, &encrypted_name)?;

    let encrypted_attrs = encode_chunk(params.keystore, params.attributes, params.compress)?;
    write_attributes(&mut out, &encrypted_attrs)?;

    let mut iv_base_bytes = [0u8; 8];
    openssl::rand::rand_bytes(&mut iv_base_bytes)?;
    let entry_iv_base = u64::from_be_bytes(iv_base_bytes);

    let mut entries = Vec::with_capacity(schedule.num_blocks as usize);
    let mut buf = Vec::new();

    for i in 0..schedule.num_blocks {
        let clear_size = block_len(&schedule, i);
        buf.resize(clear_size as usize, 0);
        source
            .read_exact(&mut buf)
            .with_context(|| format!("reading block {} from source", i))?;

        let weak = RollingChecksum::new(&buf).value();
        let strong = strong_checksum(&buf)?;

        let encoded = encode_chunk(params.keystore, &buf, params.compress)?;
        out.write_all(&encoded)?;

        let meta = encrypt_index_entry(params.keystore, entry_iv_base, i, clear_size as u32, weak, &strong)?;

        entries.push(RawBlockIndexEntry {
            encoded_size_or_negative_ref: encoded.len() as i64,
            encrypted_meta: meta,
        });
    }

    let index_header = BlockIndexHeader {
        other_file_id: 0,
        entry_iv_base,
        num_blocks: schedule.num_blocks,
    };
    index_header.write_to(&mut out)?;
    for e in &entries {
        e.write_to(&mut out)?;
    }

    Ok(EncodeStats {
        num_blocks: schedule.num_blocks,
        new_chunk_count: schedule.num_blocks,
        matched_block_count: 0,
    })
}

/// A single instruction in a diff recipe: an optional run of literal new
/// bytes followed by an optional contiguous run of old-file blocks.
#[derive(Debug, Clone)]
struct Instruction {
    new_data_offset: u64,
    new_data_len: u64,
    old_run_start: Option<u64>,
    old_run_count: u64,
}

impl Instruction {
    fn is_empty(&self) -> bool {
        self.new_data_len == 0 && self.old_run_start.is_none()
    }
}

/// Outcome of building a diff recipe: either a genuine patch, or a
/// "completely different" fallback that is really a whole-file upload.
pub enum DiffOutcome {
    Patch,
    CompletelyDifferent,
}

/// Scan `new_data` for blocks matching entries in `old_index`, using
/// content-defined matching with size prioritization. Returns a match map
/// from new-file offset to `(old_block_index, matched_size)`.
fn scan_for_matches(
    new_data: &[u8],
    old_index: &FileIndex,
    keep_alive: &mut dyn KeepAlive,
) -> Result<BTreeMap<u64, (u64, u64)>, Error> {
    // Tally coverage per distinct block size among the old index's data-
    // carrying entries (every entry carries size/weak/strong regardless of
    // whether its bytes live here or in yet another file).
    let mut coverage: BTreeMap<u32, u64> = BTreeMap::new();
    for e in &old_index.entries {
        if (e.clear_size as u64) > MIN_DIFF_BLOCK_SIZE {
            *coverage.entry(e.clear_size).or_insert(0) += e.clear_size as u64;
        }
    }

    let mut sizes: Vec<u32> = coverage.keys().copied().collect();
    sizes.sort_by_key(|s| std::cmp::Reverse(coverage[s]));
    sizes.truncate(MAX_RETAINED_SIZES);

    let mut matches: BTreeMap<u64, (u64, u64)> = BTreeMap::new();
    let match_limit = old_index.entries.len() * MAX_MATCH_MULTIPLE;

    for &size in &sizes {
        let size_usize = size as usize;
        if size_usize == 0 || new_data.len() < size_usize {
            continue;
        }

        let mut index = ChecksumIndex::new();
        for (i, e) in old_index.entries.iter().enumerate() {
            if e.clear_size == size {
                index.insert(
                    (e.weak >> 16) as u16,
                    IndexEntry {
                        block_index: i as u64,
                        strong: e.strong,
                    },
                );
            }
        }

        let mut pos = 0usize;
        let mut rolling = RollingChecksum::new(&new_data[pos..pos + size_usize]);

        loop {
            if !keep_alive.keep_going() {
                break;
            }
            if matches.len() > match_limit {
                break;
            }

            let key = rolling.hash_key();
            let mut jumped = false;
            for cand in index.candidates(key) {
                let window = &new_data[pos..pos + size_usize];
                if strong_checksum(window)? == cand.strong {
                    let offset = pos as u64;
                    let better = matches
                        .get(&offset)
                        .map(|&(_, existing_size)| existing_size < size as u64)
                        .unwrap_or(true);
                    if better {
                        matches.insert(offset, (cand.block_index, size as u64));
                    }
                    pos += size_usize;
                    jumped = true;
                    break;
                }
            }

            if !jumped {
                pos += 1;
            }

            if pos + size_usize > new_data.len() {
                break;
            }

            if jumped {
                rolling = RollingChecksum::new(&new_data[pos..pos + size_usize]);
            } else {
                rolling.roll(new_data[pos - 1], new_data[pos + size_usize - 1]);
            }
        }
    }

    Ok(matches)
}

/// Turn a match map into an ordered list of recipe instructions.
fn build_recipe(matches: &BTreeMap<u64, (u64, u64)>, new_len: u64) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut cursor = 0u64;
    let mut current = Instruction {
        new_data_offset: 0,
        new_data_len: 0,
        old_run_start: None,
        old_run_count: 0,
    };

    let flush = |instr: Instruction, out: &mut Vec<Instruction>| {
        if !instr.is_empty() {
            out.push(instr);
        }
    };

    for (&offset, &(old_idx, size)) in matches.iter() {
        let gap = offset - cursor;
        if gap > 0 {
            flush(current, &mut instructions);
            current = Instruction {
                new_data_offset: cursor,
                new_data_len: gap,
                old_run_start: None,
                old_run_count: 0,
            };
            cursor = offset;
        }

        match current.old_run_start {
            Some(start) if old_idx == start + current.old_run_count => {
                current.old_run_count += 1;
            }
            Some(_) => {
                flush(current, &mut instructions);
                current = Instruction {
                    new_data_offset: offset,
                    new_data_len: 0,
                    old_run_start: Some(old_idx),
                    old_run_count: 1,
                };
            }
            None => {
                current.old_run_start = Some(old_idx);
                current.old_run_count = 1;
            }
        }

        cursor = offset + size;
    }

    if cursor < new_len {
        flush(current, &mut instructions);
        current = Instruction {
            new_data_offset: cursor,
            new_data_len: new_len - cursor,
            old_run_start: None,
            old_run_count: 0,
        };
    }
    flush(current, &mut instructions);

    instructions
}

/// Encode a diff of `new_data` against `old_index`. `new_data` must be the
/// full plaintext of the new file, so the matcher can seek within it
/// freely; the emitter only ever reads the gaps the recipe calls for.
pub fn encode_diff<W: Write>(
    new_data: &[u8],
    diff_from_object_id: u64,
    old_index: &FileIndex,
    params: &EncodeParams,
    mut out: W,
    keep_alive: &mut dyn KeepAlive,
) -> Result<(EncodeStats, DiffOutcome), Error> {
    let matches = scan_for_matches(new_data, old_index, keep_alive)?;
    let instructions = build_recipe(&matches, new_data.len() as u64);

    let (other_file_id, outcome) = if matches.is_empty() {
        (0u64, DiffOutcome::CompletelyDifferent)
    } else {
        (diff_from_object_id, DiffOutcome::Patch)
    };

    let mut new_block_count = 0u64;
    let mut old_block_count = 0u64;
    for instr in &instructions {
        if instr.new_data_len > 0 {
            new_block_count += 1;
        }
        old_block_count += instr.old_run_count;
    }
    let total_blocks = new_block_count + old_block_count;

    let max_hint = new_data.len().min(u32::MAX as usize) as u32 + MAX_CLEAR_HINT_SLOP;
    let header = StreamHeader {
        num_blocks: total_blocks,
        container_id: params.container_id,
        modification_time_us: params.modification_time_us,
        max_block_clear_hint: max_hint,
        options: StreamOptions::empty(),
    };
    header.write_to(&mut out)?;

    let encrypted_name = encode_chunk(params.keystore, params.filename, false)?;
    write_framed(&mut out, NameEncoding::Encrypted, &encrypted_name)?;

    let encrypted_attrs = encode_chunk(params.keystore, params.attributes, params.compress)?;
    write_attributes(&mut out, &encrypted_attrs)?;

    let mut iv_base_bytes = [0u8; 8];
    openssl::rand::rand_bytes(&mut iv_base_bytes)?;
    let entry_iv_base = u64::from_be_bytes(iv_base_bytes);

    let mut entries = Vec::with_capacity(total_blocks as usize);
    let mut new_chunk_count = 0u64;

    for instr in &instructions {
        if instr.new_data_len > 0 {
            let slice = &new_data
                [instr.new_data_offset as usize..(instr.new_data_offset + instr.new_data_len) as usize];
            let weak = RollingChecksum::new(slice).value();
            let strong = strong_checksum(slice)?;
            let encoded = encode_chunk(params.keystore, slice, params.compress)?;
            out.write_all(&encoded)?;
            let meta = encrypt_index_entry(
                params.keystore,
                entry_iv_base,
                entries.len() as u64,
                instr.new_data_len as u32,
                weak,
                &strong,
            )?;
            entries.push(RawBlockIndexEntry {
                encoded_size_or_negative_ref: encoded.len() as i64,
                encrypted_meta: meta,
            });
            new_chunk_count += 1;
        }

        if let Some(start_old) = instr.old_run_start {
            for k in 0..instr.old_run_count {
                let old_idx = start_old + k;
                let old_entry = &old_index.entries[old_idx as usize];
                let meta = encrypt_index_entry(
                    params.keystore,
                    entry_iv_base,
                    entries.len() as u64,
                    old_entry.clear_size,
                    old_entry.weak,
                    &old_entry.strong,
                )?;
                entries.push(RawBlockIndexEntry {
                    encoded_size_or_negative_ref: -(old_idx as i64) - 1,
                    encrypted_meta: meta,
                });
            }
        }
    }

    let index_header = BlockIndexHeader {
        other_file_id: if matches!(outcome, DiffOutcome::Patch) {
            diff_from_object_id as i64
        } else {
            0
        },
        entry_iv_base,
        num_blocks: entries.len() as u64,
    };
    index_header.write_to(&mut out)?;
    for e in &entries {
        e.write_to(&mut out)?;
    }

    Ok((
        EncodeStats {
            num_blocks: entries.len() as u64,
            new_chunk_count,
            matched_block_count: old_block_count,
        },
        outcome,
    ))
}

/// Build a [`FileIndex`] directly from an in-memory whole file, for tests
/// and for constructing the "current" index a live upload is diffed
/// against without a storage round trip.
pub fn index_of_whole_file(data: &[u8], schedule: &super::block_size::BlockSchedule) -> Result<FileIndex, Error> {
    let mut entries = Vec::with_capacity(schedule.num_blocks as usize);
    let mut offset = 0usize;
    for i in 0..schedule.num_blocks {
        let len = block_len(schedule, i) as usize;
        let slice = &data[offset..offset + len];
        entries.push(FileIndexEntry {
            clear_size: len as u32,
            weak: RollingChecksum::new(slice).value(),
            strong: strong_checksum(slice)?,
            location: BlockLocation::DataBlock {
                chunk_index: i,
                encoded_len: 0,
            },
        });
        offset += len;
    }
    Ok(FileIndex {
        other_file_id: 0,
        entry_iv_base: 0,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_covers_whole_file_when_identical() {
        let data = vec![42u8; 256 * 1024];
        let schedule = choose_block_schedule(data.len() as u64, &ChunkSizeConfig::default());
        let old_index = index_of_whole_file(&data, &schedule).unwrap();
        let matches = scan_for_matches(&data, &old_index, &mut ()).unwrap();
        assert!(!matches.is_empty());
        let instructions = build_recipe(&matches, data.len() as u64);
        let literal_bytes: u64 = instructions.iter().map(|i| i.new_data_len).sum();
        assert_eq!(literal_bytes, 0, "identical file should need no new bytes");
    }

    #[test]
    fn recipe_isolates_single_byte_change() {
        let mut data = vec![7u8; 256 * 1024];
        let schedule = choose_block_schedule(data.len() as u64, &ChunkSizeConfig::default());
        let old_index = index_of_whole_file(&data, &schedule).unwrap();
        data[100_000] ^= 0xFF;
        let matches = scan_for_matches(&data, &old_index, &mut ()).unwrap();
        let instructions = build_recipe(&matches, data.len() as u64);
        let new_instrs = instructions.iter().filter(|i| i.new_data_len > 0).count();
        assert!(new_instrs <= 2, "got {} literal instructions", new_instrs);
    }
}
