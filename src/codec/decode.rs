//! Decoding and verification of an encoded file stream.
//!
//! A stream is read sequentially: header, name, attributes, then the
//! chunk bodies and trailing block index read together, since a chunk's
//! length on the wire is only recorded in the index that follows it.

use std::convert::TryInto;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Error};

use crate::checksum::{strong_checksum, RollingChecksum};
use crate::cipher::{decode_chunk, decrypt_index_entry, Keystore};

use super::index::{BlockLocation, FileIndex, FileIndexEntry};
use super::wire::{
    index_entry_crypto_len, read_attributes, read_framed, BlockIndexHeader, NameEncoding,
    RawBlockIndexEntry, StreamHeader, BLOCK_INDEX_MAGIC_V1,
};

/// Everything decoded from a stream's non-data portions, plus the chunk
/// bodies in on-wire (still encoded) form. [`decode_body`] turns these
/// into plaintext once a full pass is wanted.
pub struct DecodedStream {
    pub header: StreamHeader,
    pub name_encoding: NameEncoding,
    pub encrypted_name: Vec<u8>,
    pub encrypted_attributes: Vec<u8>,
    pub encoded_chunks: Vec<Vec<u8>>,
    pub index: FileIndex,
}

/// Locate the `BlockIndexHeader` magic within a buffer known to contain
/// exactly one block index at its tail. A well-formed stream never has
/// that magic appear in chunk ciphertext at a position that also parses as
/// a header with a matching entry count, so scanning from the end and
/// taking the first hit is reliable in practice; a corrupt stream that
/// defeats this is caught downstream by checksum verification.
fn find_block_index_header(buf: &[u8]) -> Option<usize> {
    if buf.len() < BlockIndexHeader::ENCODED_LEN {
        return None;
    }
    let magic = BLOCK_INDEX_MAGIC_V1.to_be_bytes();
    let mut pos = buf.len() - BlockIndexHeader::ENCODED_LEN;
    loop {
        if buf[pos..pos + 4] == magic[..] {
            return Some(pos);
        }
        if pos == 0 {
            return None;
        }
        pos -= 1;
    }
}

/// Decode a stream's header, name, attributes, and block index, leaving
/// chunk bodies in encoded form.
pub fn decode_stream<R: Read>(mut r: R, keystore: &Keystore) -> Result<DecodedStream, Error> {
    let header = StreamHeader::read_from(&mut r)?;
    let (name_encoding, encrypted_name) = read_framed(&mut r)?;
    let encrypted_attributes = read_attributes(&mut r)?;

    let mut rest = Vec::new();
    r.read_to_end(&mut rest)?;

    let index_offset = find_block_index_header(&rest)
        .ok_or_else(|| anyhow::anyhow!("block index header not found in stream"))?;
    let (chunk_bytes, mut index_bytes) = rest.split_at(index_offset);
    let index_header = BlockIndexHeader::read_from(&mut index_bytes)?;

    let meta_len = index_entry_crypto_len(keystore.cipher().openssl_cipher());

    let mut raw_entries = Vec::with_capacity(index_header.num_blocks as usize);
    for _ in 0..index_header.num_blocks {
        raw_entries.push(RawBlockIndexEntry::read_from(&mut index_bytes, meta_len)?);
    }

    let mut cursor = 0usize;
    let mut encoded_chunks = Vec::new();
    let mut entries = Vec::with_capacity(raw_entries.len());

    for (i, raw) in raw_entries.iter().enumerate() {
        let (clear_size, weak, strong) =
            decrypt_index_entry(keystore, index_header.entry_iv_base, i as u64, &raw.encrypted_meta)?;

        let location = if raw.is_data_block() {
            let len = raw.encoded_size_or_negative_ref as usize;
            if cursor + len > chunk_bytes.len() {
                bail!("chunk {} extends past end of stream", i);
            }
            let chunk = chunk_bytes[cursor..cursor + len].to_vec();
            cursor += len;
            let chunk_index = encoded_chunks.len() as u64;
            encoded_chunks.push(chunk);
            BlockLocation::DataBlock {
                chunk_index,
                encoded_len: len as u64,
            }
        } else {
            let old_block_index = (-raw.encoded_size_or_negative_ref - 1) as u64;
            BlockLocation::OtherFileBlock { old_block_index }
        };

        entries.push(FileIndexEntry {
            clear_size,
            weak,
            strong,
            location,
        });
    }

    if cursor != chunk_bytes.len() {
        bail!(
            "stream has {} trailing bytes between last chunk and block index",
            chunk_bytes.len() - cursor
        );
    }

    let index = FileIndex {
        other_file_id: index_header.other_file_id,
        entry_iv_base: index_header.entry_iv_base,
        entries,
    };

    Ok(DecodedStream {
        header,
        name_encoding,
        encrypted_name,
        encrypted_attributes,
        encoded_chunks,
        index,
    })
}

/// Decrypt and return the plaintext filename.
pub fn decode_name(keystore: &Keystore, decoded: &DecodedStream) -> Result<Vec<u8>, Error> {
    if decoded.name_encoding != NameEncoding::Encrypted {
        bail!("unexpected clear-text name encoding");
    }
    decode_chunk(keystore, &decoded.encrypted_name)
}

/// Decrypt and return the plaintext attribute blob.
pub fn decode_attributes(keystore: &Keystore, decoded: &DecodedStream) -> Result<Vec<u8>, Error> {
    decode_chunk(keystore, &decoded.encrypted_attributes)
}

/// Reassemble the full plaintext file. For a patch stream, `older` must
/// supply the plaintext bytes of the file this stream diffs against
/// together with *that file's own* [`FileIndex`] -- `old_block_index`
/// values are block numbers into the old file's index, not this stream's
/// own, and the two only coincide for append-only or uniform-block-size
/// diffs. Passing the patch's own index here would silently misplace
/// every referenced block once the old file's block layout differs from
/// this stream's.
pub fn decode_body(
    keystore: &Keystore,
    decoded: &DecodedStream,
    older: Option<(&[u8], &FileIndex)>,
) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(decoded.index.total_clear_len() as usize);
    for entry in &decoded.index.entries {
        match entry.location {
            BlockLocation::DataBlock { chunk_index, .. } => {
                let chunk = decoded
                    .encoded_chunks
                    .get(chunk_index as usize)
                    .ok_or_else(|| anyhow::anyhow!("missing chunk {}", chunk_index))?;
                let plain = decode_chunk(keystore, chunk)?;
                if plain.len() != entry.clear_size as usize {
                    bail!(
                        "chunk {} decoded to {} bytes, index says {}",
                        chunk_index,
                        plain.len(),
                        entry.clear_size
                    );
                }
                out.extend_from_slice(&plain);
            }
            BlockLocation::OtherFileBlock { old_block_index } => {
                let (older, old_index) =
                    older.ok_or_else(|| anyhow::anyhow!("patch stream needs the older file's content"))?;
                let old_offset: usize = old_index
                    .block_offset(old_block_index)
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("old block offset overflowed usize"))?;
                let len = entry.clear_size as usize;
                if old_offset + len > older.len() {
                    bail!("referenced old block {} runs past end of older file", old_block_index);
                }
                out.extend_from_slice(&older[old_offset..old_offset + len]);
            }
        }
    }
    Ok(out)
}

/// Verify a decoded stream's integrity: every data chunk decrypts cleanly
/// and its plaintext matches the weak and strong checksums recorded for
/// it in the index. Referenced old-file blocks are not re-verified here,
/// since they were already verified when that older file was stored.
pub fn verify_stream(keystore: &Keystore, decoded: &DecodedStream) -> Result<(), Error> {
    for (i, entry) in decoded.index.entries.iter().enumerate() {
        if let BlockLocation::DataBlock { chunk_index, .. } = entry.location {
            let chunk = decoded
                .encoded_chunks
                .get(chunk_index as usize)
                .ok_or_else(|| anyhow::anyhow!("missing chunk {}", chunk_index))?;
            let plain = decode_chunk(keystore, chunk)?;
            if plain.len() != entry.clear_size as usize {
                bail!("entry {} clear size mismatch", i);
            }
            let weak = RollingChecksum::new(&plain).value();
            if weak != entry.weak {
                bail!("entry {} weak checksum mismatch", i);
            }
            let strong = strong_checksum(&plain)?;
            if strong != entry.strong {
                bail!("entry {} strong checksum mismatch", i);
            }
        }
    }
    Ok(())
}

/// Decode only the block index from a stream, skipping chunk bodies, by
/// locating the index from the tail. Used when only metadata (patch-chain
/// linkage, total size) is needed -- resolving a diff chain, or checking
/// liveness of a stored object without touching its content.
pub fn decode_index_only<R: Read + Seek>(mut r: R, keystore: &Keystore) -> Result<FileIndex, Error> {
    r.seek(SeekFrom::Start(0))?;
    let mut all = Vec::new();
    r.read_to_end(&mut all)?;
    let index_offset = find_block_index_header(&all)
        .ok_or_else(|| anyhow::anyhow!("block index header not found in stream"))?;
    let mut index_bytes = &all[index_offset..];
    let index_header = BlockIndexHeader::read_from(&mut index_bytes)?;
    let meta_len = index_entry_crypto_len(keystore.cipher().openssl_cipher());

    let mut entries = Vec::with_capacity(index_header.num_blocks as usize);
    for i in 0..index_header.num_blocks {
        let raw = RawBlockIndexEntry::read_from(&mut index_bytes, meta_len)?;
        let (clear_size, weak, strong) =
            decrypt_index_entry(keystore, index_header.entry_iv_base, i, &raw.encrypted_meta)?;
        let location = if raw.is_data_block() {
            BlockLocation::DataBlock {
                chunk_index: i,
                encoded_len: raw.encoded_size_or_negative_ref as u64,
            }
        } else {
            BlockLocation::OtherFileBlock {
                old_block_index: (-raw.encoded_size_or_negative_ref - 1) as u64,
            }
        };
        entries.push(FileIndexEntry {
            clear_size,
            weak,
            strong,
            location,
        });
    }

    Ok(FileIndex {
        other_file_id: index_header.other_file_id,
        entry_iv_base: index_header.entry_iv_base,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherTag;
    use crate::codec::block_size::ChunkSizeConfig;
    use crate::codec::encode::{encode_whole_file, EncodeParams, FileKind};

    fn keystore() -> Keystore {
        let len = CipherTag::Aes128Cbc.openssl_cipher().key_len();
        Keystore::new(vec![5; len], vec![6; len], CipherTag::Aes128Cbc).unwrap()
    }

    #[test]
    fn whole_file_round_trips() {
        let ks = keystore();
        let data = b"hello, this is a small test file with some content in it".to_vec();
        let params = EncodeParams {
            keystore: &ks,
            container_id: 1,
            modification_time_us: 1234,
            filename: b"test.txt",
            attributes: b"attrs",
            compress: true,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        encode_whole_file(&data[..], data.len() as u64, FileKind::Regular, &params, &mut out).unwrap();

        let decoded = decode_stream(&out[..], &ks).unwrap();
        assert_eq!(decode_name(&ks, &decoded).unwrap(), b"test.txt");
        assert_eq!(decode_attributes(&ks, &decoded).unwrap(), b"attrs");
        verify_stream(&ks, &decoded).unwrap();
        assert_eq!(decode_body(&ks, &decoded, None).unwrap(), data);
    }

    #[test]
    fn corrupted_chunk_fails_verification() {
        let ks = keystore();
        let data = vec![9u8; 20_000];
        let params = EncodeParams {
            keystore: &ks,
            container_id: 1,
            modification_time_us: 1234,
            filename: b"f",
            attributes: b"",
            compress: false,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        encode_whole_file(&data[..], data.len() as u64, FileKind::Regular, &params, &mut out).unwrap();

        // Flip a byte inside the first chunk body, after the stream header
        // and the framed name/attributes.
        let corrupt_at = StreamHeader::ENCODED_LEN + 3 + b"f".len() + 4;
        out[corrupt_at] ^= 0xFF;

        let decoded = decode_stream(&out[..], &ks).unwrap();
        assert!(verify_stream(&ks, &decoded).is_err());
    }

    #[test]
    fn diffed_file_reassembles_with_older_content() {
        use crate::codec::encode::{encode_diff, index_of_whole_file};

        let ks = keystore();
        let old_data = vec![1u8; 50_000];
        let schedule = crate::codec::block_size::choose_block_schedule(
            old_data.len() as u64,
            &ChunkSizeConfig::default(),
        );
        let old_index = index_of_whole_file(&old_data, &schedule).unwrap();

        let mut new_data = old_data.clone();
        new_data.extend_from_slice(b"appended tail bytes");

        let params = EncodeParams {
            keystore: &ks,
            container_id: 2,
            modification_time_us: 999,
            filename: b"f2",
            attributes: b"",
            compress: false,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        let mut keep_alive = ();
        let (_stats, _outcome) =
            encode_diff(&new_data, 1, &old_index, &params, &mut out, &mut keep_alive).unwrap();

        let decoded = decode_stream(&out[..], &ks).unwrap();
        let rebuilt = decode_body(&ks, &decoded, Some((&old_data, &old_index))).unwrap();
        assert_eq!(rebuilt, new_data);
    }

    /// Old file laid out as three unevenly sized blocks (4096/4096/1000);
    /// new file reuses the last two old blocks after a literal prefix, so
    /// the second referenced block's real old-file offset (4096) differs
    /// from the prefix-sum over the *patch's own* two-entry index (500).
    /// Catches offsets computed from the wrong index instead of the old
    /// file's real block layout.
    #[test]
    fn diff_with_uneven_old_blocks_reassembles_correctly() {
        use crate::codec::encode::encode_diff;

        let ks = keystore();
        let block_a = vec![0xAAu8; 4096];
        let block_b = vec![0xBBu8; 4096];
        let block_c = vec![0xCCu8; 1000];
        let mut old_data = Vec::new();
        old_data.extend_from_slice(&block_a);
        old_data.extend_from_slice(&block_b);
        old_data.extend_from_slice(&block_c);

        let make_entry = |chunk_index: u64, data: &[u8]| FileIndexEntry {
            clear_size: data.len() as u32,
            weak: RollingChecksum::new(data).value(),
            strong: strong_checksum(data).unwrap(),
            location: BlockLocation::DataBlock { chunk_index, encoded_len: 0 },
        };
        let old_index = FileIndex {
            other_file_id: 0,
            entry_iv_base: 0,
            entries: vec![make_entry(0, &block_a), make_entry(1, &block_b), make_entry(2, &block_c)],
        };

        let mut new_data = vec![0x11u8; 500];
        new_data.extend_from_slice(&block_a);
        new_data.extend_from_slice(&block_b);

        let params = EncodeParams {
            keystore: &ks,
            container_id: 3,
            modification_time_us: 1,
            filename: b"f3",
            attributes: b"",
            compress: false,
            block_config: ChunkSizeConfig::default(),
        };
        let mut out = Vec::new();
        let mut keep_alive = ();
        encode_diff(&new_data, 1, &old_index, &params, &mut out, &mut keep_alive).unwrap();

        let decoded = decode_stream(&out[..], &ks).unwrap();
        let rebuilt = decode_body(&ks, &decoded, Some((&old_data, &old_index))).unwrap();
        assert_eq!(rebuilt, new_data);
    }
}
