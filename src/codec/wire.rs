//! On-wire/on-disk file stream format: header, encrypted filename,
//! encrypted attributes, chunks, then a block-index footer.
//!
//! All multi-byte integers are network byte order (big-endian). Magic
//! values are v1-only; no v0 compatibility is implemented.

use std::convert::TryInto;
use std::io::{Read, Write};

use anyhow::{bail, Context, Error};

pub const STREAM_MAGIC_V1: u32 = 0x6669_6c31; // "fil1"
pub const BLOCK_INDEX_MAGIC_V1: u32 = 0x6669_7831; // "fix1"

bitflags::bitflags! {
    /// `options` bits in [`StreamHeader`].
    pub struct StreamOptions: u32 {
        const SYMLINK = 0x0000_0001;
    }
}

/// Extra bytes added to the true maximum chunk size when computing the
/// stream header's `max_block_clear_hint`, so the hint doesn't reveal the
/// exact chosen block size to an observer of encrypted stream lengths.
pub const MAX_CLEAR_HINT_SLOP: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub num_blocks: u64,
    pub container_id: u64,
    pub modification_time_us: u64,
    pub max_block_clear_hint: u32,
    pub options: StreamOptions,
}

impl StreamHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&STREAM_MAGIC_V1.to_be_bytes())?;
        w.write_all(&self.num_blocks.to_be_bytes())?;
        w.write_all(&self.container_id.to_be_bytes())?;
        w.write_all(&self.modification_time_us.to_be_bytes())?;
        w.write_all(&self.max_block_clear_hint.to_be_bytes())?;
        w.write_all(&self.options.bits().to_be_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).context("reading stream header magic")?;
        if u32::from_be_bytes(magic) != STREAM_MAGIC_V1 {
            bail!("bad stream header magic (not a v1 file stream)");
        }
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        let num_blocks = u64::from_be_bytes(buf);
        r.read_exact(&mut buf)?;
        let container_id = u64::from_be_bytes(buf);
        r.read_exact(&mut buf)?;
        let modification_time_us = u64::from_be_bytes(buf);
        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let max_block_clear_hint = u32::from_be_bytes(buf4);
        r.read_exact(&mut buf4)?;
        let options = StreamOptions::from_bits_truncate(u32::from_be_bytes(buf4));
        Ok(Self {
            num_blocks,
            container_id,
            modification_time_us,
            max_block_clear_hint,
            options,
        })
    }

    pub const ENCODED_LEN: usize = 4 + 8 + 8 + 8 + 4 + 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexHeader {
    /// 0 for a whole file; the diffed-from object ID for a patch.
    pub other_file_id: i64,
    pub entry_iv_base: u64,
    pub num_blocks: u64,
}

impl BlockIndexHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&BLOCK_INDEX_MAGIC_V1.to_be_bytes())?;
        w.write_all(&self.other_file_id.to_be_bytes())?;
        w.write_all(&self.entry_iv_base.to_be_bytes())?;
        w.write_all(&self.num_blocks.to_be_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).context("reading block index header magic")?;
        if u32::from_be_bytes(magic) != BLOCK_INDEX_MAGIC_V1 {
            bail!("bad block index header magic (not a v1 block index)");
        }
        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8)?;
        let other_file_id = i64::from_be_bytes(buf8);
        r.read_exact(&mut buf8)?;
        let entry_iv_base = u64::from_be_bytes(buf8);
        r.read_exact(&mut buf8)?;
        let num_blocks = u64::from_be_bytes(buf8);
        Ok(Self {
            other_file_id,
            entry_iv_base,
            num_blocks,
        })
    }

    pub const ENCODED_LEN: usize = 4 + 8 + 8 + 8;
}

/// Fixed-size encrypted payload carried by every block-index entry, once
/// serialized: `encrypt_index_entry` always produces this many bytes for a
/// given cipher (24 bytes of plaintext, CBC-padded to the next block).
pub fn index_entry_crypto_len(cipher: openssl::symm::Cipher) -> usize {
    let bs = cipher.block_size();
    let plain = 24usize;
    ((plain / bs) + 1) * bs
}

/// One on-wire block-index entry: either a positive encoded size (a real
/// chunk follows in the body) or a negative reference to a block of the
/// file this stream diffs against.
#[derive(Debug, Clone)]
pub struct RawBlockIndexEntry {
    pub encoded_size_or_negative_ref: i64,
    pub encrypted_meta: Vec<u8>,
}

impl RawBlockIndexEntry {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&self.encoded_size_or_negative_ref.to_be_bytes())?;
        w.write_all(&self.encrypted_meta)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, meta_len: usize) -> Result<Self, Error> {
        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8)?;
        let encoded_size_or_negative_ref = i64::from_be_bytes(buf8);
        let mut encrypted_meta = vec![0u8; meta_len];
        r.read_exact(&mut encrypted_meta)?;
        Ok(Self {
            encoded_size_or_negative_ref,
            encrypted_meta,
        })
    }

    pub fn is_data_block(&self) -> bool {
        self.encoded_size_or_negative_ref > 0
    }
}

/// Length-prefixed filename: first two bytes are `{encoding: u8, length: u8
/// high bit continuation}` simplified here to a one-byte encoding tag plus
/// a `u16` length, enough for a self-describing framing of either a clear
/// or encrypted name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameEncoding {
    Clear = 0,
    Encrypted = 1,
}

pub fn write_framed<W: Write>(w: &mut W, encoding: NameEncoding, data: &[u8]) -> Result<(), Error> {
    if data.len() > u16::MAX as usize {
        bail!("framed field too long ({} bytes)", data.len());
    }
    w.write_all(&[encoding as u8])?;
    w.write_all(&(data.len() as u16).to_be_bytes())?;
    w.write_all(data)?;
    Ok(())
}

pub fn read_framed<R: Read>(r: &mut R) -> Result<(NameEncoding, Vec<u8>), Error> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    let encoding = match tag[0] {
        0 => NameEncoding::Clear,
        1 => NameEncoding::Encrypted,
        other => bail!("unknown name encoding tag {}", other),
    };
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok((encoding, data))
}

/// Attributes blob: a plain `u32`-length-prefixed byte string.
pub fn write_attributes<W: Write>(w: &mut W, attrs: &[u8]) -> Result<(), Error> {
    w.write_all(&(attrs.len() as u32).to_be_bytes())?;
    w.write_all(attrs)?;
    Ok(())
}

pub fn read_attributes<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(data)
}

pub fn u64_from_be(buf: &[u8]) -> Result<u64, Error> {
    Ok(u64::from_be_bytes(buf.try_into().context("short u64")?))
}
