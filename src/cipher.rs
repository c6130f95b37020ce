//! Per-chunk authenticated encryption, optional compression, and the
//! deterministic-IV scheme used for block-index entries.
//!
//! An `openssl::symm::Crypter` wraps each direction, IVs are drawn from the
//! OS RNG via `openssl::rand`, and a small tagged header precedes the
//! ciphertext so a reader knows which cipher and whether compression was
//! applied without out-of-band state.
//!
//! Cipher keys are not process-global here; every entry point takes an
//! explicit [`Keystore`].

use std::convert::TryInto;
use std::io::Write;

use anyhow::{anyhow, bail, Context, Error};
use openssl::symm::{Cipher, Crypter, Mode};

/// Two supported chunk ciphers: a 64-bit block cipher (Blowfish, CBC) kept
/// for compatibility with smaller/older deployments, and a 128-bit block
/// cipher (AES-128, CBC) which is preferred whenever both ends support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherTag {
    Blowfish64Cbc = 0,
    Aes128Cbc = 1,
}

impl CipherTag {
    pub fn preferred() -> Self {
        CipherTag::Aes128Cbc
    }

    /// The concrete `openssl` cipher this tag selects.
    pub fn openssl_cipher(self) -> Cipher {
        match self {
            CipherTag::Blowfish64Cbc => Cipher::bf_cbc(),
            CipherTag::Aes128Cbc => Cipher::aes_128_cbc(),
        }
    }

    fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits {
            0 => Ok(CipherTag::Blowfish64Cbc),
            1 => Ok(CipherTag::Aes128Cbc),
            other => bail!("unknown chunk cipher tag {}", other),
        }
    }
}

const CHUNK_HEADER_COMPRESSED_BIT: u8 = 0x01;
/// Chunks shorter than this are never compressed: the zstd frame overhead
/// would make them larger, not smaller.
pub const MIN_COMPRESS_SIZE: usize = 100;

/// Keys loaded once at process start from an already-provisioned key file
/// (provisioning itself is out of scope). Held behind `&Keystore` rather
/// than process-global state so the codec is a pure function of its
/// arguments.
#[derive(Clone)]
pub struct Keystore {
    /// Key used to encrypt chunk bodies.
    data_key: Vec<u8>,
    /// A separate key used only for block-index entries.
    index_key: Vec<u8>,
    cipher: CipherTag,
}

impl Keystore {
    pub fn new(data_key: Vec<u8>, index_key: Vec<u8>, cipher: CipherTag) -> Result<Self, Error> {
        let key_len = cipher.openssl_cipher().key_len();
        if data_key.len() != key_len || index_key.len() != key_len {
            bail!(
                "key length mismatch: cipher needs {} bytes, got data={} index={}",
                key_len,
                data_key.len(),
                index_key.len()
            );
        }
        Ok(Self {
            data_key,
            index_key,
            cipher,
        })
    }

    /// Load a key set from a flat binary file: `data_key || index_key`,
    /// each `cipher.key_len()` bytes. The file itself is provisioned by an
    /// out-of-scope collaborator; this only parses its contents.
    pub fn load(path: &std::path::Path, cipher: CipherTag) -> Result<Self, Error> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading keystore file {}", path.display()))?;
        let key_len = cipher.openssl_cipher().key_len();
        if raw.len() != 2 * key_len {
            bail!(
                "keystore file {} has wrong length (expected {}, got {})",
                path.display(),
                2 * key_len,
                raw.len()
            );
        }
        Self::new(raw[..key_len].to_vec(), raw[key_len..].to_vec(), cipher)
    }

    pub fn cipher(&self) -> CipherTag {
        self.cipher
    }
}

/// Encode one plaintext chunk into `[header][iv][ciphertext]`, optionally
/// compressing first when `compress` is set and the chunk is large enough
/// to benefit.
pub fn encode_chunk(keystore: &Keystore, plaintext: &[u8], compress: bool) -> Result<Vec<u8>, Error> {
    let do_compress = compress && plaintext.len() >= MIN_COMPRESS_SIZE;

    let body = if do_compress {
        zstd::stream::encode_all(plaintext, 1)?
    } else {
        plaintext.to_vec()
    };

    let cipher = keystore.cipher.openssl_cipher();
    let mut iv = vec![0u8; cipher.iv_len().unwrap_or(0)];
    openssl::rand::rand_bytes(&mut iv)?;

    let ciphertext = encrypt(cipher, &keystore.data_key, &iv, &body)?;

    let header = (keystore.cipher as u8) << 1 | if do_compress { CHUNK_HEADER_COMPRESSED_BIT } else { 0 };

    let mut out = Vec::with_capacity(1 + iv.len() + ciphertext.len());
    out.push(header);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decode a chunk produced by [`encode_chunk`] back into plaintext.
pub fn decode_chunk(keystore: &Keystore, encoded: &[u8]) -> Result<Vec<u8>, Error> {
    if encoded.is_empty() {
        bail!("empty chunk");
    }
    let header = encoded[0];
    let compressed = header & CHUNK_HEADER_COMPRESSED_BIT != 0;
    let tag = CipherTag::from_bits(header >> 1)?;
    if tag != keystore.cipher {
        bail!("chunk was encoded with a different cipher than the active keystore");
    }

    let cipher = tag.openssl_cipher();
    let iv_len = cipher.iv_len().unwrap_or(0);
    if encoded.len() < 1 + iv_len {
        bail!("chunk too short to contain an IV");
    }
    let iv = &encoded[1..1 + iv_len];
    let ciphertext = &encoded[1 + iv_len..];

    let body = decrypt(cipher, &keystore.data_key, iv, ciphertext)?;

    if compressed {
        Ok(zstd::stream::decode_all(&body[..])?)
    } else {
        Ok(body)
    }
}

/// Deterministic IV for block-index entry number `absolute_block_number`:
/// `iv_base + absolute_block_number` in network byte order, unpadded. This
/// lets any single entry be decrypted independently while still binding it
/// to its position in the index, so a reordered entry fails to decrypt
/// correctly instead of silently describing the wrong block.
pub fn index_entry_iv(iv_base: u64, absolute_block_number: u64, iv_len: usize) -> Vec<u8> {
    let value = iv_base.wrapping_add(absolute_block_number);
    let full = value.to_be_bytes();
    let mut iv = vec![0u8; iv_len];
    let n = iv_len.min(full.len());
    iv[iv_len - n..].copy_from_slice(&full[full.len() - n..]);
    iv
}

/// Encrypt a block-index entry's plaintext `(clear_size, weak, strong)`
/// tuple using the keystore's separate index key and the deterministic IV.
pub fn encrypt_index_entry(
    keystore: &Keystore,
    iv_base: u64,
    absolute_block_number: u64,
    clear_size: u32,
    weak: u32,
    strong: &[u8; 16],
) -> Result<Vec<u8>, Error> {
    let cipher = keystore.cipher.openssl_cipher();
    let iv = index_entry_iv(iv_base, absolute_block_number, cipher.iv_len().unwrap_or(0));

    let mut plain = Vec::with_capacity(4 + 4 + 16);
    plain.extend_from_slice(&clear_size.to_be_bytes());
    plain.extend_from_slice(&weak.to_be_bytes());
    plain.extend_from_slice(strong);

    encrypt(cipher, &keystore.index_key, &iv, &plain)
}

/// Inverse of [`encrypt_index_entry`].
pub fn decrypt_index_entry(
    keystore: &Keystore,
    iv_base: u64,
    absolute_block_number: u64,
    encrypted: &[u8],
) -> Result<(u32, u32, [u8; 16]), Error> {
    let cipher = keystore.cipher.openssl_cipher();
    let iv = index_entry_iv(iv_base, absolute_block_number, cipher.iv_len().unwrap_or(0));

    let plain = decrypt(cipher, &keystore.index_key, &iv, encrypted)?;
    if plain.len() < 24 {
        bail!("decrypted block-index entry is too short");
    }
    let clear_size = u32::from_be_bytes(plain[0..4].try_into().unwrap());
    let weak = u32::from_be_bytes(plain[4..8].try_into().unwrap());
    let mut strong = [0u8; 16];
    strong.copy_from_slice(&plain[8..24]);
    Ok((clear_size, weak, strong))
}

fn encrypt(cipher: Cipher, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, Some(iv))?;
    let block_size = cipher.block_size();
    let mut out = vec![0u8; plaintext.len() + block_size];
    let mut count = crypter.update(plaintext, &mut out)?;
    count += crypter.finalize(&mut out[count..])?;
    out.truncate(count);
    Ok(out)
}

fn decrypt(cipher: Cipher, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))?;
    let block_size = cipher.block_size();
    let mut out = vec![0u8; ciphertext.len() + block_size];
    let mut count = crypter.update(ciphertext, &mut out)?;
    count += crypter
        .finalize(&mut out[count..])
        .map_err(|e| anyhow!("chunk authentication/decryption failed: {}", e))?;
    out.truncate(count);
    Ok(out)
}

/// Streaming compressor used ahead of encryption for chunks large enough to
/// benefit. Exposed separately from [`encode_chunk`] for callers (like the
/// file codec's whole-file path) that want to stream plaintext through
/// compression without buffering it first.
pub fn compress_stream<W: Write>(dest: W) -> Result<zstd::stream::write::Encoder<W>, Error> {
    Ok(zstd::stream::write::Encoder::new(dest, 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keystore(tag: CipherTag) -> Keystore {
        let key_len = tag.openssl_cipher().key_len();
        Keystore::new(vec![7u8; key_len], vec![9u8; key_len], tag).unwrap()
    }

    #[test]
    fn chunk_round_trips_uncompressed() {
        let ks = test_keystore(CipherTag::Aes128Cbc);
        let plaintext = b"a small chunk of plaintext data";
        let encoded = encode_chunk(&ks, plaintext, false).unwrap();
        let decoded = decode_chunk(&ks, &encoded).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn chunk_round_trips_compressed() {
        let ks = test_keystore(CipherTag::Aes128Cbc);
        let plaintext = vec![b'x'; 4096];
        let encoded = encode_chunk(&ks, &plaintext, true).unwrap();
        let decoded = decode_chunk(&ks, &encoded).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn short_chunks_are_not_compressed() {
        let ks = test_keystore(CipherTag::Aes128Cbc);
        let plaintext = b"tiny";
        let encoded = encode_chunk(&ks, plaintext, true).unwrap();
        assert_eq!(encoded[0] & CHUNK_HEADER_COMPRESSED_BIT, 0);
    }

    #[test]
    fn blowfish_tag_round_trips() {
        let ks = test_keystore(CipherTag::Blowfish64Cbc);
        let plaintext = b"legacy cipher path";
        let encoded = encode_chunk(&ks, plaintext, false).unwrap();
        assert_eq!(encoded[0] >> 1, CipherTag::Blowfish64Cbc as u8);
        let decoded = decode_chunk(&ks, &encoded).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn index_entries_are_independently_decryptable() {
        let ks = test_keystore(CipherTag::Aes128Cbc);
        let strong = [3u8; 16];
        let entries: Vec<_> = (0..5)
            .map(|i| encrypt_index_entry(&ks, 1000, i, 4096, 0xdead, &strong).unwrap())
            .collect();

        // decrypt out of order; each is self-contained
        for i in (0..5).rev() {
            let (size, weak, got_strong) =
                decrypt_index_entry(&ks, 1000, i, &entries[i as usize]).unwrap();
            assert_eq!(size, 4096);
            assert_eq!(weak, 0xdead);
            assert_eq!(got_strong, strong);
        }
    }

    #[test]
    fn index_entry_bound_to_position() {
        let ks = test_keystore(CipherTag::Aes128Cbc);
        let strong = [3u8; 16];
        let entry = encrypt_index_entry(&ks, 1000, 0, 4096, 1, &strong).unwrap();
        // decrypting as if it were a different position must fail or yield garbage
        let result = decrypt_index_entry(&ks, 1000, 1, &entry);
        assert!(result.is_err());
    }
}
