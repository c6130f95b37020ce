//! Patch arithmetic over decoded streams: folding a patch into the file it
//! targets, building the reverse patch needed to go back, and composing two
//! patches that target the same original file into one.
//!
//! None of these need key material beyond what's already in a
//! [`DecodedStream`]: they operate on reassembled plaintext and the index
//! metadata, then re-encode with [`crate::codec::encode`].

use anyhow::{bail, Error};

use crate::cipher::Keystore;
use crate::codec::block_size::{choose_block_schedule, ChunkSizeConfig};
use crate::codec::decode::{decode_body, DecodedStream};
use crate::codec::encode::{encode_diff, encode_whole_file, index_of_whole_file, EncodeParams, FileKind};
use crate::codec::index::FileIndex;
use crate::io::KeepAlive;

/// Apply `patch` (a stream diffed against `base`) to reconstruct the full
/// plaintext it describes. `base_index` must be `base_plaintext`'s own
/// block index, not the patch's -- a referenced block's offset is only
/// correct computed against the base file's own layout.
pub fn combine(
    keystore: &Keystore,
    patch: &DecodedStream,
    base_plaintext: &[u8],
    base_index: &FileIndex,
) -> Result<Vec<u8>, Error> {
    if !patch.index.is_patch() {
        bail!("combine called on a stream that is not a patch");
    }
    decode_body(keystore, patch, Some((base_plaintext, base_index)))
}

/// Build the patch that would turn `new_full` back into `old_full`,
/// suitable for storing in place of keeping a full copy of the older
/// version once a newer patch has superseded it in the chain.
pub fn reverse(
    keystore: &Keystore,
    old_full: &[u8],
    new_full: &[u8],
    old_container_id: u64,
    new_object_id: u64,
    filename: &[u8],
    attributes: &[u8],
    keep_alive: &mut dyn KeepAlive,
) -> Result<Vec<u8>, Error> {
    let schedule = choose_block_schedule(new_full.len() as u64, &ChunkSizeConfig::default());
    let new_index = index_of_whole_file(new_full, &schedule)?;

    let params = EncodeParams {
        keystore,
        container_id: old_container_id,
        modification_time_us: 0,
        filename,
        attributes,
        compress: true,
        block_config: ChunkSizeConfig::default(),
    };

    let mut out = Vec::new();
    encode_diff(old_full, new_object_id, &new_index, &params, &mut out, keep_alive)?;
    Ok(out)
}

/// Compose two patches that both ultimately resolve against the same
/// chain (`p1` patches `original_plaintext` into `intermediate`, `p2`
/// patches `intermediate` into `final`) into a single patch from
/// `original_plaintext` straight to `final`.
///
/// This only has a use once housekeeping wants to drop `intermediate`
/// from the chain: `p2` alone references blocks of `intermediate`, which
/// won't exist once it's deleted, so its data needs folding forward onto
/// `original_plaintext` directly. The caller supplies `original_plaintext`
/// itself (already on hand from storing or previously decoding it) rather
/// than having it rederived from `p1`. `original_index` must be
/// `original_plaintext`'s own block index -- `p1`'s referenced blocks are
/// offsets into that file's layout, not into `p1`'s own entries.
pub fn combine_patches(
    keystore: &Keystore,
    p1: &DecodedStream,
    original_plaintext: &[u8],
    original_index: &FileIndex,
    p2: &DecodedStream,
    container_id: u64,
    original_object_id: u64,
    filename: &[u8],
    attributes: &[u8],
    keep_alive: &mut dyn KeepAlive,
) -> Result<Vec<u8>, Error> {
    if !p1.index.is_patch() || !p2.index.is_patch() {
        bail!("combine_patches requires two patch streams");
    }

    let intermediate_plaintext = decode_body(keystore, p1, Some((original_plaintext, original_index)))?;
    let final_plaintext = decode_body(keystore, p2, Some((&intermediate_plaintext, &p1.index)))?;

    let params = EncodeParams {
        keystore,
        container_id,
        modification_time_us: 0,
        filename,
        attributes,
        compress: true,
        block_config: ChunkSizeConfig::default(),
    };

    let mut out = Vec::new();
    encode_diff(
        &final_plaintext,
        original_object_id,
        original_index,
        &params,
        &mut out,
        keep_alive,
    )?;
    Ok(out)
}

/// Whole-file re-encode convenience used by housekeeping when a chain gets
/// collapsed down to a single full copy instead of staying a patch (e.g.
/// once a patch's base is about to be deleted and keeping the chain isn't
/// worth it for how little it still saves).
pub fn collapse_to_whole_file(
    keystore: &Keystore,
    plaintext: &[u8],
    container_id: u64,
    modification_time_us: u64,
    filename: &[u8],
    attributes: &[u8],
) -> Result<Vec<u8>, Error> {
    let params = EncodeParams {
        keystore,
        container_id,
        modification_time_us,
        filename,
        attributes,
        compress: true,
        block_config: ChunkSizeConfig::default(),
    };
    let mut out = Vec::new();
    encode_whole_file(plaintext, plaintext.len() as u64, FileKind::Regular, &params, &mut out)?;
    Ok(out)
}
