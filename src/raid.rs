//! Striped on-disc object store: one or three directories per disc set,
//! atomic write-then-rename commit, and degraded-mode reconstruction when a
//! stripe is missing or unreadable.
//!
//! A disc set with one directory stores objects as plain files. A disc set
//! with three stores each object as three parallel files -- stripe1,
//! stripe2, and a parity block that is the XOR of the two -- rotated across
//! the three directories so no single directory always carries the same
//! role.

use std::convert::TryInto;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use log::warn;

use crate::io::MemoryStream;

/// Ordered set of 1 or 3 storage directories plus the block size used when
/// striping an object into stripe1/stripe2/parity.
#[derive(Debug, Clone)]
pub struct DiscSet {
    discs: Vec<PathBuf>,
    block_size: u64,
}

impl DiscSet {
    pub fn single(dir: PathBuf, block_size: u64) -> Self {
        Self {
            discs: vec![dir],
            block_size,
        }
    }

    pub fn triple(disc0: PathBuf, disc1: PathBuf, disc2: PathBuf, block_size: u64) -> Self {
        Self {
            discs: vec![disc0, disc1, disc2],
            block_size,
        }
    }

    pub fn is_raided(&self) -> bool {
        self.discs.len() == 3
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn discs(&self) -> &[PathBuf] {
        &self.discs
    }

    fn start_disc(&self, name: &str) -> usize {
        if self.discs.len() <= 1 {
            0
        } else {
            (fnv1a(name.as_bytes()) % self.discs.len() as u64) as usize
        }
    }

    /// The disc holding stripe role `role` (0 = stripe1, 1 = stripe2, 2 =
    /// parity) for object `name`, rotated by the name's hash so no one
    /// directory always plays the same role.
    fn stripe_disc(&self, name: &str, role: usize) -> &Path {
        let start = self.start_disc(name);
        &self.discs[(start + role) % self.discs.len()]
    }
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

const NONRAID_SUFFIX: &str = "rfw";
const RAID_SUFFIX: &str = "rf";
const PARITY_TEMP_SUFFIX: &str = "rfP";
const QUARANTINE_DIR: &str = "quarantine";

fn nonraid_path(disc: &Path, name: &str) -> PathBuf {
    disc.join(format!("{}.{}", name, NONRAID_SUFFIX))
}

fn committed_path(disc: &Path, name: &str) -> PathBuf {
    disc.join(format!("{}.{}", name, RAID_SUFFIX))
}

fn random_suffix() -> u64 {
    let mut buf = [0u8; 8];
    openssl::rand::rand_bytes(&mut buf).expect("system RNG unavailable");
    u64::from_le_bytes(buf)
}

/// Sequential writer for a new object. Writes land in a uniquely-suffixed
/// temporary file; nothing under the object's real name exists until
/// [`RaidFileWriter::commit`] renames it into place.
pub struct RaidFileWriter {
    disc_set: DiscSet,
    name: String,
    temp_path: PathBuf,
    file: File,
}

impl RaidFileWriter {
    pub fn create(disc_set: &DiscSet, name: &str) -> Result<Self, Error> {
        let write_disc = disc_set.stripe_disc(name, 0);
        let temp_path = write_disc.join(format!("{}.{}{:016x}", name, NONRAID_SUFFIX, random_suffix()));
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating parent directories for {}", temp_path.display()))?;
        }
        let file = File::create(&temp_path)
            .with_context(|| format!("creating temporary file {}", temp_path.display()))?;
        Ok(Self {
            disc_set: disc_set.clone(),
            name: name.to_string(),
            temp_path,
            file,
        })
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Commit the write. With `convert_to_raid = false` the object becomes
    /// readable as a plain (non-redundant) `.rfw` file; with `true` on a
    /// three-disc set it is immediately split into stripe1/stripe2/parity
    /// and the intermediate `.rfw` is removed.
    pub fn commit(mut self, convert_to_raid: bool) -> Result<(), Error> {
        self.file.sync_all()?;
        drop(self.file);

        let write_disc = self.disc_set.stripe_disc(&self.name, 0).to_path_buf();
        let final_path = nonraid_path(&write_disc, &self.name);
        fs::rename(&self.temp_path, &final_path).with_context(|| {
            format!("committing {} -> {}", self.temp_path.display(), final_path.display())
        })?;

        if convert_to_raid && self.disc_set.is_raided() {
            let data = fs::read(&final_path)
                .with_context(|| format!("reading {} back for raid conversion", final_path.display()))?;
            convert_to_raid_storage(&self.disc_set, &self.name, &data)?;
            fs::remove_file(&final_path)?;
        }
        Ok(())
    }

    /// Abandon the write, removing the temporary file. Used when an
    /// in-progress upload fails before a commit decision is made.
    pub fn abandon(self) -> Result<(), Error> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path);
        Ok(())
    }
}

/// Per-slot block lengths for a file of `total_size` bytes chunked at
/// `block_size`: every block is `block_size` long except a possible
/// shorter final one.
fn block_lengths(total_size: u64, block_size: u64) -> Vec<u64> {
    if total_size == 0 || block_size == 0 {
        return Vec::new();
    }
    let num_blocks = (total_size + block_size - 1) / block_size;
    let mut out = Vec::with_capacity(num_blocks as usize);
    for i in 0..num_blocks {
        let remaining = total_size - i * block_size;
        out.push(remaining.min(block_size));
    }
    out
}

fn write_stripe_atomic(disc: &Path, name: &str, suffix: &str, data: &[u8]) -> Result<(), Error> {
    let temp_path = disc.join(format!("{}.{}{:016x}", name, suffix, random_suffix()));
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&temp_path, data)
        .with_context(|| format!("writing stripe to {}", temp_path.display()))?;
    let final_path = committed_path(disc, name);
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&temp_path, &final_path)
        .with_context(|| format!("renaming stripe into place at {}", final_path.display()))?;
    Ok(())
}

/// Split `data` (the whole object's committed bytes) into stripe1, stripe2,
/// and parity, and write all three into place. Even-indexed blocks go to
/// stripe1, odd-indexed to stripe2; parity is the XOR of each pair.
///
/// Every parity slot but the last is a full `block_size` block, so its
/// length carries no size information. The last slot is truncated to
/// `max(stripe1_slot_len, stripe2_slot_len)`, which recovers the true file
/// length from the stripes alone *unless* the trailing partial block
/// belongs to stripe2 (an even block count) -- in that case stripe1's
/// final block is always full, so the parity slot is always full too and
/// the true length is lost. An 8-byte big-endian length trailer is
/// appended to parity to cover that case.
fn convert_to_raid_storage(disc_set: &DiscSet, name: &str, data: &[u8]) -> Result<(), Error> {
    let total_size = data.len() as u64;
    let block_size = disc_set.block_size();
    let lens = block_lengths(total_size, block_size);

    let mut stripe1 = Vec::new();
    let mut stripe2 = Vec::new();
    let mut offset = 0usize;
    for (i, &len) in lens.iter().enumerate() {
        let block = &data[offset..offset + len as usize];
        if i % 2 == 0 {
            stripe1.extend_from_slice(block);
        } else {
            stripe2.extend_from_slice(block);
        }
        offset += len as usize;
    }

    let stripe1_slots = (lens.len() + 1) / 2;
    let mut parity = Vec::new();
    let mut s1_off = 0usize;
    let mut s2_off = 0usize;
    for slot in 0..stripe1_slots {
        let s1_len = lens.get(slot * 2).copied().unwrap_or(0) as usize;
        let s2_len = lens.get(slot * 2 + 1).copied().unwrap_or(0) as usize;
        let slot_len = s1_len.max(s2_len);

        let mut block = vec![0u8; slot_len];
        block[..s1_len].copy_from_slice(&stripe1[s1_off..s1_off + s1_len]);
        for (b, &s) in block.iter_mut().zip(stripe2[s2_off..s2_off + s2_len].iter()) {
            *b ^= s;
        }
        parity.extend_from_slice(&block);

        s1_off += s1_len;
        s2_off += s2_len;
    }

    let num_blocks = lens.len();
    let needs_trailer = num_blocks > 0 && num_blocks % 2 == 0;
    if needs_trailer {
        parity.extend_from_slice(&total_size.to_be_bytes());
    }

    write_stripe_atomic(disc_set.stripe_disc(name, 0), name, PARITY_TEMP_SUFFIX, &stripe1)?;
    write_stripe_atomic(disc_set.stripe_disc(name, 1), name, PARITY_TEMP_SUFFIX, &stripe2)?;
    write_stripe_atomic(disc_set.stripe_disc(name, 2), name, PARITY_TEMP_SUFFIX, &parity)?;
    Ok(())
}

/// Outcome of [`open`]: whether the object was read cleanly or needed
/// stripe reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    NonRaided,
    Raided,
    Degraded,
}

/// Open an object for reading, returning its full decoded bytes as a
/// seekable in-memory stream. Tries the plain non-raid form first, then
/// falls back to the three-stripe form, reconstructing from parity if any
/// one stripe is missing or unreadable.
pub fn open(disc_set: &DiscSet, name: &str) -> Result<(MemoryStream, ReadMode), Error> {
    let write_disc = disc_set.stripe_disc(name, 0);
    let nonraid = nonraid_path(write_disc, name);
    if nonraid.exists() {
        let data = fs::read(&nonraid).with_context(|| format!("reading {}", nonraid.display()))?;
        return Ok((MemoryStream::with_data(data), ReadMode::NonRaided));
    }

    if !disc_set.is_raided() {
        bail!("object {} does not exist", name);
    }

    let s1_path = committed_path(disc_set.stripe_disc(name, 0), name);
    let s2_path = committed_path(disc_set.stripe_disc(name, 1), name);
    let p_path = committed_path(disc_set.stripe_disc(name, 2), name);

    let s1 = read_stripe(&s1_path);
    let s2 = read_stripe(&s2_path);
    let parity = read_stripe(&p_path);

    match (s1, s2, parity) {
        (Ok(s1), Ok(s2), Ok(_parity)) => {
            let mut data = Vec::with_capacity(s1.len() + s2.len());
            interleave(&s1, &s2, disc_set.block_size(), &mut data);
            Ok((MemoryStream::with_data(data), ReadMode::Raided))
        }
        (Err(_), Ok(s2), Ok(parity)) => {
            quarantine(&s1_path);
            let s1 = reconstruct_missing_stripe(&s2, &parity, disc_set.block_size(), true)?;
            let mut data = Vec::with_capacity(s1.len() + s2.len());
            interleave(&s1, &s2, disc_set.block_size(), &mut data);
            Ok((MemoryStream::with_data(data), ReadMode::Degraded))
        }
        (Ok(s1), Err(_), Ok(parity)) => {
            quarantine(&s2_path);
            let s2 = reconstruct_missing_stripe(&s1, &parity, disc_set.block_size(), false)?;
            let mut data = Vec::with_capacity(s1.len() + s2.len());
            interleave(&s1, &s2, disc_set.block_size(), &mut data);
            Ok((MemoryStream::with_data(data), ReadMode::Degraded))
        }
        (Ok(s1), Ok(s2), Err(_)) => {
            // Both data stripes survived; parity was only ever needed to
            // rebuild one of them, so its loss doesn't affect this read.
            quarantine(&p_path);
            let mut data = Vec::with_capacity(s1.len() + s2.len());
            interleave(&s1, &s2, disc_set.block_size(), &mut data);
            Ok((MemoryStream::with_data(data), ReadMode::Degraded))
        }
        _ => bail!("object {} has more than one unreadable stripe", name),
    }
}

fn read_stripe(path: &Path) -> Result<Vec<u8>, Error> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

fn quarantine(path: &Path) {
    let disc = path.parent().and_then(|p| p.parent()).unwrap_or_else(|| Path::new("."));
    let quarantine_dir = disc.join(QUARANTINE_DIR);
    if let Err(e) = fs::create_dir_all(&quarantine_dir) {
        warn!("could not create quarantine directory {}: {}", quarantine_dir.display(), e);
        return;
    }
    let dest = quarantine_dir.join(path.file_name().unwrap_or_default());
    if let Err(e) = fs::rename(path, &dest) {
        warn!("could not quarantine {}: {}", path.display(), e);
    } else {
        warn!("quarantined unreadable stripe {} -> {}", path.display(), dest.display());
    }
}

/// Rebuild the missing stripe's bytes from the surviving stripe and
/// parity. `missing_is_stripe1` selects which slot parity corresponds to
/// on the missing side.
fn reconstruct_missing_stripe(
    surviving: &[u8],
    parity: &[u8],
    block_size: u64,
    missing_is_stripe1: bool,
) -> Result<Vec<u8>, Error> {
    let (parity_content, total_size) = split_trailer(parity, surviving.len() as u64, block_size, missing_is_stripe1)?;

    let lens = block_lengths(total_size, block_size);
    let mut missing = Vec::new();
    let mut surv_off = 0usize;
    let mut par_off = 0usize;

    let slots = (lens.len() + 1) / 2;
    for slot in 0..slots {
        let (missing_idx, surv_idx) = if missing_is_stripe1 {
            (slot * 2, slot * 2 + 1)
        } else {
            (slot * 2 + 1, slot * 2)
        };
        let missing_len = lens.get(missing_idx).copied().unwrap_or(0) as usize;
        let surv_len = lens.get(surv_idx).copied().unwrap_or(0) as usize;
        let slot_len = missing_len.max(surv_len);

        if missing_len == 0 {
            surv_off += surv_len;
            par_off += slot_len;
            continue;
        }

        let mut block = vec![0u8; missing_len];
        if par_off + slot_len > parity_content.len() {
            bail!("parity data too short to reconstruct missing stripe");
        }
        block.copy_from_slice(&parity_content[par_off..par_off + missing_len]);
        for (b, &s) in block.iter_mut().zip(surviving[surv_off..surv_off + surv_len.min(missing_len)].iter()) {
            *b ^= s;
        }
        missing.extend_from_slice(&block);

        surv_off += surv_len;
        par_off += slot_len;
    }

    Ok(missing)
}

/// Split `parity` into its real content and the recovered total file size.
/// If the ambiguous case applies (the final block belongs to the stripe
/// opposite `missing_is_stripe1`'s surviving side at an even block count)
/// the trailing 8 bytes are the size; otherwise the size is derived from
/// stripe-length parity (surviving stripe length plus the reconstructed
/// missing stripe's length, which equals parity's own content length when
/// no trailer is present).
fn split_trailer(
    parity: &[u8],
    surviving_len: u64,
    block_size: u64,
    missing_is_stripe1: bool,
) -> Result<(Vec<u8>, u64), Error> {
    // Try the no-trailer hypothesis first: total = surviving_len + parity.len().
    let candidate_total = surviving_len + parity.len() as u64;
    let candidate_lens = block_lengths(candidate_total, block_size);
    let candidate_even = !candidate_lens.is_empty() && candidate_lens.len() % 2 == 0;

    if !candidate_even {
        return Ok((parity.to_vec(), candidate_total));
    }

    // Even block count: the final block belongs to stripe2. If stripe1 is
    // the survivor, stripe1's length alone can't tell us whether stripe2's
    // last block was partial, so trust the trailer.
    if missing_is_stripe1 {
        // stripe2 survives; its own length already reveals whether its
        // final block was partial, so stripe-length parity still works.
        return Ok((parity.to_vec(), candidate_total));
    }

    if parity.len() < 8 {
        bail!("parity data too short to contain a length trailer");
    }
    let split = parity.len() - 8;
    let total_size = u64::from_be_bytes(parity[split..].try_into().unwrap());
    Ok((parity[..split].to_vec(), total_size))
}

/// Interleave stripe1/stripe2 bytes back into file order, given their
/// block-length structure implied by `block_size` and each stripe's own
/// (already-known) length.
fn interleave(stripe1: &[u8], stripe2: &[u8], block_size: u64, out: &mut Vec<u8>) {
    let mut s1_off = 0usize;
    let mut s2_off = 0usize;
    loop {
        if s1_off >= stripe1.len() && s2_off >= stripe2.len() {
            break;
        }
        if s1_off < stripe1.len() {
            let len = (block_size as usize).min(stripe1.len() - s1_off);
            out.extend_from_slice(&stripe1[s1_off..s1_off + len]);
            s1_off += len;
        }
        if s2_off < stripe2.len() {
            let len = (block_size as usize).min(stripe2.len() - s2_off);
            out.extend_from_slice(&stripe2[s2_off..s2_off + len]);
            s2_off += len;
        }
    }
}

/// Sweep every disc in `disc_set` for leftover write/conversion
/// temporaries (`.rfw<hex>`, `.rfP<hex>`) from a process that crashed
/// mid-commit, and remove them. Committed objects (`.rfw`, `.rf`) are left
/// untouched.
pub fn recover_temporaries(disc_set: &DiscSet) -> Result<u64, Error> {
    let mut removed = 0u64;
    for disc in disc_set.discs() {
        if !disc.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(disc).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if is_stray_temporary(&file_name) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("failed to remove stray temporary {}: {}", entry.path().display(), e);
                } else {
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

fn is_stray_temporary(file_name: &str) -> bool {
    for suffix in [NONRAID_SUFFIX, PARITY_TEMP_SUFFIX] {
        if let Some(idx) = file_name.rfind(&format!(".{}", suffix)) {
            let tail = &file_name[idx + suffix.len() + 1..];
            if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_hexdigit()) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_object(disc_set: &DiscSet, name: &str, data: &[u8], convert: bool) {
        let mut w = RaidFileWriter::create(disc_set, name).unwrap();
        w.write_all(data).unwrap();
        w.commit(convert).unwrap();
    }

    #[test]
    fn single_disc_round_trip() {
        let dir = tempdir().unwrap();
        let disc_set = DiscSet::single(dir.path().to_path_buf(), 4096);
        let data = vec![7u8; 10_000];
        write_object(&disc_set, "0001/0002", &data, false);
        let (mut stream, mode) = open(&disc_set, "0001/0002").unwrap();
        assert_eq!(mode, ReadMode::NonRaided);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn three_disc_round_trip_odd_block_count() {
        let d0 = tempdir().unwrap();
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let disc_set = DiscSet::triple(
            d0.path().to_path_buf(),
            d1.path().to_path_buf(),
            d2.path().to_path_buf(),
            1024,
        );
        let data: Vec<u8> = (0..10_500u32).map(|i| (i % 251) as u8).collect();
        write_object(&disc_set, "f1", &data, true);

        let (mut stream, mode) = open(&disc_set, "f1").unwrap();
        assert_eq!(mode, ReadMode::Raided);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn three_disc_round_trip_even_block_count() {
        let d0 = tempdir().unwrap();
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let disc_set = DiscSet::triple(
            d0.path().to_path_buf(),
            d1.path().to_path_buf(),
            d2.path().to_path_buf(),
            1024,
        );
        let data: Vec<u8> = (0..11_000u32).map(|i| (i % 251) as u8).collect();
        write_object(&disc_set, "f2", &data, true);

        let (mut stream, _mode) = open(&disc_set, "f2").unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    fn stripe_disc_path(disc_set: &DiscSet, name: &str, role: usize) -> PathBuf {
        committed_path(disc_set.stripe_disc(name, role), name)
    }

    #[test]
    fn degraded_read_after_losing_stripe1() {
        let d0 = tempdir().unwrap();
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let disc_set = DiscSet::triple(
            d0.path().to_path_buf(),
            d1.path().to_path_buf(),
            d2.path().to_path_buf(),
            512,
        );
        let data: Vec<u8> = (0..5_000u32).map(|i| (i % 200) as u8).collect();
        write_object(&disc_set, "deg1", &data, true);

        let s1 = stripe_disc_path(&disc_set, "deg1", 0);
        fs::remove_file(&s1).unwrap();

        let (mut stream, mode) = open(&disc_set, "deg1").unwrap();
        assert_eq!(mode, ReadMode::Degraded);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn degraded_read_after_losing_stripe2() {
        let d0 = tempdir().unwrap();
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let disc_set = DiscSet::triple(
            d0.path().to_path_buf(),
            d1.path().to_path_buf(),
            d2.path().to_path_buf(),
            512,
        );
        let data: Vec<u8> = (0..5_001u32).map(|i| (i % 200) as u8).collect();
        write_object(&disc_set, "deg2", &data, true);

        let s2 = stripe_disc_path(&disc_set, "deg2", 1);
        fs::remove_file(&s2).unwrap();

        let (mut stream, mode) = open(&disc_set, "deg2").unwrap();
        assert_eq!(mode, ReadMode::Degraded);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn degraded_read_after_losing_parity_only() {
        let d0 = tempdir().unwrap();
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let disc_set = DiscSet::triple(
            d0.path().to_path_buf(),
            d1.path().to_path_buf(),
            d2.path().to_path_buf(),
            512,
        );
        let data: Vec<u8> = (0..5_002u32).map(|i| (i % 200) as u8).collect();
        write_object(&disc_set, "degp", &data, true);

        let parity = stripe_disc_path(&disc_set, "degp", 2);
        fs::remove_file(&parity).unwrap();

        let (mut stream, mode) = open(&disc_set, "degp").unwrap();
        assert_eq!(mode, ReadMode::Degraded);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn recover_temporaries_removes_stray_writes_only() {
        let dir = tempdir().unwrap();
        let disc_set = DiscSet::single(dir.path().to_path_buf(), 4096);
        write_object(&disc_set, "keep", b"committed content", false);

        let stray = dir.path().join("orphan.rfw00000000000001ab");
        fs::write(&stray, b"leftover").unwrap();

        let removed = recover_temporaries(&disc_set).unwrap();
        assert_eq!(removed, 1);
        assert!(!stray.exists());
        assert!(nonraid_path(dir.path(), "keep").exists());
    }
}
