//! On-disc directory object: an ordered table of entries plus a shared
//! attribute blob, serialized as a single small binary blob that goes
//! through the striped storage layer like any other object.

use std::io::{Read, Write};

use anyhow::{bail, Context, Error};

const DIRECTORY_MAGIC_V1: u32 = 0x6469_7231; // "dir1"

bitflags::bitflags! {
    pub struct EntryFlags: u16 {
        const FILE = 0x0001;
        const DIRECTORY = 0x0002;
        const DELETED = 0x0004;
        const OLD_VERSION = 0x0008;
        const REMOVE_ASAP = 0x0010;
    }
}

/// Self-describing entry name: cleartext (server-visible, rare) or
/// encrypted (the normal case).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryName {
    Clear(Vec<u8>),
    Encrypted(Vec<u8>),
}

impl EntryName {
    fn tag(&self) -> u8 {
        match self {
            EntryName::Clear(_) => 0,
            EntryName::Encrypted(_) => 1,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            EntryName::Clear(b) | EntryName::Encrypted(b) => b,
        }
    }
}

/// One entry in a [`StoreDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: EntryName,
    pub object_id: u64,
    pub modification_time_us: u64,
    pub size_blocks: u64,
    pub flags: EntryFlags,
    pub attributes_hash: u64,
    pub attributes: Vec<u8>,
    /// Object ID of the next-older version in a patch chain, or 0.
    pub depends_older: u64,
    /// Object ID of the next-newer version in a patch chain, or 0.
    pub depends_newer: u64,
}

impl DirectoryEntry {
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(EntryFlags::DELETED)
    }

    pub fn name_bytes(&self) -> &[u8] {
        self.name.bytes()
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&[self.name.tag()])?;
        let name_bytes = self.name.bytes();
        if name_bytes.len() > u16::MAX as usize {
            bail!("directory entry name too long ({} bytes)", name_bytes.len());
        }
        w.write_all(&(name_bytes.len() as u16).to_be_bytes())?;
        w.write_all(name_bytes)?;
        w.write_all(&self.object_id.to_be_bytes())?;
        w.write_all(&self.modification_time_us.to_be_bytes())?;
        w.write_all(&self.size_blocks.to_be_bytes())?;
        w.write_all(&self.flags.bits().to_be_bytes())?;
        w.write_all(&self.attributes_hash.to_be_bytes())?;
        if self.attributes.len() > u32::MAX as usize {
            bail!("directory entry attributes too long");
        }
        w.write_all(&(self.attributes.len() as u32).to_be_bytes())?;
        w.write_all(&self.attributes)?;
        w.write_all(&self.depends_older.to_be_bytes())?;
        w.write_all(&self.depends_newer.to_be_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;

        let mut len_buf = [0u8; 2];
        r.read_exact(&mut len_buf)?;
        let name_len = u16::from_be_bytes(len_buf) as usize;
        let mut name_bytes = vec![0u8; name_len];
        r.read_exact(&mut name_bytes)?;
        let name = match tag[0] {
            0 => EntryName::Clear(name_bytes),
            1 => EntryName::Encrypted(name_bytes),
            other => bail!("unknown directory entry name encoding {}", other),
        };

        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8)?;
        let object_id = u64::from_be_bytes(buf8);
        r.read_exact(&mut buf8)?;
        let modification_time_us = u64::from_be_bytes(buf8);
        r.read_exact(&mut buf8)?;
        let size_blocks = u64::from_be_bytes(buf8);

        let mut buf2 = [0u8; 2];
        r.read_exact(&mut buf2)?;
        let flags = EntryFlags::from_bits_truncate(u16::from_be_bytes(buf2));

        r.read_exact(&mut buf8)?;
        let attributes_hash = u64::from_be_bytes(buf8);

        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let attr_len = u32::from_be_bytes(buf4) as usize;
        let mut attributes = vec![0u8; attr_len];
        r.read_exact(&mut attributes)?;

        r.read_exact(&mut buf8)?;
        let depends_older = u64::from_be_bytes(buf8);
        r.read_exact(&mut buf8)?;
        let depends_newer = u64::from_be_bytes(buf8);

        Ok(Self {
            name,
            object_id,
            modification_time_us,
            size_blocks,
            flags,
            attributes_hash,
            attributes,
            depends_older,
            depends_newer,
        })
    }
}

/// A directory object: its own attributes plus an ordered list of child
/// entries. Entry order is insertion order, not sorted -- lookups are
/// linear, matching the small expected fan-out of a single directory.
#[derive(Debug, Clone, Default)]
pub struct StoreDirectory {
    pub container_id: u64,
    pub attributes: Vec<u8>,
    pub attributes_mod_time_us: u64,
    pub entries: Vec<DirectoryEntry>,
}

impl StoreDirectory {
    pub fn new(container_id: u64) -> Self {
        Self {
            container_id,
            attributes: Vec::new(),
            attributes_mod_time_us: 0,
            entries: Vec::new(),
        }
    }

    pub fn find_by_name(&self, name: &[u8]) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|e| !e.is_deleted() && e.name.bytes() == name)
    }

    pub fn find_by_name_mut(&mut self, name: &[u8]) -> Option<&mut DirectoryEntry> {
        self.entries
            .iter_mut()
            .find(|e| !e.is_deleted() && e.name.bytes() == name)
    }

    pub fn find_by_object_id(&self, object_id: u64) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.object_id == object_id)
    }

    pub fn find_by_object_id_mut(&mut self, object_id: u64) -> Option<&mut DirectoryEntry> {
        self.entries.iter_mut().find(|e| e.object_id == object_id)
    }

    /// Every link in the patch dependency graph must be symmetric: if an
    /// entry points at an older neighbor, that neighbor must point back.
    pub fn check_patch_chain_symmetry(&self) -> Result<(), Error> {
        for entry in &self.entries {
            if entry.depends_older != 0 {
                let older = self
                    .find_by_object_id(entry.depends_older)
                    .with_context(|| format!("dangling depends_older {} on {}", entry.depends_older, entry.object_id))?;
                if older.depends_newer != entry.object_id {
                    bail!(
                        "asymmetric patch chain: {} depends_older={} but {} depends_newer={}",
                        entry.object_id,
                        entry.depends_older,
                        older.object_id,
                        older.depends_newer
                    );
                }
            }
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&DIRECTORY_MAGIC_V1.to_be_bytes())?;
        w.write_all(&self.container_id.to_be_bytes())?;
        if self.attributes.len() > u32::MAX as usize {
            bail!("directory attributes too long");
        }
        w.write_all(&(self.attributes.len() as u32).to_be_bytes())?;
        w.write_all(&self.attributes)?;
        w.write_all(&self.attributes_mod_time_us.to_be_bytes())?;
        if self.entries.len() > u32::MAX as usize {
            bail!("too many directory entries");
        }
        w.write_all(&(self.entries.len() as u32).to_be_bytes())?;
        for entry in &self.entries {
            entry.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).context("reading directory magic")?;
        if u32::from_be_bytes(magic) != DIRECTORY_MAGIC_V1 {
            bail!("bad directory magic (not a v1 directory object)");
        }
        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8)?;
        let container_id = u64::from_be_bytes(buf8);

        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let attr_len = u32::from_be_bytes(buf4) as usize;
        let mut attributes = vec![0u8; attr_len];
        r.read_exact(&mut attributes)?;

        r.read_exact(&mut buf8)?;
        let attributes_mod_time_us = u64::from_be_bytes(buf8);

        r.read_exact(&mut buf4)?;
        let count = u32::from_be_bytes(buf4) as usize;
        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            entries.push(DirectoryEntry::read_from(r)?);
        }

        Ok(Self {
            container_id,
            attributes,
            attributes_mod_time_us,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(object_id: u64, name: &str) -> DirectoryEntry {
        DirectoryEntry {
            name: EntryName::Encrypted(name.as_bytes().to_vec()),
            object_id,
            modification_time_us: 1000,
            size_blocks: 4,
            flags: EntryFlags::FILE,
            attributes_hash: 42,
            attributes: vec![1, 2, 3],
            depends_older: 0,
            depends_newer: 0,
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut dir = StoreDirectory::new(7);
        dir.attributes = vec![9, 9, 9];
        dir.entries.push(sample_entry(100, "a.txt"));
        dir.entries.push(sample_entry(101, "b.txt"));

        let mut buf = Vec::new();
        dir.write_to(&mut buf).unwrap();
        let decoded = StoreDirectory::read_from(&mut &buf[..]).unwrap();

        assert_eq!(decoded.container_id, 7);
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.find_by_name(b"a.txt").unwrap().object_id, 100);
    }

    #[test]
    fn detects_asymmetric_patch_chain() {
        let mut dir = StoreDirectory::new(1);
        let mut older = sample_entry(1, "f");
        older.depends_newer = 2;
        let mut newer = sample_entry(2, "f");
        newer.depends_older = 1;
        dir.entries.push(older);
        dir.entries.push(newer);
        assert!(dir.check_patch_chain_symmetry().is_ok());

        dir.entries[1].depends_older = 999;
        assert!(dir.check_patch_chain_symmetry().is_err());
    }

    #[test]
    fn deleted_entries_are_not_found_by_name() {
        let mut dir = StoreDirectory::new(1);
        let mut entry = sample_entry(5, "gone");
        entry.flags |= EntryFlags::DELETED;
        dir.entries.push(entry);
        assert!(dir.find_by_name(b"gone").is_none());
        assert!(dir.find_by_object_id(5).is_some());
    }
}
