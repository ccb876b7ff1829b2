//! Open-addressing string interning table, memory mapped, without rehash.
//!
//! Ids are dense and double as the reverse index: id `k` names the `k`-th
//! interned string. The bucket count is fixed at creation; creators must
//! size it at least twice the expected number of entries.

use fnv::FnvHasher;
use std::hash::Hasher;
use std::path::Path;

use crate::error::{MapError, Result};
use crate::mapped_vector::MappedVector;
use crate::vector_of_vectors::VectorOfVectors;

/// Sentinel for an empty bucket and for failed lookups.
pub const INVALID_STRING_ID: u32 = u32::MAX;

pub struct StringTable {
    buckets: MappedVector<u32>,
    strings: VectorOfVectors<u8>,
}

impl StringTable {
    /// Create a new table backed by `<name>-Buckets` and
    /// `<name>-Strings.{toc,data}`, with a fixed bucket count of
    /// `capacity`.
    pub fn create_new(name: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let name = name.as_ref();
        assert!(capacity > 0, "string table capacity must be positive");
        let mut buckets = MappedVector::create_new(suffixed(name, "-Buckets"), capacity, capacity)?;
        buckets.as_mut_slice().fill(INVALID_STRING_ID);
        let strings = VectorOfVectors::create_new(suffixed(name, "-Strings"))?;
        Ok(StringTable { buckets, strings })
    }

    pub fn open_existing(name: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let name = name.as_ref();
        let buckets = MappedVector::open_existing(suffixed(name, "-Buckets"), writable)?;
        let strings = VectorOfVectors::open_existing(suffixed(name, "-Strings"), writable)?;
        if strings.len() > buckets.len() {
            return Err(MapError::corrupt(
                buckets.path(),
                format!(
                    "{} interned strings exceed bucket capacity {}",
                    strings.len(),
                    buckets.len()
                ),
            ));
        }
        Ok(StringTable { buckets, strings })
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Fixed bucket count.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Look up a name, returning its id if present.
    pub fn get(&self, name: &str) -> Option<u32> {
        let capacity = self.capacity();
        let mut slot = self.home_slot(name);
        for _ in 0..capacity {
            let id = self.buckets[slot];
            if id == INVALID_STRING_ID {
                return None;
            }
            if self.strings.row(id as usize) == name.as_bytes() {
                return Some(id);
            }
            slot = (slot + 1) % capacity;
        }
        None
    }

    /// Look up a name, interning it if absent.
    pub fn intern(&mut self, name: &str) -> Result<u32> {
        let capacity = self.capacity();
        let mut slot = self.home_slot(name);
        for _ in 0..capacity {
            let id = self.buckets[slot];
            if id == INVALID_STRING_ID {
                let new_id = self.len() as u32;
                self.buckets[slot] = new_id;
                self.strings.append_row_from_slice(name.as_bytes())?;
                return Ok(new_id);
            }
            if self.strings.row(id as usize) == name.as_bytes() {
                return Ok(id);
            }
            slot = (slot + 1) % capacity;
        }
        Err(MapError::capacity(
            self.buckets.path(),
            format!("string table is full at {capacity} entries"),
        ))
    }

    /// The string interned under `id`.
    pub fn string(&self, id: u32) -> &str {
        std::str::from_utf8(self.strings.row(id as usize)).expect("interned string is valid utf-8")
    }

    pub fn equal(&self, id: u32, name: &str) -> bool {
        self.strings.row(id as usize) == name.as_bytes()
    }

    pub fn sync_to_disk(&self) -> Result<()> {
        self.buckets.sync_to_disk()?;
        self.strings.sync_to_disk()
    }

    pub fn close(self) -> Result<()> {
        self.buckets.close()?;
        self.strings.close()
    }

    pub fn remove(self) -> Result<()> {
        self.buckets.remove()?;
        self.strings.remove()
    }

    fn home_slot(&self, name: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(name.as_bytes());
        (hasher.finish() % self.capacity() as u64) as usize
    }
}

fn suffixed(name: &Path, suffix: &str) -> std::path::PathBuf {
    let mut s = name.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut t = StringTable::create_new(dir.path().join("Names"), 64)?;
        let a = t.intern("ACTB")?;
        let b = t.intern("GAPDH")?;
        assert_ne!(a, b);
        assert_eq!(t.intern("ACTB")?, a);
        assert_eq!(t.get("GAPDH"), Some(b));
        assert_eq!(t.get("MISSING"), None);
        assert_eq!(t.string(a), "ACTB");
        assert_eq!(t.len(), 2);
        Ok(())
    }

    #[test]
    fn full_table_reports_capacity_exhausted() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut t = StringTable::create_new(dir.path().join("Tiny"), 4)?;
        for i in 0..4 {
            t.intern(&format!("name{i}"))?;
        }
        let err = t.intern("overflow").unwrap_err();
        assert!(matches!(err, MapError::CapacityExhausted { .. }));
        // Lookups still terminate on a full table.
        assert_eq!(t.get("absent"), None);
        Ok(())
    }

    #[test]
    fn ids_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("Persist");
        let (a, b) = {
            let mut t = StringTable::create_new(&name, 32)?;
            let a = t.intern("cell-0")?;
            let b = t.intern("cell-1")?;
            t.close()?;
            (a, b)
        };
        let t = StringTable::open_existing(&name, false)?;
        assert_eq!(t.get("cell-0"), Some(a));
        assert_eq!(t.get("cell-1"), Some(b));
        assert_eq!(t.string(b), "cell-1");
        Ok(())
    }
}
