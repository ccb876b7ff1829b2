//! A vector stored in a memory-mapped file.
//!
//! The file starts with a fixed 256-byte header (so the payload stays
//! cache-line aligned) followed by the object cells. Growth truncates the
//! file to the next page multiple and remaps.

use bytemuck::{Pod, Zeroable};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use crate::error::{MapError, Result};

/// Mapped files are always allocated in multiples of this page size.
pub const PAGE_SIZE: u64 = 4096;

/// Magic number stored in every container header.
pub const MAGIC: u64 = 0xA375_6FD4_B5D8_BCC1;

const HEADER_SIZE: u64 = 256;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct VectorHeader {
    header_size: u64,
    object_size: u64,
    object_count: u64,
    page_count: u64,
    file_size: u64,
    capacity: u64,
    magic: u64,
    padding: [u64; 25],
}

const _: () = assert!(size_of::<VectorHeader>() as u64 == HEADER_SIZE);

impl VectorHeader {
    /// Header for `n` objects of size `object_size` with at least
    /// `requested_capacity` objects of room. The actual capacity is
    /// whatever fits in the page-rounded file.
    fn with_capacity(object_size: u64, n: u64, requested_capacity: u64) -> Self {
        let requested_capacity = requested_capacity.max(n);
        let byte_count = HEADER_SIZE + object_size * requested_capacity;
        let page_count = byte_count.div_ceil(PAGE_SIZE);
        let file_size = page_count * PAGE_SIZE;
        let capacity = if object_size == 0 {
            requested_capacity
        } else {
            (file_size - HEADER_SIZE) / object_size
        };
        VectorHeader {
            header_size: HEADER_SIZE,
            object_size,
            object_count: n,
            page_count,
            file_size,
            capacity,
            magic: MAGIC,
            padding: [0; 25],
        }
    }
}

enum Map {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A fixed-layout vector backed by a memory-mapped file.
pub struct MappedVector<T: Pod> {
    map: Map,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Pod> MappedVector<T> {
    /// Create a new mapped vector with `n` zeroed objects and room for at
    /// least `capacity` objects.
    pub fn create_new(path: impl AsRef<Path>, n: usize, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header =
            VectorHeader::with_capacity(size_of::<T>() as u64, n as u64, capacity as u64);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| MapError::io(&path, e))?;
        file.set_len(header.file_size)
            .map_err(|e| MapError::io(&path, e))?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| MapError::io(&path, e))?;

        let mut v = MappedVector {
            map: Map::ReadWrite(mmap),
            path,
            _marker: PhantomData,
        };
        *v.header_mut() = header;
        Ok(v)
    }

    /// Open a previously created vector, validating its header.
    pub fn open_existing(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| MapError::io(&path, e))?;
        let file_size = file
            .metadata()
            .map_err(|e| MapError::io(&path, e))?
            .len();

        let map = if writable {
            Map::ReadWrite(
                unsafe { MmapOptions::new().map_mut(&file) }
                    .map_err(|e| MapError::io(&path, e))?,
            )
        } else {
            Map::ReadOnly(
                unsafe { MmapOptions::new().map(&file) }.map_err(|e| MapError::io(&path, e))?,
            )
        };

        let v = MappedVector {
            map,
            path,
            _marker: PhantomData,
        };

        if file_size < HEADER_SIZE {
            return Err(MapError::corrupt(&v.path, "file shorter than header"));
        }
        let header = v.header();
        if header.magic != MAGIC {
            return Err(MapError::corrupt(&v.path, "magic number mismatch"));
        }
        if header.file_size != file_size {
            return Err(MapError::corrupt(
                &v.path,
                format!(
                    "header file size {} does not match actual size {}",
                    header.file_size, file_size
                ),
            ));
        }
        if header.object_size != size_of::<T>() as u64 {
            return Err(MapError::corrupt(
                &v.path,
                format!(
                    "object size {} does not match expected {}",
                    header.object_size,
                    size_of::<T>()
                ),
            ));
        }
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.header().object_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_slice(&self) -> &[T] {
        let start = HEADER_SIZE as usize;
        let end = start + self.len() * size_of::<T>();
        bytemuck::cast_slice(&self.bytes()[start..end])
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let start = HEADER_SIZE as usize;
        let end = start + self.len() * size_of::<T>();
        bytemuck::cast_slice_mut(&mut self.bytes_mut()[start..end])
    }

    /// Append one object, growing the file if the capacity is exhausted.
    pub fn push(&mut self, t: T) -> Result<()> {
        let n = self.len();
        if n == self.capacity() {
            self.grow(n as u64 + 1)?;
        }
        self.header_mut().object_count = n as u64 + 1;
        self.as_mut_slice()[n] = t;
        Ok(())
    }

    /// Resize to `n` objects. New objects are zeroed.
    pub fn resize(&mut self, n: usize) -> Result<()> {
        let old = self.len();
        if n > self.capacity() {
            self.grow(n as u64)?;
        }
        self.header_mut().object_count = n as u64;
        if n > old {
            for t in &mut self.as_mut_slice()[old..n] {
                *t = T::zeroed();
            }
        }
        Ok(())
    }

    /// Ensure room for at least `capacity` objects without changing the length.
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity > self.capacity() {
            let n = self.len() as u64;
            self.remap(n, capacity as u64)?;
        }
        Ok(())
    }

    /// Grow so that `new_len` objects fit, with capacity 1.5 times the new
    /// length.
    fn grow(&mut self, new_len: u64) -> Result<()> {
        let requested = ((new_len as f64) * 1.5) as u64;
        self.remap(self.header().object_count, requested.max(new_len))
    }

    fn remap(&mut self, n: u64, requested_capacity: u64) -> Result<()> {
        let header = VectorHeader::with_capacity(size_of::<T>() as u64, n, requested_capacity);

        self.sync_to_disk()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| MapError::capacity(&self.path, format!("cannot reopen to grow: {e}")))?;
        file.set_len(header.file_size)
            .map_err(|e| MapError::capacity(&self.path, format!("cannot truncate to grow: {e}")))?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| MapError::capacity(&self.path, format!("cannot remap to grow: {e}")))?;
        self.map = Map::ReadWrite(mmap);
        *self.header_mut() = header;
        Ok(())
    }

    /// Force the mapped memory out to disk.
    pub fn sync_to_disk(&self) -> Result<()> {
        match &self.map {
            Map::ReadOnly(_) => Ok(()),
            Map::ReadWrite(m) => m.flush().map_err(|e| MapError::io(&self.path, e)),
        }
    }

    /// Sync and unmap.
    pub fn close(self) -> Result<()> {
        self.sync_to_disk()
    }

    /// Close and delete the backing file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path).map_err(|e| MapError::io(&path, e))
    }

    fn bytes(&self) -> &[u8] {
        match &self.map {
            Map::ReadOnly(m) => &m[..],
            Map::ReadWrite(m) => &m[..],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.map {
            Map::ReadOnly(_) => panic!(
                "write access to read-only mapping {}",
                self.path.display()
            ),
            Map::ReadWrite(m) => &mut m[..],
        }
    }

    fn header(&self) -> &VectorHeader {
        bytemuck::from_bytes(&self.bytes()[..HEADER_SIZE as usize])
    }

    fn header_mut(&mut self) -> &mut VectorHeader {
        bytemuck::from_bytes_mut(&mut self.bytes_mut()[..HEADER_SIZE as usize])
    }
}

impl<T: Pod> Deref for MappedVector<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Pod> DerefMut for MappedVector<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}
