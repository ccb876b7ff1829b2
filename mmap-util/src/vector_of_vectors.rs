//! A jagged vector of vectors stored contiguously in mapped memory.
//!
//! A table of contents holds, for each row, the offset of its first element
//! in the flat data vector; entry `i` spans `toc[i]..toc[i+1]`.

use bytemuck::Pod;
use std::path::Path;

use crate::error::Result;
use crate::mapped_vector::MappedVector;

pub struct VectorOfVectors<T: Pod> {
    toc: MappedVector<u64>,
    data: MappedVector<T>,

    // Per-row counts while a two-pass bulk build is in flight.
    pass1_counts: Option<Vec<u64>>,
}

impl<T: Pod> VectorOfVectors<T> {
    /// Create a new empty jagged vector backed by `<name>.toc` and
    /// `<name>.data`.
    pub fn create_new(name: impl AsRef<Path>) -> Result<Self> {
        let name = name.as_ref();
        let mut toc = MappedVector::create_new(with_suffix(name, ".toc"), 0, 1)?;
        toc.push(0)?;
        let data = MappedVector::create_new(with_suffix(name, ".data"), 0, 0)?;
        Ok(VectorOfVectors {
            toc,
            data,
            pass1_counts: None,
        })
    }

    pub fn open_existing(name: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let name = name.as_ref();
        let toc = MappedVector::open_existing(with_suffix(name, ".toc"), writable)?;
        let data = MappedVector::open_existing(with_suffix(name, ".data"), writable)?;
        Ok(VectorOfVectors {
            toc,
            data,
            pass1_counts: None,
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.toc.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of stored elements across all rows.
    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    pub fn row(&self, i: usize) -> &[T] {
        let begin = self.toc[i] as usize;
        let end = self.toc[i + 1] as usize;
        &self.data.as_slice()[begin..end]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [T] {
        let begin = self.toc[i] as usize;
        let end = self.toc[i + 1] as usize;
        &mut self.data.as_mut_slice()[begin..end]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        (0..self.len()).map(move |i| self.row(i))
    }

    /// Append an empty row.
    pub fn append_row(&mut self) -> Result<()> {
        let back = *self.toc.last().expect("toc is never empty");
        self.toc.push(back)
    }

    /// Append one element to the last row.
    pub fn append_to_last_row(&mut self, t: T) -> Result<()> {
        assert!(!self.is_empty(), "append_to_last_row on empty jagged vector");
        let n = self.toc.len();
        self.toc[n - 1] += 1;
        self.data.push(t)
    }

    /// Append a whole row.
    pub fn append_row_from_slice(&mut self, row: &[T]) -> Result<()> {
        self.append_row()?;
        for t in row {
            self.append_to_last_row(*t)?;
        }
        Ok(())
    }

    /// Begin a two-pass bulk build of `n` rows: pass 1 records per-row
    /// counts, pass 2 prefix-sums them into the table of contents and
    /// scatters the entries.
    pub fn begin_pass1(&mut self, n: usize) {
        self.pass1_counts = Some(vec![0; n]);
    }

    pub fn increment_count(&mut self, row: usize, m: u64) {
        self.pass1_counts
            .as_mut()
            .expect("begin_pass1 not called")[row] += m;
    }

    pub fn begin_pass2(&mut self) -> Result<()> {
        let counts = self
            .pass1_counts
            .as_ref()
            .expect("begin_pass1 not called");
        let n = counts.len();
        self.toc.reserve(n + 1)?;
        self.toc.resize(n + 1)?;
        self.toc[0] = 0;
        for i in 0..n {
            let next = self.toc[i] + counts[i];
            self.toc[i + 1] = next;
        }
        let total = self.toc[n] as usize;
        self.data.reserve(total)?;
        self.data.resize(total)?;
        Ok(())
    }

    /// Store one element of `row` during pass 2. Elements of a row are
    /// filled back to front; each row must receive exactly the count
    /// declared in pass 1.
    pub fn store(&mut self, row: usize, t: T) {
        let counts = self
            .pass1_counts
            .as_mut()
            .expect("begin_pass1 not called");
        counts[row] -= 1;
        let slot = (self.toc[row] + counts[row]) as usize;
        self.data.as_mut_slice()[slot] = t;
    }

    /// Replace the entire contents with the given rows, in place.
    pub fn replace_all_rows(&mut self, rows: &[Vec<T>]) -> Result<()> {
        let n = rows.len();
        self.toc.reserve(n + 1)?;
        self.toc.resize(n + 1)?;
        self.toc[0] = 0;
        for (i, row) in rows.iter().enumerate() {
            let next = self.toc[i] + row.len() as u64;
            self.toc[i + 1] = next;
        }
        let total = self.toc[n] as usize;
        self.data.reserve(total)?;
        self.data.resize(total)?;
        let data = self.data.as_mut_slice();
        let mut k = 0;
        for row in rows {
            data[k..k + row.len()].copy_from_slice(row);
            k += row.len();
        }
        Ok(())
    }

    pub fn end_pass2(&mut self) {
        let counts = self
            .pass1_counts
            .take()
            .expect("begin_pass1 not called");
        assert!(
            counts.iter().all(|&c| c == 0),
            "bulk build did not store the declared number of entries"
        );
    }

    pub fn sync_to_disk(&self) -> Result<()> {
        self.toc.sync_to_disk()?;
        self.data.sync_to_disk()
    }

    pub fn close(self) -> Result<()> {
        self.toc.close()?;
        self.data.close()
    }

    pub fn remove(self) -> Result<()> {
        self.toc.remove()?;
        self.data.remove()
    }
}

fn with_suffix(name: &Path, suffix: &str) -> std::path::PathBuf {
    let mut s = name.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}
