//! Output file buffer.
//!
//! The final size of the module is known before any byte is written, so the
//! output file is created at that exact size and memory-mapped. Sections
//! then write into disjoint ranges of the map, and `commit` flushes it.

use anyhow::{Context, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub struct OutputBuffer {
    map: MmapMut,
    path: PathBuf,
}

impl OutputBuffer {
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self { map, path: path.to_path_buf() })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn commit(self) -> Result<()> {
        self.map
            .flush()
            .with_context(|| format!("failed to write the output file {}", self.path.display()))
    }
}
