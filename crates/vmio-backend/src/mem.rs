//! Memory backend
//!
//! Image stored in a shared memory buffer. Used by tests that need a
//! backend without touching storage; clones share the same buffer like
//! file clones share the same file.

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use vmio_common::{DirtyExtent, Error, Result, ZeroExtent};

use crate::{Backend, Mode};

/// Backend for in-memory images.
pub struct MemBackend {
    data: Arc<Mutex<Vec<u8>>>,
    mode: Mode,
    position: u64,
    dirty: bool,
    // When set, reported instead of the single all-data extent.
    extents: Option<Arc<Vec<ZeroExtent>>>,
    dirty_extents: Option<Arc<Vec<DirtyExtent>>>,
}

impl MemBackend {
    #[must_use]
    pub fn new(size: usize, mode: Mode) -> Self {
        Self::with_data(vec![0; size], mode)
    }

    #[must_use]
    pub fn with_data(data: Vec<u8>, mode: Mode) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            mode,
            position: 0,
            dirty: false,
            extents: None,
            dirty_extents: None,
        }
    }

    /// Report these extents instead of one all-data extent.
    #[must_use]
    pub fn with_extents(mut self, extents: Vec<ZeroExtent>) -> Self {
        self.extents = Some(Arc::new(extents));
        self
    }

    /// Report these dirty extents.
    #[must_use]
    pub fn with_dirty_extents(mut self, extents: Vec<DirtyExtent>) -> Self {
        self.dirty_extents = Some(Arc::new(extents));
        self
    }

    /// Snapshot of the image content.
    #[must_use]
    pub fn content(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

#[async_trait]
impl Backend for MemBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn size(&mut self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn block_size(&self) -> usize {
        1
    }

    fn readable(&self) -> bool {
        self.mode.readable()
    }

    fn writable(&self) -> bool {
        self.mode.writable()
    }

    fn tell(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(n) => self.position.saturating_add_signed(n),
            SeekFrom::End(n) => (self.data.lock().len() as u64).saturating_add_signed(n),
        };
        Ok(self.position)
    }

    async fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let start = (self.position as usize).min(data.len());
        let length = buf.len().min(data.len() - start);
        buf[..length].copy_from_slice(&data[start..start + length]);
        drop(data);
        self.position += length as u64;
        Ok(length)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable() {
            return Err(Error::unsupported("write on read-only backend"));
        }
        let mut data = self.data.lock();
        let start = self.position as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Error::invalid_argument(format!(
                "write after end of image: {end} > {}",
                data.len()
            )));
        }
        data[start..end].copy_from_slice(buf);
        drop(data);
        self.position += buf.len() as u64;
        self.dirty = true;
        Ok(buf.len())
    }

    async fn zero(&mut self, length: u64) -> Result<u64> {
        if !self.writable() {
            return Err(Error::unsupported("zero on read-only backend"));
        }
        let mut data = self.data.lock();
        let start = self.position as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(Error::invalid_argument(format!(
                "zero after end of image: {end} > {}",
                data.len()
            )));
        }
        data[start..end].fill(0);
        drop(data);
        self.position += length;
        self.dirty = true;
        Ok(length)
    }

    async fn flush(&mut self) -> Result<()> {
        self.dirty = false;
        Ok(())
    }

    async fn zero_extents(&mut self) -> Result<Vec<ZeroExtent>> {
        if let Some(extents) = &self.extents {
            return Ok(extents.as_ref().clone());
        }
        Ok(vec![ZeroExtent::new(
            0,
            self.data.lock().len() as u64,
            false,
            false,
        )])
    }

    async fn dirty_extents(&mut self) -> Result<Vec<DirtyExtent>> {
        match &self.dirty_extents {
            Some(extents) => Ok(extents.as_ref().clone()),
            None => Err(Error::unsupported(
                "backend memory does not support dirty extents",
            )),
        }
    }

    async fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        Ok(Box::new(Self {
            data: Arc::clone(&self.data),
            mode: self.mode,
            position: 0,
            dirty: false,
            extents: self.extents.clone(),
            dirty_extents: self.dirty_extents.clone(),
        }))
    }

    async fn close(&mut self) {}

    fn max_readers(&self) -> u32 {
        8
    }

    fn max_writers(&self) -> u32 {
        8
    }
}
