//! vmio Backends
//!
//! A backend is an open handle to image storage exposing a unified
//! size/seek/read/write/zero/flush/extents interface. Backends are not
//! shared across tasks; cloning a backend opens another independent
//! handle to the same resource.

pub mod file;
pub mod http;
pub mod mem;
pub mod nbd;
mod url;

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;

use vmio_common::{AlignedBuffer, DirtyExtent, Error, Result, ZeroExtent};

pub use url::ImageUrl;

/// Access mode of a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Read,
    ReadWrite,
}

impl Mode {
    #[must_use]
    pub const fn readable(self) -> bool {
        true
    }

    #[must_use]
    pub const fn writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Options for opening a backend.
#[derive(Clone, Debug)]
pub struct Options {
    pub mode: Mode,
    /// Deallocate space when zeroing if possible.
    pub sparse: bool,
    /// Configure the backend to report dirty extents.
    pub dirty: bool,
    /// Maximum number of connections per backend allowed on this
    /// server; bounds max_readers and max_writers.
    pub max_connections: u32,
    /// CA bundle used by the http backend for server verification.
    pub cafile: Option<PathBuf>,
    /// When false, the http backend skips certificate verification.
    pub secure: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: Mode::Read,
            sparse: false,
            dirty: false,
            max_connections: 8,
            cafile: None,
            secure: true,
        }
    }
}

/// Unified storage interface.
///
/// A backend exclusively owns its transport and file handles and keeps
/// a private position used by `readinto`/`write`/`zero`. Concurrent
/// calls on one handle are undefined; each worker must own a clone.
#[async_trait]
pub trait Backend: Send {
    /// Backend kind, used for logging and configuration lookup.
    fn name(&self) -> &'static str;

    /// Image size in bytes.
    async fn size(&mut self) -> Result<u64>;

    /// Alignment required for efficient `readinto` and `write`.
    fn block_size(&self) -> usize;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;

    /// Current position.
    fn tell(&self) -> u64;

    /// Change the position. `SeekFrom::End` may need to fetch the size.
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Read from the current position into `buf`, advancing the
    /// position. Returns the number of bytes read; may be short near
    /// end of file.
    async fn readinto(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at the current position, advancing the position.
    /// May write less than `buf.len()` when the position or length is
    /// not aligned to the block size.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Write zeroes at the current position, advancing the position.
    /// With a sparse backend, zeroed ranges are deallocated. Returns
    /// the number of bytes zeroed, which may be less than `length`.
    async fn zero(&mut self, length: u64) -> Result<u64>;

    /// Flush written data to storage.
    async fn flush(&mut self) -> Result<()>;

    /// Allocation extents for the whole image, in order, coalesced.
    async fn zero_extents(&mut self) -> Result<Vec<ZeroExtent>>;

    /// Dirty bitmap extents for the whole image. Fails with an
    /// unsupported-operation error when the backend has no dirty
    /// bitmap.
    async fn dirty_extents(&mut self) -> Result<Vec<DirtyExtent>> {
        Err(Error::unsupported(format!(
            "backend {} does not support dirty extents",
            self.name()
        )))
    }

    /// Open a new independent handle to the same resource. The clone
    /// has its own position and error state; closing one handle does
    /// not close the other.
    async fn clone_backend(&self) -> Result<Box<dyn Backend>>;

    /// Release the underlying resources.
    async fn close(&mut self);

    /// Concurrency limits advertised by this backend.
    fn max_readers(&self) -> u32;

    fn max_writers(&self) -> u32;

    // Optional fast paths, discovered by capability query. They stream
    // directly between this backend and another one, avoiding a round
    // trip through an intermediate buffer per request.

    fn can_read_from(&self) -> bool {
        false
    }

    fn can_write_to(&self) -> bool {
        false
    }

    /// Stream `length` bytes from `src` into this backend at the
    /// current position.
    async fn read_from(
        &mut self,
        _src: &mut dyn Backend,
        _length: u64,
        _buf: &mut AlignedBuffer,
    ) -> Result<()> {
        Err(Error::unsupported(format!(
            "backend {} does not support read_from",
            self.name()
        )))
    }

    /// Stream `length` bytes from this backend at the current position
    /// into `dst`.
    async fn write_to(
        &mut self,
        _dst: &mut dyn Backend,
        _length: u64,
        _buf: &mut AlignedBuffer,
    ) -> Result<()> {
        Err(Error::unsupported(format!(
            "backend {} does not support write_to",
            self.name()
        )))
    }
}

/// Open a backend for an image URL.
pub async fn open(url: &ImageUrl, options: &Options) -> Result<Box<dyn Backend>> {
    match url {
        ImageUrl::File(path) => {
            let backend = file::FileBackend::open(path, options).await?;
            Ok(Box::new(backend))
        }
        ImageUrl::Nbd(nbd_url) => {
            let backend = nbd::NbdBackend::open(nbd_url, options).await?;
            Ok(Box::new(backend))
        }
        ImageUrl::Remote(remote) => {
            let backend = http::HttpBackend::open(remote.clone(), options).await?;
            Ok(Box::new(backend))
        }
    }
}
