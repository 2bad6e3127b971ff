//! NBD backend
//!
//! Thin adapter exposing a [`vmio_nbd::Client`] connection through the
//! [`Backend`] interface.

use std::io::SeekFrom;

use async_trait::async_trait;
use tracing::debug;

use vmio_common::{DirtyExtent, Error, Result, ZeroExtent};
use vmio_nbd::{Client, NbdUrl};

use crate::{Backend, Mode, Options};

/// Backend for NBD exports.
pub struct NbdBackend {
    client: Client,
    url: NbdUrl,
    mode: Mode,
    sparse: bool,
    dirty: bool,
    position: u64,
    max_connections: u32,
}

impl NbdBackend {
    /// Connect to an NBD export. A writable backend does not guarantee
    /// that the underlying NBD server allows writing.
    pub async fn open(url: &NbdUrl, options: &Options) -> Result<Self> {
        let client = Client::connect_url(url, options.dirty).await?;
        debug!(
            address = %url.address,
            export = url.export,
            sparse = options.sparse,
            "open"
        );
        Ok(Self {
            client,
            url: url.clone(),
            mode: options.mode,
            sparse: options.sparse,
            dirty: false,
            position: 0,
            max_connections: options.max_connections,
        })
    }
}

#[async_trait]
impl Backend for NbdBackend {
    fn name(&self) -> &'static str {
        "nbd"
    }

    async fn size(&mut self) -> Result<u64> {
        Ok(self.client.export_size())
    }

    fn block_size(&self) -> usize {
        // qemu-nbd reports minimum_block_size=1, so callers never need
        // to align requests and read more data than needed.
        self.client.minimum_block_size() as usize
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
            SeekFrom::End(n) => self.client.export_size().saturating_add_signed(n),
        };
        Ok(self.position)
    }

    async fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.readable() {
            return Err(Error::unsupported("readinto on write-only backend"));
        }
        // A read request past the end of the export is invalid; clip to
        // the export size and report a short read.
        let available = self.client.export_size().saturating_sub(self.position);
        let length = (buf.len() as u64).min(available) as usize;
        if length == 0 {
            return Ok(0);
        }
        self.client.readinto(self.position, &mut buf[..length]).await?;
        self.position += length as u64;
        Ok(length)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable() {
            return Err(Error::unsupported("write on read-only backend"));
        }
        self.client.write(self.position, buf).await?;
        self.position += buf.len() as u64;
        self.dirty = true;
        Ok(buf.len())
    }

    async fn zero(&mut self, length: u64) -> Result<u64> {
        if !self.writable() {
            return Err(Error::unsupported("zero on read-only backend"));
        }
        self.client.zero(self.position, length, self.sparse).await?;
        self.position += length;
        self.dirty = true;
        Ok(length)
    }

    async fn flush(&mut self) -> Result<()> {
        self.client.flush().await?;
        self.dirty = false;
        Ok(())
    }

    async fn zero_extents(&mut self) -> Result<Vec<ZeroExtent>> {
        // If the server does not support base:allocation, report one
        // data extent like other backends.
        if !self.client.has_base_allocation() {
            return Ok(vec![ZeroExtent::new(
                0,
                self.client.export_size(),
                false,
                false,
            )]);
        }

        let size = self.client.export_size();
        let mut start = 0;
        let mut result = Vec::new();
        for ext in self.client.extents(0, size, false).await? {
            result.push(ZeroExtent::new(start, ext.length, ext.zero(), ext.hole()));
            start += ext.length;
        }
        Ok(result)
    }

    async fn dirty_extents(&mut self) -> Result<Vec<DirtyExtent>> {
        // Unlike zero extents, faking a dirty response would break
        // incremental backup; fail instead.
        if self.client.dirty_bitmap().is_none() {
            return Err(Error::unsupported(format!(
                "NBD export {:?} does not support dirty extents",
                self.client.export_name()
            )));
        }

        let size = self.client.export_size();
        let mut start = 0;
        let mut result = Vec::new();
        for ext in self.client.extents(0, size, true).await? {
            result.push(DirtyExtent::new(start, ext.length, ext.dirty(), ext.zero()));
            start += ext.length;
        }
        Ok(result)
    }

    async fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        let url = self.url.clone();
        let options = Options {
            mode: self.mode,
            sparse: self.sparse,
            dirty: self.client.dirty(),
            max_connections: self.max_connections,
            ..Options::default()
        };
        Ok(Box::new(Self::open(&url, &options).await?))
    }

    async fn close(&mut self) {
        debug!(address = %self.url.address, "close");
        self.client.close().await;
    }

    fn max_readers(&self) -> u32 {
        self.max_connections
    }

    fn max_writers(&self) -> u32 {
        self.max_connections
    }
}
