//! File and block device backend
//!
//! Uses direct I/O so transfers do not pollute the host page cache and
//! writes hit storage when flushed. O_DIRECT requires reads and writes
//! through page-aligned buffers; unaligned positions and short tails
//! fall back to a read-modify-write of the containing block.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::SeekFrom;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::FallocateFlags;
use tracing::debug;

use vmio_common::units::MIB;
use vmio_common::{AlignedBuffer, DirtyExtent, Error, Result, ZeroExtent};

use crate::{Backend, Mode, Options};

mod ioctl {
    use nix::{ioctl_read, ioctl_write_ptr_bad, request_code_none};
    const BLK_IOCTL: u8 = 0x12;
    ioctl_read!(blkgetsize64, BLK_IOCTL, 114, u64);
    ioctl_write_ptr_bad!(blkzeroout, request_code_none!(BLK_IOCTL, 127), [u64; 2]);
}

/// Block size assumed for block devices.
const DEVICE_BLOCK_SIZE: usize = 512;

/// Backend for local files and block devices.
pub struct FileBackend {
    file: Option<File>,
    path: PathBuf,
    mode: Mode,
    sparse: bool,
    dirty: bool,
    device: bool,
    block_size: usize,
    position: u64,
    max_connections: u32,

    // Latched to false on the first EOPNOTSUPP and inherited by
    // clones, so every handle probes the kernel at most once.
    can_zero_range: bool,
    can_punch_hole: bool,
    can_fallocate: bool,
}

impl FileBackend {
    /// Open a file backend. Storage that cannot do direct I/O is
    /// rejected.
    pub async fn open(path: impl AsRef<Path>, options: &Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut open_options = std::fs::OpenOptions::new();
        open_options.read(true).custom_flags(libc::O_DIRECT);
        if options.mode.writable() {
            open_options.write(true);
        }
        let file = open_options.open(&path)?;

        let device = file.metadata()?.file_type().is_block_device();

        let mut backend = Self {
            file: Some(file),
            path,
            mode: options.mode,
            sparse: options.sparse,
            dirty: false,
            device,
            block_size: DEVICE_BLOCK_SIZE,
            position: 0,
            max_connections: options.max_connections,
            can_zero_range: true,
            can_punch_hole: true,
            can_fallocate: true,
        };

        if !device {
            backend.block_size = backend.detect_block_size()?;
        }

        debug!(
            path = %backend.path.display(),
            device,
            sparse = backend.sparse,
            block_size = backend.block_size,
            "open"
        );
        Ok(backend)
    }

    fn fio(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::internal("operation on closed file backend"))
    }

    /// Detect the storage block size by probing the minimal size that
    /// works for direct I/O. When nothing works the probe read of 1
    /// byte still succeeds (e.g. over NFS) and we fall back to 4096.
    fn detect_block_size(&self) -> Result<usize> {
        let mut buf = AlignedBuffer::new(4096);
        for block_size in [1, 512, 4096] {
            debug!(block_size, "trying block size");
            match nix::sys::uio::pread(self.fio()?, &mut buf.as_mut_slice()[..block_size], 0) {
                Ok(_) => {
                    let detected = if block_size == 1 {
                        debug!("cannot detect block size - using 4096");
                        4096
                    } else {
                        debug!(block_size, "detected block size");
                        block_size
                    };
                    return Ok(detected);
                }
                Err(Errno::EINVAL) => {}
                Err(err) => return Err(Error::Io(err.into())),
            }
        }
        Err(Error::unsupported(format!(
            "cannot use direct I/O with {}",
            self.path.display()
        )))
    }

    fn aligned(&self, n: u64) -> bool {
        n & (self.block_size as u64 - 1) == 0
    }

    fn file_size(&self) -> Result<u64> {
        let file = self.fio()?;
        if self.device {
            let mut size = 0;
            unsafe { ioctl::blkgetsize64(file.as_raw_fd(), &raw mut size) }
                .map_err(|err| Error::Io(err.into()))?;
            Ok(size)
        } else {
            Ok(file.metadata()?.len())
        }
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        nix::sys::uio::pread(self.fio()?, buf, offset as i64).map_err(|err| Error::Io(err.into()))
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        nix::sys::uio::pwrite(self.fio()?, buf, offset as i64).map_err(|err| Error::Io(err.into()))
    }

    fn write_sync(&mut self, buf: &[u8]) -> Result<usize> {
        self.dirty = true;
        if !self.aligned(self.position) || buf.len() < self.block_size {
            return self.write_unaligned(buf);
        }
        // The fast path: write whole blocks in place. When the length
        // is not a multiple of the block size, write the largest whole
        // block prefix; the caller comes back for the rest.
        let count = if self.aligned(buf.len() as u64) {
            buf.len()
        } else {
            buf.len() - buf.len() % self.block_size
        };
        let n = self.pwrite(&buf[..count], self.position)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Write up to block_size bytes from `buf` into the current block
    /// with a read-modify-write: read the block, patch the affected
    /// slice, write it back, and advance by the patched byte count.
    fn write_unaligned(&mut self, buf: &[u8]) -> Result<usize> {
        let start = self.position;
        let offset = (start % self.block_size as u64) as usize;
        let count = buf.len().min(self.block_size - offset);
        debug!(start, offset, count, "unaligned write");

        let mut block = AlignedBuffer::new(self.block_size);
        let block_start = start - offset as u64;
        self.pread(block.as_mut_slice(), block_start)?;
        block.as_mut_slice()[offset..offset + count].copy_from_slice(&buf[..count]);
        // Writing the whole block back pads the file to the block size.
        self.pwrite(block.as_slice(), block_start)?;

        self.position = start + count as u64;
        Ok(count)
    }

    fn zero_sync(&mut self, length: u64) -> Result<u64> {
        self.dirty = true;
        let start = self.position;
        if !self.aligned(start) || length < self.block_size as u64 {
            let count = length.min(self.block_size as u64 - start % self.block_size as u64);
            let zeroes = vec![0; count as usize];
            return Ok(self.write_unaligned(&zeroes)? as u64);
        }

        let count = length - length % self.block_size as u64;
        if self.device {
            self.zero_device(count)
        } else if self.sparse {
            self.zero_sparse(count)
        } else {
            self.zero_allocate(count)
        }
    }

    /// Zero a range on a block device. fallocate() works for block
    /// devices since kernel 4.9 and also invalidates the page cache;
    /// older kernels fall back to the BLKZEROOUT ioctl.
    fn zero_device(&mut self, count: u64) -> Result<u64> {
        let offset = self.position;

        if self.can_fallocate {
            match self.fallocate(FallocateFlags::FALLOC_FL_ZERO_RANGE, offset, count) {
                Ok(true) => {
                    self.position = offset + count;
                    return Ok(count);
                }
                Ok(false) => {
                    debug!("fallocate(ZERO_RANGE) is not supported, zeroing using BLKZEROOUT");
                    self.can_fallocate = false;
                }
                Err(err) => return Err(err),
            }
        }

        let range = [offset, count];
        unsafe { ioctl::blkzeroout(self.fio()?.as_raw_fd(), &raw const range) }
            .map_err(|err| Error::Io(err.into()))?;
        self.position = offset + count;
        Ok(count)
    }

    /// Zero a range in a regular file, allocating space.
    fn zero_allocate(&mut self, count: u64) -> Result<u64> {
        let offset = self.position;

        // The modern way, zeroing a range with a single call. Not
        // supported by NFS 4.2.
        if self.can_zero_range {
            if self.fallocate(FallocateFlags::FALLOC_FL_ZERO_RANGE, offset, count)? {
                self.position = offset + count;
                return Ok(count);
            }
            debug!("cannot zero range");
            self.can_zero_range = false;
        }

        // Punch a hole and allocate the range again.
        if self.can_punch_hole && self.can_fallocate {
            let mode = FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE;
            if self.fallocate(mode, offset, count)? {
                if self.fallocate(FallocateFlags::empty(), offset, count)? {
                    self.position = offset + count;
                    return Ok(count);
                }
                debug!("cannot fallocate range");
                self.can_fallocate = false;
            } else {
                debug!("cannot punch hole");
                self.can_punch_hole = false;
            }
        }

        // When writing after the end of the file, allocation extends
        // the file with zeroes.
        if self.can_fallocate && offset >= self.file_size()? {
            if self.fallocate(FallocateFlags::empty(), offset, count)? {
                self.position = offset + count;
                return Ok(count);
            }
            debug!("cannot fallocate range");
            self.can_fallocate = false;
        }

        self.write_zeroes(count)?;
        Ok(count)
    }

    /// Zero a range in a regular file, punching a hole.
    fn zero_sparse(&mut self, count: u64) -> Result<u64> {
        if self.can_punch_hole {
            let offset = self.position;

            // Punching holes works only inside the file; grow it first
            // when zeroing past the end.
            let size = self.file_size()?;
            if offset + count > size {
                nix::unistd::ftruncate(self.fio()?, (offset + count) as i64)
                    .map_err(|err| Error::Io(err.into()))?;

                // Zeroing the end of the file needs no hole.
                if size == offset {
                    self.position = offset + count;
                    return Ok(count);
                }
            }

            let mode = FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE;
            if self.fallocate(mode, offset, count)? {
                self.position = offset + count;
                return Ok(count);
            }
            debug!("cannot punch hole");
            self.can_punch_hole = false;
        }

        self.write_zeroes(count)?;
        Ok(count)
    }

    /// Try fallocate(), returning false if the mode is not supported.
    fn fallocate(&self, mode: FallocateFlags, offset: u64, count: u64) -> Result<bool> {
        match nix::fcntl::fallocate(self.fio()?.as_raw_fd(), mode, offset as i64, count as i64) {
            Ok(()) => Ok(true),
            // RHEL 7 kernels fail with ENODEV on block devices.
            Err(Errno::EOPNOTSUPP | Errno::ENODEV) => Ok(false),
            Err(err) => Err(Error::Io(err.into())),
        }
    }

    /// Last resort, writing zeroes manually.
    fn write_zeroes(&mut self, count: u64) -> Result<()> {
        let buf = AlignedBuffer::new(count.min(MIB) as usize);
        let mut todo = count;
        while todo > 0 {
            let step = todo.min(buf.len() as u64) as usize;
            todo -= self.write_sync(&buf.as_slice()[..step])? as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn size(&mut self) -> Result<u64> {
        self.file_size()
    }

    fn block_size(&self) -> usize {
        self.block_size
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
            SeekFrom::End(n) => self.file_size()?.saturating_add_signed(n),
        };
        Ok(self.position)
    }

    async fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.pread(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable() {
            return Err(Error::unsupported("write on read-only backend"));
        }
        self.write_sync(buf)
    }

    async fn zero(&mut self, length: u64) -> Result<u64> {
        if !self.writable() {
            return Err(Error::unsupported("zero on read-only backend"));
        }
        self.zero_sync(length)
    }

    async fn flush(&mut self) -> Result<()> {
        self.fio()?.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    async fn zero_extents(&mut self) -> Result<Vec<ZeroExtent>> {
        // Without an image format probe the whole file is reported as
        // data.
        Ok(vec![ZeroExtent::new(0, self.file_size()?, false, false)])
    }

    async fn dirty_extents(&mut self) -> Result<Vec<DirtyExtent>> {
        Err(Error::unsupported(
            "backend file does not support dirty extents",
        ))
    }

    async fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        let options = Options {
            mode: self.mode,
            sparse: self.sparse,
            max_connections: self.max_connections,
            ..Options::default()
        };
        let mut backend = Self::open(&self.path, &options).await?;
        backend.block_size = self.block_size;
        backend.can_zero_range = self.can_zero_range;
        backend.can_punch_hole = self.can_punch_hole;
        backend.can_fallocate = self.can_fallocate;
        Ok(Box::new(backend))
    }

    async fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), dirty = self.dirty, "close");
        }
    }

    fn max_readers(&self) -> u32 {
        self.max_connections
    }

    fn max_writers(&self) -> u32 {
        // Zeroing and trimming a qcow2 image grows the file and assumes
        // a single writer. Block devices have no such constraint.
        if self.device { self.max_connections } else { 1 }
    }
}
