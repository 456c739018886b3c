//! Unbuffered file I/O with alignment guarantees, plus asynchronous
//! positional reads and writes that delegate the actual kernel call to the
//! blocking pool and deliver the completion on the submitting worker.
//!
//! ## Alignment Contract
//! - In direct mode, offsets, buffer lengths, and buffer pointers must be
//!   multiples of [`DirectFile::alignment`].
//! - The file trusts the caller and rejects misaligned operations instead
//!   of copying buffers.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::warn;

use crate::worker::WorkerContext;
use crate::{RuntimeError, RuntimeResult};

const FALLBACK_ALIGNMENT: usize = 4096;

/// Heap allocation that maintains sector-sized alignment for direct I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// Exclusive ownership of the allocation; the raw pointer never aliases.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn zeroed(len: usize, alignment: usize) -> RuntimeResult<Self> {
        if len == 0 {
            return Err(RuntimeError::invalid_config(
                "aligned buffer length must be non-zero",
            ));
        }
        let layout = Layout::from_size_align(len, alignment)
            .map_err(|_| RuntimeError::invalid_config("invalid aligned buffer layout"))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            RuntimeError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate aligned buffer",
            ))
        })?;
        Ok(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("alignment", &self.alignment())
            .finish()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

/// How a [`DirectFile`] is opened.
#[derive(Debug, Clone, Copy)]
pub struct DirectFileOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    /// Ask for unbuffered I/O (`O_DIRECT` on Linux, `F_NOCACHE` on macOS).
    /// Falls back to buffered I/O where the filesystem refuses.
    pub direct: bool,
    /// Open with `O_DSYNC` so every write reaches stable storage before the
    /// kernel call returns.
    pub sync_writes: bool,
}

impl DirectFileOptions {
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            direct: true,
            sync_writes: true,
        }
    }

    /// Buffered variant for filesystems and tests where `O_DIRECT` is
    /// unavailable; writes still sync through `O_DSYNC`.
    pub fn buffered() -> Self {
        Self {
            direct: false,
            ..Self::read_write()
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            direct: true,
            sync_writes: false,
        }
    }
}

/// Positional-I/O file handle. Cloning is cheap and shares the descriptor.
#[derive(Clone)]
pub struct DirectFile {
    file: Arc<File>,
    alignment: usize,
    direct: bool,
}

impl DirectFile {
    pub fn open(path: &Path, options: DirectFileOptions) -> RuntimeResult<Self> {
        let (file, direct) = match open_with_flags(path, &options, options.direct) {
            Ok(file) => (file, options.direct),
            Err(err) if options.direct && err.raw_os_error() == Some(libc::EINVAL) => {
                warn!(
                    path = %path.display(),
                    "filesystem refused unbuffered I/O, falling back to buffered"
                );
                (open_with_flags(path, &options, false)?, false)
            }
            Err(err) => return Err(err.into()),
        };
        if direct {
            configure_after_open(&file)?;
        }
        Ok(Self {
            file: Arc::new(file),
            alignment: platform_alignment().unwrap_or(FALLBACK_ALIGNMENT),
            direct,
        })
    }

    /// Alignment used for scratch buffers. Offset and length checks only
    /// apply when the file actually runs unbuffered.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Zeroed scratch space satisfying this file's alignment requirements.
    pub fn allocate(&self, len: usize) -> RuntimeResult<AlignedBuf> {
        AlignedBuf::zeroed(len, self.alignment)
    }

    pub fn file_size(&self) -> RuntimeResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Grow the file to at least `size` bytes (never shrinks). New bytes
    /// read back as zero.
    pub fn ensure_size(&self, size: u64) -> RuntimeResult<()> {
        if self.file_size()? < size {
            self.file.set_len(size)?;
        }
        Ok(())
    }

    fn check_aligned(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if !self.direct {
            return Ok(());
        }
        let alignment = self.alignment as u64;
        if offset % alignment != 0
            || buf.len() % self.alignment != 0
            || buf.as_ptr() as usize % self.alignment != 0
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "unbuffered I/O requires {}-byte alignment (offset {offset}, len {})",
                    self.alignment,
                    buf.len()
                ),
            ));
        }
        Ok(())
    }

    /// Fill `buf` from `offset`. Short reads are retried; reading past the
    /// end of the file is an error.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_aligned(offset, buf)?;
        self.file.read_exact_at(buf, offset)
    }

    /// Write all of `buf` at `offset`. With `sync_writes` the data is on
    /// stable storage when this returns.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.check_aligned(offset, buf)?;
        self.file.write_all_at(buf, offset)
    }

    pub fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Asynchronous read: fills the whole buffer from `offset` on a
    /// blocking-pool helper and hands it back through `completion` on the
    /// submitting worker. The buffer travels with the operation, so it is
    /// held exclusively while the I/O is in flight.
    pub fn read_async(
        &self,
        ctx: &mut WorkerContext,
        offset: u64,
        mut buf: AlignedBuf,
        completion: impl FnOnce(&mut WorkerContext, io::Result<AlignedBuf>) + Send + 'static,
    ) -> RuntimeResult<()> {
        let file = self.clone();
        ctx.submit_blocking(
            move || file.read_at(offset, buf.as_mut_slice()).map(|()| buf),
            completion,
        )
    }

    /// Asynchronous write of the whole buffer at `offset`; same delivery
    /// contract as [`DirectFile::read_async`].
    pub fn write_async(
        &self,
        ctx: &mut WorkerContext,
        offset: u64,
        buf: AlignedBuf,
        completion: impl FnOnce(&mut WorkerContext, io::Result<AlignedBuf>) + Send + 'static,
    ) -> RuntimeResult<()> {
        let file = self.clone();
        ctx.submit_blocking(
            move || file.write_at(offset, buf.as_slice()).map(|()| buf),
            completion,
        )
    }
}

impl fmt::Debug for DirectFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectFile")
            .field("alignment", &self.alignment)
            .field("direct", &self.direct)
            .finish()
    }
}

fn open_with_flags(path: &Path, options: &DirectFileOptions, direct: bool) -> io::Result<File> {
    let mut std_options = OpenOptions::new();
    std_options
        .read(options.read)
        .write(options.write)
        .create(options.create && options.write);

    let mut flags = 0;
    #[cfg(target_os = "linux")]
    if direct {
        flags |= libc::O_DIRECT;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = direct;
    if options.write && options.sync_writes {
        flags |= libc::O_DSYNC;
    }
    if flags != 0 {
        std_options.custom_flags(flags);
    }
    std_options.mode(0o644);
    std_options.open(path)
}

#[cfg(target_os = "macos")]
fn configure_after_open(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn configure_after_open(_file: &File) -> io::Result<()> {
    Ok(())
}

fn platform_alignment() -> Option<usize> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        Some(page_size as usize)
    } else {
        None
    }
}
