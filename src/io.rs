//! File layer: positional I/O over regular files, and memory-mapped files
//! for the headers that are mutated in place.
//!
//! Two implementations back the [`BackingFile`] capability: [`CacheFile`]
//! for plain files (external entry files, long-key files) and [`MappedFile`]
//! for files whose leading bytes are kept resident and written back by the
//! OS (the index and the block files).

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

/// Positional read/write access to a backing file.
pub trait BackingFile {
    /// Reads exactly `buf.len()` bytes at `offset`.
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Writes all of `buf` at `offset`.
    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn set_length(&self, len: u64) -> io::Result<()>;

    fn get_length(&self) -> io::Result<u64>;
}

/// Builds a set of `OpenOptions` for opening a file as readable/writable,
/// creating it if it does not already exist.
///
/// When `create_atomic` is set, the open only succeeds if this call is the
/// one that creates the file, so another process (or a leftover file from a
/// previous run) cannot be adopted silently.
fn create_writable_file_options(create_atomic: bool) -> OpenOptions {
    let mut open_options = OpenOptions::new();
    open_options.read(true).write(true);
    if create_atomic {
        open_options.create_new(true);
    } else {
        open_options.create(true);
    }
    open_options
}

fn open_writable_file_options() -> OpenOptions {
    let mut open_options = OpenOptions::new();
    open_options.read(true).write(true);
    open_options
}

/// A plain file with positional I/O, shareable across handles.
#[derive(Clone, Debug)]
pub struct CacheFile {
    file: Arc<File>,
}

impl CacheFile {
    /// Opens an existing file for reading and writing.
    pub fn open(path: &Path) -> io::Result<CacheFile> {
        let file = open_writable_file_options().open(path)?;
        Ok(CacheFile {
            file: Arc::new(file),
        })
    }

    /// Opens a file for reading and writing, creating it if missing.
    pub fn open_or_create(path: &Path) -> io::Result<CacheFile> {
        let file = create_writable_file_options(false).open(path)?;
        Ok(CacheFile {
            file: Arc::new(file),
        })
    }

    /// Creates a file that must not already exist.
    pub fn create_exclusive(path: &Path) -> io::Result<CacheFile> {
        let file = create_writable_file_options(true).open(path)?;
        Ok(CacheFile {
            file: Arc::new(file),
        })
    }
}

impl BackingFile for CacheFile {
    #[cfg(unix)]
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(windows)]
    fn read(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let read = self.file.seek_read(buf, offset)?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            buf = &mut buf[read..];
            offset += read as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let written = self.file.seek_write(buf, offset)?;
            buf = &buf[written..];
            offset += written as u64;
        }
        Ok(())
    }

    fn set_length(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn get_length(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// A file whose first `mapped_len` bytes are memory mapped read-write.
///
/// Callers mutate the mapped prefix in place and rely on OS write-back for
/// persistence; [`MappedFile::flush`] forces the prefix to storage on a
/// best-effort basis. I/O past the prefix goes through positional file I/O.
#[derive(Debug)]
pub struct MappedFile {
    file: CacheFile,
    map: memmap2::MmapMut,
}

impl MappedFile {
    /// Opens `path` and maps its first `mapped_len` bytes, or the whole file
    /// when `mapped_len` is 0. The file must already be at least that long.
    pub fn open(path: &Path, mapped_len: usize) -> io::Result<MappedFile> {
        let file = CacheFile::open(path)?;
        let file_len = file.get_length()?;
        let mapped_len = if mapped_len == 0 {
            file_len as usize
        } else {
            mapped_len
        };
        if (file_len as usize) < mapped_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file too small to map: {} < {}", file_len, mapped_len),
            ));
        }
        let map = unsafe {
            memmap2::MmapOptions::new()
                .len(mapped_len)
                .map_mut(&*file.file)?
        };
        Ok(MappedFile { file, map })
    }

    pub fn buffer(&self) -> &[u8] {
        &self.map
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn mapped_len(&self) -> usize {
        self.map.len()
    }

    /// Forces the mapped prefix to storage.
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}

impl BackingFile for MappedFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let end = offset as usize + buf.len();
        if end <= self.map.len() {
            buf.copy_from_slice(&self.map[offset as usize..end]);
            return Ok(());
        }
        self.file.read(buf, offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        // The mapped prefix cannot be written through `&self`; header
        // mutations go through `buffer_mut` instead.
        debug_assert!(offset as usize >= self.map.len());
        self.file.write(buf, offset)
    }

    fn set_length(&self, len: u64) -> io::Result<()> {
        debug_assert!(len as usize >= self.map.len());
        self.file.set_length(len)
    }

    fn get_length(&self) -> io::Result<u64> {
        self.file.get_length()
    }
}

/// Deletes a cache file, logging failures.
pub fn delete_cache_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(error) => {
            error!(path = %path.display(), %error, "Failed to delete cache file.");
            false
        }
    }
}

/// Tracks operations in flight between the foreground and background.
///
/// Tests wait for the counter to drain before tearing a backend down;
/// production shutdown just drops whatever is pending.
#[derive(Debug, Default)]
pub struct PendingOps {
    count: Mutex<usize>,
    zero: Condvar,
}

impl PendingOps {
    pub fn increment(&self) {
        *self.count.lock() += 1;
    }

    pub fn decrement(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until no operations remain in flight, or the timeout expires.
    pub fn wait_for_zero(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        !self
            .zero
            .wait_while_for(&mut count, |count| *count != 0, timeout)
            .timed_out()
    }
}
