use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Result, SpeedError, TEST_FILE_NAME};

/// Raw byte channel a trial reads from or writes to.
///
/// Implementations are expected to be exclusive enough for benchmarking:
/// no other writer touches the underlying file while a trial runs.
pub trait ByteChannel: Send {
    /// Move to an absolute byte offset
    fn seek(&mut self, offset: u64) -> io::Result<u64>;

    /// Read up to `buf.len()` bytes at the current position
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer at the current position
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush buffered data; with `force` also push it to the device
    fn flush(&mut self, force: bool) -> io::Result<()>;

    /// Current length of the underlying storage
    fn len(&self) -> io::Result<u64>;

    fn position(&mut self) -> io::Result<u64>;

    /// Whether the OS file cache is bypassed for this handle
    fn bypasses_cache(&self) -> bool {
        false
    }
}

impl<C: ByteChannel + ?Sized> ByteChannel for Box<C> {
    fn seek(&mut self, offset: u64) -> io::Result<u64> {
        (**self).seek(offset)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write(buf)
    }

    fn flush(&mut self, force: bool) -> io::Result<()> {
        (**self).flush(force)
    }

    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }

    fn position(&mut self) -> io::Result<u64> {
        (**self).position()
    }

    fn bypasses_cache(&self) -> bool {
        (**self).bypasses_cache()
    }
}

/// File-backed byte channel, optionally bypassing the OS cache.
pub struct FileChannel {
    file: File,
    bypass: bool,
}

impl FileChannel {
    /// Open an existing file for reading
    pub fn open_read(path: &Path, bypass_cache: bool) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        Self::open(path, options, bypass_cache, false)
    }

    /// Open an existing file for writing without truncating it
    pub fn open_write(path: &Path, bypass_cache: bool) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true);
        Self::open(path, options, bypass_cache, true)
    }

    /// Create or truncate a plain buffered file for writing
    pub fn create_buffered(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            bypass: false,
        })
    }

    fn open(path: &Path, options: OpenOptions, bypass_cache: bool, write: bool) -> io::Result<Self> {
        if bypass_cache {
            match platform::open_uncached(path, &options, write) {
                Ok(file) => return Ok(Self { file, bypass: true }),
                Err(e) => {
                    tracing::warn!(
                        "Cache bypass unavailable for {}: {}; using buffered I/O",
                        path.display(),
                        e
                    );
                }
            }
        }

        let file = options.open(path)?;
        platform::advise_dont_need(&file);
        Ok(Self {
            file,
            bypass: false,
        })
    }
}

impl ByteChannel for FileChannel {
    fn seek(&mut self, offset: u64) -> io::Result<u64> {
        self.file.seek(SeekFrom::Start(offset))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn flush(&mut self, force: bool) -> io::Result<()> {
        self.file.flush()?;
        if force {
            self.file.sync_data()?;
            if !self.bypass {
                platform::advise_dont_need(&self.file);
            }
        }
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    fn bypasses_cache(&self) -> bool {
        self.bypass
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    pub fn open_uncached(path: &Path, options: &OpenOptions, write: bool) -> io::Result<File> {
        let mut options = options.clone();
        let mut flags = libc::O_DIRECT;
        if write {
            flags |= libc::O_DSYNC;
        }
        options.custom_flags(flags).open(path)
    }

    /// Ask the kernel to drop cached pages of the whole file.
    pub fn advise_dont_need(file: &File) {
        let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
        if ret != 0 {
            tracing::debug!("posix_fadvise(DONTNEED) failed: {}", ret);
        }
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn open_uncached(path: &Path, options: &OpenOptions, _write: bool) -> io::Result<File> {
        let file = options.open(path)?;
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(file)
    }

    pub fn advise_dont_need(_file: &File) {}
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::os::windows::fs::OpenOptionsExt;

    const FILE_FLAG_WRITE_THROUGH: u32 = 0x80000000;
    const FILE_FLAG_NO_BUFFERING: u32 = 0x20000000;

    pub fn open_uncached(path: &Path, options: &OpenOptions, write: bool) -> io::Result<File> {
        let mut options = options.clone();
        let mut flags = FILE_FLAG_NO_BUFFERING;
        if write {
            flags |= FILE_FLAG_WRITE_THROUGH;
        }
        options.custom_flags(flags).open(path)
    }

    pub fn advise_dont_need(_file: &File) {}
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
mod platform {
    use super::*;

    pub fn open_uncached(_path: &Path, _options: &OpenOptions, _write: bool) -> io::Result<File> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "cache bypass not supported on this platform",
        ))
    }

    pub fn advise_dont_need(_file: &File) {}
}

/// Benchmark file on the volume under test, removed on drop.
///
/// Separate read and write handles are opened on demand because some
/// platforms reject unaligned I/O once cache bypass flags are set.
#[derive(Debug)]
pub struct TestFile {
    path: PathBuf,
    size: u64,
    bypass_cache: bool,
    cleanup_on_drop: bool,
}

impl TestFile {
    /// Create the benchmark file inside `dir`, preallocated to `size` bytes
    pub fn in_dir(dir: &Path, size: u64, bypass_cache: bool) -> Result<Self> {
        Self::create(dir.join(TEST_FILE_NAME), size, bypass_cache)
    }

    /// Create (or truncate) a file at `path`, preallocated to `size` bytes
    pub fn create(path: PathBuf, size: u64, bypass_cache: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                SpeedError::TempFileError(format!("cannot create {}: {}", path.display(), e))
            })?;
        file.set_len(size).map_err(|e| {
            SpeedError::TempFileError(format!("cannot size {}: {}", path.display(), e))
        })?;

        tracing::debug!("Created test file {} ({} bytes)", path.display(), size);
        Ok(Self {
            path,
            size,
            bypass_cache,
            cleanup_on_drop: true,
        })
    }

    pub fn read_channel(&self) -> io::Result<FileChannel> {
        FileChannel::open_read(&self.path, self.bypass_cache)
    }

    pub fn write_channel(&self) -> io::Result<FileChannel> {
        FileChannel::open_write(&self.path, self.bypass_cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Disable automatic removal (for debugging)
    pub fn keep_on_drop(&mut self) {
        self.cleanup_on_drop = false;
    }
}

impl Drop for TestFile {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_test_file_is_sized_and_removed() {
        let temp_dir = tempdir().unwrap();
        let test_file = TestFile::in_dir(temp_dir.path(), 64 * 1024, false).unwrap();
        let path = test_file.path().to_owned();

        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * 1024);

        drop(test_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_test_file_keep_on_drop() {
        let temp_dir = tempdir().unwrap();
        let mut test_file = TestFile::in_dir(temp_dir.path(), 4096, false).unwrap();
        test_file.keep_on_drop();

        let path = test_file.path().to_owned();
        drop(test_file);
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_buffered_channel_round_trip() {
        let temp_dir = tempdir().unwrap();
        let test_file = TestFile::in_dir(temp_dir.path(), 8192, false).unwrap();

        let mut writer = test_file.write_channel().unwrap();
        assert!(!writer.bypasses_cache());
        writer.seek(4096).unwrap();
        writer.write(&[0x5a; 4096]).unwrap();
        writer.flush(true).unwrap();
        assert_eq!(writer.position().unwrap(), 8192);
        assert_eq!(writer.len().unwrap(), 8192);

        let mut reader = test_file.read_channel().unwrap();
        let mut buf = vec![0u8; 4096];
        reader.seek(4096).unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 4096);
        assert!(buf.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn test_create_in_missing_dir_fails() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("missing");
        let result = TestFile::in_dir(&missing, 4096, false);
        assert!(matches!(result, Err(SpeedError::TempFileError(_))));
    }
}
