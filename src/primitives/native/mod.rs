#![allow(unsafe_code)]

use std::sync::Arc;

use tracing::warn;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::Result;

/// OS-level file hints used when rotating logs.
///
/// None of these calls are required for correctness; callers log failures
/// and carry on.
pub trait NativeAccess: Send + Sync + 'static {
    /// Returns true when the hints reach the operating system.
    fn is_available(&self) -> bool;
    /// Drops the file's pages from the OS cache.
    fn evict_from_cache(&self, file: &StdFileIo) -> Result<()>;
    /// Hints that the file will be read sequentially.
    fn advise_sequential_access(&self, file: &StdFileIo) -> Result<()>;
    /// Reserves `len` bytes of disk space for the file.
    fn preallocate(&self, file: &StdFileIo, len: u64) -> Result<()>;
}

/// Implementation that does nothing; used where hints are unsupported and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNativeAccess;

impl NativeAccess for NoopNativeAccess {
    fn is_available(&self) -> bool {
        false
    }

    fn evict_from_cache(&self, _file: &StdFileIo) -> Result<()> {
        Ok(())
    }

    fn advise_sequential_access(&self, _file: &StdFileIo) -> Result<()> {
        Ok(())
    }

    fn preallocate(&self, _file: &StdFileIo, _len: u64) -> Result<()> {
        Ok(())
    }
}

/// `posix_fadvise` / `posix_fallocate` hints on Linux.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxNativeAccess;

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::os::unix::io::AsRawFd;

    use super::LinuxNativeAccess;
    use super::NativeAccess;
    use crate::primitives::io::StdFileIo;
    use crate::types::{Result, SombraError};

    fn check(rc: libc::c_int) -> Result<()> {
        // posix_fadvise and posix_fallocate return the error number directly.
        if rc == 0 {
            Ok(())
        } else {
            Err(SombraError::Io(io::Error::from_raw_os_error(rc)))
        }
    }

    fn to_off(len: u64) -> Result<libc::off_t> {
        libc::off_t::try_from(len).map_err(|_| SombraError::Invalid("length exceeds off_t"))
    }

    impl NativeAccess for LinuxNativeAccess {
        fn is_available(&self) -> bool {
            true
        }

        fn evict_from_cache(&self, file: &StdFileIo) -> Result<()> {
            let fd = file.file().as_raw_fd();
            // SAFETY: fd is owned by `file`, which outlives this call.
            let rc = unsafe { libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_DONTNEED) };
            check(rc)
        }

        fn advise_sequential_access(&self, file: &StdFileIo) -> Result<()> {
            let fd = file.file().as_raw_fd();
            // SAFETY: fd is owned by `file`, which outlives this call.
            let rc = unsafe { libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL) };
            check(rc)
        }

        fn preallocate(&self, file: &StdFileIo, len: u64) -> Result<()> {
            let fd = file.file().as_raw_fd();
            let len = to_off(len)?;
            // SAFETY: fd is owned by `file`, which outlives this call.
            let rc = unsafe { libc::posix_fallocate(fd, 0, len) };
            check(rc)
        }
    }
}

/// Returns the best native access implementation for this platform.
pub fn platform_native_access() -> Arc<dyn NativeAccess> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxNativeAccess)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NoopNativeAccess)
    }
}

/// Reserves `len` bytes for `file`, falling back to a sparse `set_len`
/// when the native call is unavailable or fails.
pub(crate) fn preallocate_or_extend(
    native: &dyn NativeAccess,
    file: &StdFileIo,
    len: u64,
) -> Result<()> {
    if native.is_available() {
        match native.preallocate(file, len) {
            Ok(()) => return Ok(()),
            Err(err) => warn!(
                path = %file.path().display(),
                len,
                error = %err,
                "native.preallocate_failed"
            ),
        }
    }
    if file.len()? < len {
        file.truncate(len)?;
    }
    Ok(())
}

pub(crate) fn evict_quietly(native: &dyn NativeAccess, file: &StdFileIo) {
    if let Err(err) = native.evict_from_cache(file) {
        warn!(path = %file.path().display(), error = %err, "native.evict_failed");
    }
}

pub(crate) fn advise_quietly(native: &dyn NativeAccess, file: &StdFileIo) {
    if let Err(err) = native.advise_sequential_access(file) {
        warn!(path = %file.path().display(), error = %err, "native.advise_failed");
    }
}
