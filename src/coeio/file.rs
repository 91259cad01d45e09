//! Fiber-friendly file operations.
//!
//! Thin wrappers running the blocking syscall on the offload pool via
//! [`call`](super::call), with the calling fiber parked until completion.
//! Each wrapper evaluates `errno` on the worker thread, so the OS error is
//! preserved across the hand-off.
//!
//! Buffer-taking operations are sound to run against borrowed memory: the
//! wait is non-cancellable and has no deadline, so the fiber cannot resume
//! before the worker is done with the pointer.

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::clock::INFINITY;
use crate::error::{Error, Result};

use super::call;

/// A raw pointer blessed for the trip to a worker thread. The worker is
/// the only one touching it while the owning fiber is parked.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

fn cpath(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::IllegalParams("path contains a nul byte".into()))
}

fn check_rc(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn offload<R: Send + 'static>(func: impl FnOnce() -> io::Result<R> + Send + 'static) -> Result<R> {
    call(func, INFINITY)?.map_err(Error::System)
}

pub fn open(path: impl AsRef<Path>, flags: libc::c_int, mode: libc::mode_t) -> Result<RawFd> {
    let path = cpath(path.as_ref())?;
    offload(move || {
        let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    })
}

pub fn close(fd: RawFd) -> Result<()> {
    offload(move || check_rc(unsafe { libc::close(fd) }))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let ptr = SendPtr(buf.as_mut_ptr());
    let len = buf.len();
    offload(move || {
        let ptr = ptr;
        let n = unsafe { libc::read(fd, ptr.0 as *mut libc::c_void, len) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let ptr = SendPtr(buf.as_ptr() as *mut u8);
    let len = buf.len();
    offload(move || {
        let ptr = ptr;
        let n = unsafe { libc::write(fd, ptr.0 as *const libc::c_void, len) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

pub fn lseek(fd: RawFd, offset: i64, whence: libc::c_int) -> Result<u64> {
    offload(move || {
        let pos = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
        if pos < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(pos as u64)
        }
    })
}

fn stat_with(
    f: impl FnOnce(*mut libc::stat) -> libc::c_int + Send + 'static,
) -> Result<libc::stat> {
    offload(move || {
        let mut st = MaybeUninit::<libc::stat>::uninit();
        check_rc(f(st.as_mut_ptr()))?;
        Ok(unsafe { st.assume_init() })
    })
}

pub fn stat(path: impl AsRef<Path>) -> Result<libc::stat> {
    let path = cpath(path.as_ref())?;
    stat_with(move |st| unsafe { libc::stat(path.as_ptr(), st) })
}

pub fn fstat(fd: RawFd) -> Result<libc::stat> {
    stat_with(move |st| unsafe { libc::fstat(fd, st) })
}

pub fn lstat(path: impl AsRef<Path>) -> Result<libc::stat> {
    let path = cpath(path.as_ref())?;
    stat_with(move |st| unsafe { libc::lstat(path.as_ptr(), st) })
}

pub fn rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let from = cpath(from.as_ref())?;
    let to = cpath(to.as_ref())?;
    offload(move || check_rc(unsafe { libc::rename(from.as_ptr(), to.as_ptr()) }))
}

pub fn unlink(path: impl AsRef<Path>) -> Result<()> {
    let path = cpath(path.as_ref())?;
    offload(move || check_rc(unsafe { libc::unlink(path.as_ptr()) }))
}

pub fn truncate(path: impl AsRef<Path>, len: u64) -> Result<()> {
    let path = cpath(path.as_ref())?;
    offload(move || check_rc(unsafe { libc::truncate(path.as_ptr(), len as libc::off_t) }))
}

pub fn ftruncate(fd: RawFd, len: u64) -> Result<()> {
    offload(move || check_rc(unsafe { libc::ftruncate(fd, len as libc::off_t) }))
}

pub fn chown(path: impl AsRef<Path>, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    let path = cpath(path.as_ref())?;
    offload(move || check_rc(unsafe { libc::chown(path.as_ptr(), uid, gid) }))
}

pub fn chmod(path: impl AsRef<Path>, mode: libc::mode_t) -> Result<()> {
    let path = cpath(path.as_ref())?;
    offload(move || check_rc(unsafe { libc::chmod(path.as_ptr(), mode) }))
}

pub fn mkdir(path: impl AsRef<Path>, mode: libc::mode_t) -> Result<()> {
    let path = cpath(path.as_ref())?;
    offload(move || check_rc(unsafe { libc::mkdir(path.as_ptr(), mode) }))
}

pub fn rmdir(path: impl AsRef<Path>) -> Result<()> {
    let path = cpath(path.as_ref())?;
    offload(move || check_rc(unsafe { libc::rmdir(path.as_ptr()) }))
}

pub fn link(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = cpath(src.as_ref())?;
    let dst = cpath(dst.as_ref())?;
    offload(move || check_rc(unsafe { libc::link(src.as_ptr(), dst.as_ptr()) }))
}

pub fn symlink(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = cpath(src.as_ref())?;
    let dst = cpath(dst.as_ref())?;
    offload(move || check_rc(unsafe { libc::symlink(src.as_ptr(), dst.as_ptr()) }))
}

pub fn readlink(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = cpath(path.as_ref())?;
    offload(move || {
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        let n = unsafe {
            libc::readlink(path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(n as usize);
        Ok(PathBuf::from(std::ffi::OsString::from_vec(buf)))
    })
}

/// Create a unique directory from a template ending in `XXXXXX`.
pub fn mkdtemp(template: impl AsRef<Path>) -> Result<PathBuf> {
    let template = cpath(template.as_ref())?;
    offload(move || {
        let mut bytes = template.into_bytes_with_nul();
        let ptr = bytes.as_mut_ptr() as *mut libc::c_char;
        if unsafe { libc::mkdtemp(ptr) }.is_null() {
            return Err(io::Error::last_os_error());
        }
        bytes.pop(); // trailing nul
        Ok(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
    })
}

pub fn sync() -> Result<()> {
    offload(move || {
        unsafe { libc::sync() };
        Ok(())
    })
}

pub fn fsync(fd: RawFd) -> Result<()> {
    offload(move || check_rc(unsafe { libc::fsync(fd) }))
}

pub fn fdatasync(fd: RawFd) -> Result<()> {
    #[cfg(target_os = "macos")]
    return fsync(fd);
    #[cfg(not(target_os = "macos"))]
    offload(move || check_rc(unsafe { libc::fdatasync(fd) }))
}

/// Expand a shell glob pattern into the matching paths, sorted.
pub fn glob(pattern: impl AsRef<OsStr>) -> Result<Vec<PathBuf>> {
    let pattern = CString::new(pattern.as_ref().as_bytes())
        .map_err(|_| Error::IllegalParams("glob pattern contains a nul byte".into()))?;
    offload(move || {
        let mut g = MaybeUninit::<libc::glob_t>::zeroed();
        let rc = unsafe { libc::glob(pattern.as_ptr(), 0, None, g.as_mut_ptr()) };
        let mut g = unsafe { g.assume_init() };
        let result = match rc {
            0 => {
                let mut out = Vec::with_capacity(g.gl_pathc as usize);
                for i in 0..g.gl_pathc as isize {
                    let entry = unsafe { *g.gl_pathv.offset(i) };
                    if entry.is_null() {
                        continue;
                    }
                    let bytes = unsafe { CStr::from_ptr(entry) }.to_bytes().to_vec();
                    out.push(PathBuf::from(std::ffi::OsString::from_vec(bytes)));
                }
                Ok(out)
            }
            libc::GLOB_NOMATCH => Ok(Vec::new()),
            libc::GLOB_NOSPACE => Err(io::Error::from_raw_os_error(libc::ENOMEM)),
            _ => Err(io::Error::new(io::ErrorKind::Other, "glob failed")),
        };
        unsafe { libc::globfree(&mut g) };
        result
    })
}
