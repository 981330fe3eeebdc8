//! Named POSIX shared memory segments
//!
//! A segment is a fixed-capacity region identified by a plain name. The OS
//! object is `/<name>` under `/dev/shm`, so any process (in any language) that
//! calls `shm_open("/<name>")` rendezvouses with the same bytes.
//!
//! Segments do not unlink themselves on drop. On Linux a POSIX shm object
//! persists until it is unlinked, so teardown of the name is left to whoever
//! tracks the last holder (see [`crate::map`]).

use crate::error::{MapError, Result};
use crate::lock::HOLDERS_SUFFIX;
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ptr::NonNull;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Longest OS object name, excluding the leading '/'
const NAME_MAX: usize = 255;

/// Longest map name accepted, leaving room for the longest companion suffix
pub const MAX_NAME_LEN: usize = NAME_MAX - HOLDERS_SUFFIX.len();

/// How long an opener waits for a concurrent creator to size a fresh object
const SIZE_WAIT: Duration = Duration::from_millis(100);

/// Handle to a mapped shared memory segment
pub struct NamedSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    capacity: usize,
    name: String,
}

// SAFETY: the mapping is plain shared bytes; callers serialize access to it
// through the named lock.
unsafe impl Send for NamedSegment {}
unsafe impl Sync for NamedSegment {}

/// Validate a user-facing name and return the OS object name
pub(crate) fn os_name(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(MapError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if name.contains('/') || name.contains('\0') {
        return Err(MapError::InvalidName {
            name: name.to_string(),
            reason: "name may not contain '/' or NUL",
        });
    }
    if name.len() > NAME_MAX {
        return Err(MapError::NameTooLong {
            max: NAME_MAX,
            got: name.len(),
        });
    }
    Ok(format!("/{}", name))
}

/// Unlink an object this call created but could not set up
fn discard_created(name: &str, os: &str) {
    if let Err(e) = shm_unlink(os) {
        warn!(name, error = %e, "failed to remove half-created segment");
    }
}

fn shm_mode() -> Mode {
    Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH
}

impl NamedSegment {
    /// Open the segment called `name`, creating it with `capacity` bytes if it
    /// does not exist yet
    ///
    /// When the segment already exists the requested capacity is ignored and
    /// the existing size is used. The returned flag is `true` if this call
    /// created the OS object.
    pub fn open_or_create(name: &str, capacity: usize) -> Result<(Self, bool)> {
        let os = os_name(name)?;

        loop {
            match shm_open(
                os.as_str(),
                ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
                shm_mode(),
            ) {
                Ok(fd) => {
                    if let Err(e) = ftruncate(&fd, capacity as u64) {
                        discard_created(name, &os);
                        return Err(MapError::segment(name, e));
                    }
                    let segment = Self::map(name, fd, capacity)
                        .inspect_err(|_| discard_created(name, &os))?;
                    debug!(name, capacity, "created shared memory segment");
                    return Ok((segment, true));
                }
                Err(Errno::EXIST) => match Self::open(name) {
                    Ok(segment) => return Ok((segment, false)),
                    // Unlinked between our two calls; try to create again
                    Err(MapError::Segment { source, .. })
                        if source.raw_os_error() == Some(Errno::NOENT.raw_os_error()) =>
                    {
                        trace!(name, "segment vanished while opening, retrying");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(MapError::segment(name, e)),
            }
        }
    }

    /// Open an existing segment; its capacity is whatever the creator committed
    pub fn open(name: &str) -> Result<Self> {
        let os = os_name(name)?;
        let fd = shm_open(os.as_str(), ShmOFlags::RDWR, Mode::empty())
            .map_err(|e| MapError::segment(name, e))?;

        // A creator in another process may not have called ftruncate yet
        let started = Instant::now();
        let capacity = loop {
            let stat = fstat(&fd).map_err(|e| MapError::segment(name, e))?;
            if stat.st_size > 0 {
                break stat.st_size as usize;
            }
            if started.elapsed() >= SIZE_WAIT {
                return Err(MapError::segment(
                    name,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "segment has zero size"),
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let segment = Self::map(name, fd, capacity)?;
        debug!(name, capacity, "opened existing shared memory segment");
        Ok(segment)
    }

    fn map(name: &str, fd: OwnedFd, capacity: usize) -> Result<Self> {
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                capacity,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| MapError::segment(name, e))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            MapError::segment(
                name,
                std::io::Error::new(std::io::ErrorKind::Other, "mmap returned null"),
            )
        })?;

        Ok(Self {
            fd,
            addr,
            capacity,
            name: name.to_string(),
        })
    }

    /// Remove the OS name. Existing mappings stay valid until dropped.
    ///
    /// Returns `false` if no object with that name existed.
    pub fn unlink(name: &str) -> Result<bool> {
        let os = os_name(name)?;
        match shm_unlink(os.as_str()) {
            Ok(()) => {
                debug!(name, "unlinked shared memory segment");
                Ok(true)
            }
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(MapError::segment(name, e)),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(MapError::OutOfRange {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }

    /// Copy `len` bytes starting at `offset` out of the segment
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from the segment starting at `offset`
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.addr.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Write all of `data` at `offset`, or nothing if it does not fit
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Size of the mapped region in bytes
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Name the segment was opened with
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSegment {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.addr.as_ptr().cast(), self.capacity) } {
            warn!(name = %self.name, error = %e, "failed to unmap shared memory segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::unique_name;

    #[test]
    fn test_create_and_open() {
        let name = unique_name("seg_create");

        let (seg1, created) = NamedSegment::open_or_create(&name, 4096).unwrap();
        assert!(created);
        assert_eq!(seg1.capacity(), 4096);

        seg1.write(0, &[42u8]).unwrap();

        // Second open sees the existing object and ignores the requested size
        let (seg2, created) = NamedSegment::open_or_create(&name, 64).unwrap();
        assert!(!created);
        assert_eq!(seg2.capacity(), 4096);
        assert_eq!(seg2.read(0, 1).unwrap(), vec![42u8]);

        drop(seg2);
        drop(seg1);
        assert!(NamedSegment::unlink(&name).unwrap());
        assert!(!NamedSegment::unlink(&name).unwrap());
    }

    #[test]
    fn test_bounds_checked() {
        let name = unique_name("seg_bounds");
        let (seg, _) = NamedSegment::open_or_create(&name, 16).unwrap();

        seg.write(12, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            seg.write(13, &[1, 2, 3, 4]),
            Err(MapError::OutOfRange { offset: 13, len: 4, capacity: 16 })
        ));
        assert!(matches!(
            seg.read(usize::MAX, 2),
            Err(MapError::OutOfRange { .. })
        ));
        // Failed write left the previous bytes alone
        assert_eq!(seg.read(12, 4).unwrap(), vec![1, 2, 3, 4]);

        NamedSegment::unlink(&name).unwrap();
    }

    #[test]
    fn test_open_missing_fails() {
        let name = unique_name("seg_missing");
        assert!(matches!(
            NamedSegment::open(&name),
            Err(MapError::Segment { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(os_name(""), Err(MapError::InvalidName { .. })));
        assert!(matches!(os_name("a/b"), Err(MapError::InvalidName { .. })));
        let long = "x".repeat(300);
        assert!(matches!(os_name(&long), Err(MapError::NameTooLong { .. })));
        assert_eq!(os_name("melshare").unwrap(), "/melshare");
    }
}
