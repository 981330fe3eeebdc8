//! Named cross-process lock
//!
//! Each map `<name>` is guarded by a process-shared pthread mutex stored at
//! offset 0 of its own shared memory object `<name>_mutex`. The object holds
//! nothing but the mutex, so any process that derives the same name and maps
//! a `pthread_mutex_t` from it takes part in the same locking.
//!
//! Mutexes created here are also robust and error-checking. Mutexes created
//! by other peers are used as they are.
//!
//! Bookkeeping lives in a companion object `<name>_holders`:
//!
//! ```text
//! offset 0 : u32 state (0 = uninit, 1 = ready, 2 = retired, 3 = initializing)
//! offset 4 : u32 holder count
//! offset 8 : u32 foreign (1 if the mutex existed before the companion)
//! ```
//!
//! Whoever moves the state from uninit to initializing opens (or creates and
//! initializes) the mutex and then publishes ready. The holder count and the
//! retired state are only touched while the mutex is held. A retired
//! companion has been unlinked by its last holder; late openers that still
//! reach it must start over.
//!
//! Lock deadlines are `CLOCK_REALTIME` because that is what
//! `pthread_mutex_timedlock` takes. A forward clock step cannot cut a wait
//! short, the remaining time is re-armed against a monotonic clock. A
//! backward step during a wait can still stretch it.

use crate::error::{MapError, Result};
use crate::shm::{NamedSegment, MAX_NAME_LEN};
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Fixed suffix appended to a map name to form its lock name
pub const LOCK_SUFFIX: &str = "_mutex";

/// Suffix of the companion object that counts holders
pub const HOLDERS_SUFFIX: &str = "_holders";

/// How long an opener waits for another opener to set up the mutex
const INIT_WAIT: Duration = Duration::from_millis(100);

/// Attempts to reach a companion object that is not being torn down
const OPEN_ATTEMPTS: u64 = 8;

mod lock_state {
    pub const UNINIT: u32 = 0;
    pub const READY: u32 = 1;
    pub const RETIRED: u32 = 2;
    pub const INITIALIZING: u32 = 3;
}

#[repr(C)]
struct Accounting {
    state: AtomicU32,
    holders: AtomicU32,
    foreign: AtomicU32,
}

/// Smallest object that can hold the mutex
pub const MUTEX_SIZE: usize = size_of::<libc::pthread_mutex_t>();

/// Derive the lock name for a map
pub fn lock_name(map_name: &str) -> Result<String> {
    companion_name(map_name, LOCK_SUFFIX)
}

/// Derive the holder accounting name for a map
pub fn holders_name(map_name: &str) -> Result<String> {
    companion_name(map_name, HOLDERS_SUFFIX)
}

fn companion_name(map_name: &str, suffix: &str) -> Result<String> {
    if map_name.len() > MAX_NAME_LEN {
        return Err(MapError::NameTooLong {
            max: MAX_NAME_LEN,
            got: map_name.len(),
        });
    }
    Ok(format!("{}{}", map_name, suffix))
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

fn is_not_found(err: &MapError) -> bool {
    matches!(
        err,
        MapError::Segment { source, .. } if source.raw_os_error() == Some(libc::ENOENT)
    )
}

/// Initialize a process-shared, robust, error-checking mutex in place
///
/// # Safety
/// `mutex` must point to writable memory that no other thread is using yet.
unsafe fn init_mutex(mutex: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
    let attr = attr.as_mut_ptr();

    let mut result = check(libc::pthread_mutexattr_setpshared(
        attr,
        libc::PTHREAD_PROCESS_SHARED,
    ));
    if result.is_ok() {
        result = check(libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST));
    }
    if result.is_ok() {
        result = check(libc::pthread_mutexattr_settype(attr, libc::PTHREAD_MUTEX_ERRORCHECK));
    }
    if result.is_ok() {
        result = check(libc::pthread_mutex_init(mutex, attr));
    }

    libc::pthread_mutexattr_destroy(attr);
    result
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now
fn deadline_after(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, now.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let now = unsafe { now.assume_init() };

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);

    Ok(libc::timespec {
        tv_sec: secs.min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

fn accounting_of(segment: &NamedSegment) -> &Accounting {
    // SAFETY: the mapping is page aligned and callers checked its size
    unsafe { &*segment.as_ptr().cast::<Accounting>() }
}

/// Handle to a named lock
pub struct NamedLock {
    mutex: NamedSegment,
    accounting: NamedSegment,
    name: String,
    foreign: bool,
}

impl NamedLock {
    /// Open the lock for `map_name`, creating and initializing it if needed
    pub fn open_or_create(map_name: &str) -> Result<Self> {
        Self::open_with(map_name, true)
    }

    /// Open the lock for `map_name` only if it already exists
    pub fn open_only(map_name: &str) -> Result<Self> {
        Self::open_with(map_name, false)
    }

    fn open_with(map_name: &str, create: bool) -> Result<Self> {
        let name = lock_name(map_name)?;
        let accounting_name = holders_name(map_name)?;

        for attempt in 0..OPEN_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(attempt));
            }
            if !create {
                // Fail before leaving a companion object behind
                NamedSegment::open(&name)?;
            }
            if let Some(lock) = Self::try_open(&name, &accounting_name, create)? {
                return Ok(lock);
            }
            trace!(name = %name, "lock object is being torn down, retrying");
        }

        Err(MapError::lock(
            &name,
            "open",
            io::Error::new(io::ErrorKind::Other, "lock object kept being retired"),
        ))
    }

    /// One pass over the companion; `None` means it was retired under us
    fn try_open(name: &str, accounting_name: &str, create: bool) -> Result<Option<Self>> {
        let (accounting, _) =
            NamedSegment::open_or_create(accounting_name, size_of::<Accounting>())?;
        if accounting.capacity() < size_of::<Accounting>() {
            return Err(MapError::lock(
                name,
                "open",
                io::Error::new(io::ErrorKind::InvalidData, "holder accounting object too small"),
            ));
        }
        let shared = accounting_of(&accounting);

        let elected = shared
            .state
            .compare_exchange(
                lock_state::UNINIT,
                lock_state::INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if elected {
            let (mutex, foreign) = match Self::setup_mutex(name, create) {
                Ok(opened) => opened,
                Err(e) => {
                    shared.state.store(lock_state::UNINIT, Ordering::Release);
                    return Err(e);
                }
            };
            shared.foreign.store(u32::from(foreign), Ordering::Relaxed);
            shared.state.store(lock_state::READY, Ordering::Release);
            debug!(name, foreign, "set up named lock");
            return Ok(Some(Self {
                mutex,
                accounting,
                name: name.to_string(),
                foreign,
            }));
        }

        if !wait_ready(name, shared)? {
            return Ok(None);
        }
        let mutex = match NamedSegment::open(name) {
            Ok(mutex) => mutex,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        check_mutex_size(name, &mutex)?;
        let foreign = shared.foreign.load(Ordering::Relaxed) != 0;
        debug!(name, foreign, "opened existing named lock");
        Ok(Some(Self {
            mutex,
            accounting,
            name: name.to_string(),
            foreign,
        }))
    }

    /// Open or create the mutex object; the flag is `true` if another peer made it
    fn setup_mutex(name: &str, create: bool) -> Result<(NamedSegment, bool)> {
        if !create {
            let mutex = NamedSegment::open(name)?;
            check_mutex_size(name, &mutex)?;
            return Ok((mutex, true));
        }

        let (mutex, created) = NamedSegment::open_or_create(name, MUTEX_SIZE)?;
        check_mutex_size(name, &mutex)?;
        if created {
            let ptr = mutex.as_ptr().cast::<libc::pthread_mutex_t>();
            // SAFETY: we created the object, nobody else locks it until the
            // companion publishes ready
            if let Err(e) = unsafe { init_mutex(ptr) } {
                if let Err(unlink) = NamedSegment::unlink(name) {
                    warn!(name, error = %unlink, "failed to remove uninitialized lock object");
                }
                return Err(MapError::lock(name, "initialize", e));
            }
        }
        Ok((mutex, !created))
    }

    /// Remove both the lock object and its companion
    pub fn unlink(map_name: &str) -> Result<bool> {
        let mutex = Self::unlink_mutex(map_name);
        let accounting = Self::unlink_accounting(map_name);
        Ok(mutex? | accounting?)
    }

    pub(crate) fn unlink_mutex(map_name: &str) -> Result<bool> {
        NamedSegment::unlink(&lock_name(map_name)?)
    }

    pub(crate) fn unlink_accounting(map_name: &str) -> Result<bool> {
        NamedSegment::unlink(&holders_name(map_name)?)
    }

    #[inline(always)]
    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.as_ptr().cast::<libc::pthread_mutex_t>()
    }

    #[inline(always)]
    fn shared(&self) -> &Accounting {
        accounting_of(&self.accounting)
    }

    /// Name of the lock object (`<map>_mutex`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if the mutex was created by a peer that keeps no holder count
    ///
    /// The map and mutex objects belong to that peer; the last holder here
    /// only removes the companion.
    pub fn is_foreign(&self) -> bool {
        self.foreign
    }

    /// Block until the lock is held or `timeout` elapses
    ///
    /// If the previous holder died while holding the lock, the lock is still
    /// granted and the returned guard reports [`LockGuard::was_abandoned`].
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard<'_>> {
        let started = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            let deadline =
                deadline_after(remaining).map_err(|e| MapError::lock(&self.name, "acquire", e))?;
            let rc = unsafe { libc::pthread_mutex_timedlock(self.mutex_ptr(), &deadline) };

            return match rc {
                0 => Ok(LockGuard::new(self, false)),
                libc::EOWNERDEAD => {
                    let rc = unsafe { libc::pthread_mutex_consistent(self.mutex_ptr()) };
                    if let Err(e) = check(rc) {
                        if let Err(release) = self.release() {
                            warn!(name = %self.name, error = %release, "failed to release unrecoverable lock");
                        }
                        return Err(MapError::lock(&self.name, "recover", e));
                    }
                    warn!(name = %self.name, "recovered lock abandoned by a terminated holder");
                    Ok(LockGuard::new(self, true))
                }
                libc::ETIMEDOUT if started.elapsed() < timeout => {
                    trace!(name = %self.name, "wall clock passed the deadline early, waiting out the rest");
                    continue;
                }
                libc::ETIMEDOUT => Err(MapError::LockTimeout {
                    name: self.name.clone(),
                    timeout_ms: timeout.as_millis(),
                }),
                rc => Err(MapError::lock(
                    &self.name,
                    "acquire",
                    io::Error::from_raw_os_error(rc),
                )),
            };
        }
    }

    /// Unlock; fails if the calling thread does not hold the lock
    pub fn release(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex_ptr()) };
        check(rc).map_err(|e| MapError::lock(&self.name, "release", e))
    }

    /// Whether the last holder has already torn this object down
    pub fn is_retired(&self, _guard: &LockGuard<'_>) -> bool {
        self.shared().state.load(Ordering::Acquire) == lock_state::RETIRED
    }

    /// Number of map handles currently attached across all processes
    pub fn holders(&self, _guard: &LockGuard<'_>) -> u32 {
        self.shared().holders.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, _guard: &LockGuard<'_>) -> u32 {
        self.shared().holders.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn detach(&self, _guard: &LockGuard<'_>) -> u32 {
        let holders = &self.shared().holders;
        let prev = holders.load(Ordering::Acquire);
        let next = prev.saturating_sub(1);
        holders.store(next, Ordering::Release);
        next
    }

    pub(crate) fn retire(&self, _guard: &LockGuard<'_>) {
        self.shared().state.store(lock_state::RETIRED, Ordering::Release);
    }
}

fn check_mutex_size(name: &str, mutex: &NamedSegment) -> Result<()> {
    if mutex.capacity() < MUTEX_SIZE {
        return Err(MapError::lock(
            name,
            "open",
            io::Error::new(io::ErrorKind::InvalidData, "lock object too small"),
        ));
    }
    Ok(())
}

/// Wait for the elected opener; `false` means start over
fn wait_ready(name: &str, shared: &Accounting) -> Result<bool> {
    let started = Instant::now();
    loop {
        match shared.state.load(Ordering::Acquire) {
            lock_state::READY => return Ok(true),
            lock_state::INITIALIZING => {}
            // Retired, or the elected opener gave up
            _ => return Ok(false),
        }
        if started.elapsed() >= INIT_WAIT {
            return Err(MapError::lock(
                name,
                "open",
                io::Error::new(io::ErrorKind::TimedOut, "lock was never initialized"),
            ));
        }
        std::thread::yield_now();
    }
}

/// Scoped ownership of a [`NamedLock`]; unlocks on drop
pub struct LockGuard<'a> {
    lock: &'a NamedLock,
    abandoned: bool,
    released: bool,
}

impl<'a> LockGuard<'a> {
    fn new(lock: &'a NamedLock, abandoned: bool) -> Self {
        Self {
            lock,
            abandoned,
            released: false,
        }
    }

    /// `true` if the previous holder terminated without releasing
    pub fn was_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Fail with [`MapError::LockAbandoned`] if the protected data may be torn
    pub fn ensure_consistent(&self) -> Result<()> {
        if self.abandoned {
            Err(MapError::LockAbandoned {
                name: self.lock.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Unlock now, reporting failure instead of swallowing it
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release() {
                warn!(name = %self.lock.name, error = %e, "failed to release lock on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{create_bare_mutex, unique_name};
    use std::sync::Arc;
    use std::thread;

    struct Cleanup(String);

    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = NamedLock::unlink(&self.0);
        }
    }

    #[test]
    fn test_lock_name_derivation() {
        assert_eq!(lock_name("melshare").unwrap(), "melshare_mutex");
        assert_eq!(holders_name("melshare").unwrap(), "melshare_holders");
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(lock_name(&long), Err(MapError::NameTooLong { .. })));
    }

    #[test]
    fn test_acquire_release() {
        let name = unique_name("lock_basic");
        let _cleanup = Cleanup(name.clone());

        let lock = NamedLock::open_or_create(&name).unwrap();
        let guard = lock.acquire(Duration::from_millis(50)).unwrap();
        assert!(!guard.was_abandoned());
        guard.ensure_consistent().unwrap();
        guard.release().unwrap();

        // Error-checking mutex: unlocking an unheld lock is reported
        assert!(matches!(lock.release(), Err(MapError::Lock { op: "release", .. })));
    }

    #[test]
    fn test_timeout_while_held_elsewhere() {
        let name = unique_name("lock_timeout");
        let _cleanup = Cleanup(name.clone());

        let lock = Arc::new(NamedLock::open_or_create(&name).unwrap());
        let other = NamedLock::open_or_create(&name).unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.acquire(Duration::from_secs(1)).unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };

        held_rx.recv().unwrap();
        let started = Instant::now();
        let result = other.acquire(Duration::from_millis(20));
        assert!(matches!(result, Err(MapError::LockTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(15));

        done_tx.send(()).unwrap();
        holder.join().unwrap();
        other.acquire(Duration::from_millis(50)).unwrap().release().unwrap();
    }

    #[test]
    fn test_abandoned_lock_is_reported_once() {
        let name = unique_name("lock_abandoned");
        let _cleanup = Cleanup(name.clone());

        let lock = Arc::new(NamedLock::open_or_create(&name).unwrap());
        {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let guard = lock.acquire(Duration::from_millis(50)).unwrap();
                // Holder exits without unlocking
                std::mem::forget(guard);
            })
            .join()
            .unwrap();
        }

        let guard = lock.acquire(Duration::from_millis(50)).unwrap();
        assert!(guard.was_abandoned());
        assert!(matches!(
            guard.ensure_consistent(),
            Err(MapError::LockAbandoned { .. })
        ));
        guard.release().unwrap();

        let guard = lock.acquire(Duration::from_millis(50)).unwrap();
        assert!(!guard.was_abandoned());
    }

    #[test]
    fn test_holder_accounting() {
        let name = unique_name("lock_holders");
        let _cleanup = Cleanup(name.clone());

        let lock = NamedLock::open_or_create(&name).unwrap();
        let guard = lock.acquire(Duration::from_millis(50)).unwrap();
        assert_eq!(lock.holders(&guard), 0);
        assert_eq!(lock.attach(&guard), 1);
        assert_eq!(lock.attach(&guard), 2);
        assert_eq!(lock.detach(&guard), 1);
        assert_eq!(lock.detach(&guard), 0);
        assert_eq!(lock.detach(&guard), 0);
        assert!(!lock.is_retired(&guard));
        lock.retire(&guard);
        assert!(lock.is_retired(&guard));
    }

    #[test]
    fn test_open_only_requires_existing() {
        let name = unique_name("lock_open_only");
        assert!(matches!(
            NamedLock::open_only(&name),
            Err(MapError::Segment { .. })
        ));
    }

    #[test]
    fn test_opens_mutex_only_lock_object() {
        let name = unique_name("lock_bare");
        let _cleanup = Cleanup(name.clone());
        let _bare = create_bare_mutex(&name);

        let lock = NamedLock::open_or_create(&name).unwrap();
        assert!(lock.is_foreign());
        let guard = lock.acquire(Duration::from_millis(50)).unwrap();
        assert!(!guard.was_abandoned());
        assert_eq!(lock.attach(&guard), 1);
        guard.release().unwrap();

        // Later openers learn the origin from the companion
        let other = NamedLock::open_only(&name).unwrap();
        assert!(other.is_foreign());
        let guard = other.acquire(Duration::from_millis(50)).unwrap();
        assert_eq!(other.holders(&guard), 1);
    }

    #[test]
    fn test_created_lock_is_native() {
        let name = unique_name("lock_native");
        let _cleanup = Cleanup(name.clone());

        let lock = NamedLock::open_or_create(&name).unwrap();
        assert!(!lock.is_foreign());
        assert!(NamedSegment::open(&holders_name(&name).unwrap()).is_ok());
        let mutex = NamedSegment::open(&lock_name(&name).unwrap()).unwrap();
        assert_eq!(mutex.capacity(), MUTEX_SIZE);

        let other = NamedLock::open_or_create(&name).unwrap();
        assert!(!other.is_foreign());
    }

    #[test]
    fn test_unlink_removes_lock_and_companion() {
        let name = unique_name("lock_unlink");
        let lock = NamedLock::open_or_create(&name).unwrap();
        assert!(NamedLock::unlink(&name).unwrap());
        assert!(NamedSegment::open(&lock_name(&name).unwrap()).is_err());
        assert!(NamedSegment::open(&holders_name(&name).unwrap()).is_err());
        assert!(!NamedLock::unlink(&name).unwrap());

        // The mapping outlives the names
        lock.acquire(Duration::from_millis(50)).unwrap().release().unwrap();
    }

    #[test]
    fn test_retired_companion_is_replaced() {
        let name = unique_name("lock_retired");
        let _cleanup = Cleanup(name.clone());

        let old = NamedLock::open_or_create(&name).unwrap();
        let guard = old.acquire(Duration::from_millis(50)).unwrap();
        old.retire(&guard);
        NamedLock::unlink_mutex(&name).unwrap();
        NamedLock::unlink_accounting(&name).unwrap();
        guard.release().unwrap();

        let fresh = NamedLock::open_or_create(&name).unwrap();
        let guard = fresh.acquire(Duration::from_millis(50)).unwrap();
        assert!(!fresh.is_retired(&guard));
        assert_eq!(fresh.holders(&guard), 0);
    }
}
