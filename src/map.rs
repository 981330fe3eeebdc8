//! Named map handle
//!
//! A [`NamedMap`] composes a [`NamedSegment`] and its [`NamedLock`] under one
//! name. Every read and write happens with the lock held, so readers in any
//! process observe either the previous frame or the new one, never a mix.
//!
//! # Lifetime
//!
//! The lock's companion object counts attached handles across processes.
//! Closing (or dropping) the last handle unlinks the map, its lock and the
//! companion, so the map disappears once nobody holds it. When the lock was
//! created by a peer that keeps no count, the map and lock belong to that
//! peer and only the companion is removed. A process that dies without
//! closing leaves its count behind; [`NamedMap::unlink`] clears such
//! leftovers.

use crate::error::{MapError, Result};
use crate::frame::{self, Payload, PayloadKind, Scalar, LEN_PREFIX};
use crate::lock::{LockGuard, NamedLock};
use crate::shm::NamedSegment;
use parking_lot::RwLock;
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default segment capacity in bytes
pub const DEFAULT_CAPACITY: usize = 256;

/// Default lock timeout for reads and writes
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Lower bound on the lock timeout used while attaching or detaching
const ATTACH_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Attempts to find a lock object that has not been retired
const ATTACH_ATTEMPTS: usize = 8;

/// Whether opening may create the map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    OpenOrCreate,
    OpenOnly,
}

/// Map configuration
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Segment size in bytes when this handle creates it, prefix included
    pub capacity: usize,
    /// How long reads and writes wait for the lock
    pub lock_timeout: Duration,
    /// Create the map if it does not exist
    pub mode: OpenMode,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            mode: OpenMode::OpenOrCreate,
        }
    }
}

impl MapConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}

struct Mapped {
    segment: NamedSegment,
    lock: NamedLock,
}

enum MapState {
    Open(Mapped),
    Degraded(MapError),
    Closed,
}

/// Handle to a named map
pub struct NamedMap {
    name: String,
    config: MapConfig,
    state: RwLock<MapState>,
}

impl NamedMap {
    /// Open or create `name` with the given capacity and default settings
    ///
    /// Never fails: if the OS objects cannot be opened the handle is degraded
    /// and every operation returns the original error. Check
    /// [`NamedMap::is_mapped`] or use [`NamedMap::try_open`] to fail early.
    pub fn open_or_create(name: &str, capacity: usize) -> Self {
        Self::open(name, MapConfig::with_capacity(capacity))
    }

    /// Open with an explicit configuration, degrading on failure
    pub fn open(name: &str, config: MapConfig) -> Self {
        let state = match attach(name, &config) {
            Ok(mapped) => MapState::Open(mapped),
            Err(e) => {
                warn!(name, error = %e, "named map unavailable, handle is degraded");
                MapState::Degraded(e)
            }
        };
        Self {
            name: name.to_string(),
            config,
            state: RwLock::new(state),
        }
    }

    /// Open with an explicit configuration, returning the failure directly
    pub fn try_open(name: &str, config: MapConfig) -> Result<Self> {
        let mapped = attach(name, &config)?;
        Ok(Self {
            name: name.to_string(),
            config,
            state: RwLock::new(MapState::Open(mapped)),
        })
    }

    /// Remove every OS name of the map regardless of attached holders
    ///
    /// Processes that still have the map open keep their mappings, but new
    /// openers get a fresh map.
    pub fn unlink(name: &str) -> Result<bool> {
        let segment = NamedSegment::unlink(name);
        let lock = NamedLock::unlink(name);
        Ok(segment? | lock?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// `true` while the handle is open and backed by OS objects
    pub fn is_mapped(&self) -> bool {
        matches!(*self.state.read(), MapState::Open(_))
    }

    /// Capacity of the underlying segment
    pub fn capacity(&self) -> Result<usize> {
        self.with_mapped(|m| Ok(m.segment.capacity()))
    }

    /// Largest payload a single write can carry
    pub fn max_payload(&self) -> Result<usize> {
        self.with_mapped(|m| Ok(m.segment.capacity() - LEN_PREFIX))
    }

    fn with_mapped<T>(&self, f: impl FnOnce(&Mapped) -> Result<T>) -> Result<T> {
        match &*self.state.read() {
            MapState::Open(mapped) => f(mapped),
            MapState::Degraded(e) => Err(e.clone()),
            MapState::Closed => Err(MapError::HandleClosed),
        }
    }

    /// Replace the map's contents with raw payload bytes
    ///
    /// Fails with [`MapError::PayloadTooLarge`] without touching the segment
    /// when the frame would not fit.
    pub fn write_raw(&self, payload: &[u8]) -> Result<()> {
        let frame = frame::encode_length_prefixed(payload)?;
        self.with_mapped(|m| {
            let guard = m.lock.acquire(self.config.lock_timeout)?;
            guard.ensure_consistent()?;

            let capacity = m.segment.capacity();
            if frame.len() > capacity {
                return Err(MapError::PayloadTooLarge {
                    max: capacity - LEN_PREFIX,
                    got: payload.len(),
                });
            }
            m.segment.write(0, &frame)?;
            guard.release()
        })
    }

    /// Copy the current payload bytes out of the map
    ///
    /// An empty vector means nothing has been written yet.
    pub fn read_raw(&self) -> Result<Vec<u8>> {
        self.with_mapped(|m| {
            let guard = m.lock.acquire(self.config.lock_timeout)?;
            guard.ensure_consistent()?;

            let mut prefix = [0u8; LEN_PREFIX];
            m.segment.read_into(0, &mut prefix)?;
            let len = frame::decode_prefix(prefix);

            let available = m.segment.capacity() - LEN_PREFIX;
            if len > available {
                return Err(MapError::corrupt(format!(
                    "payload length {} exceeds the {} bytes the segment can hold",
                    len, available
                )));
            }
            let payload = m.segment.read(LEN_PREFIX, len)?;
            guard.release()?;
            Ok(payload)
        })
    }

    /// Current payload length in bytes
    pub fn size(&self) -> Result<usize> {
        self.with_mapped(|m| {
            let guard = m.lock.acquire(self.config.lock_timeout)?;
            guard.ensure_consistent()?;
            let mut prefix = [0u8; LEN_PREFIX];
            m.segment.read_into(0, &mut prefix)?;
            guard.release()?;
            Ok(frame::decode_prefix(prefix))
        })
    }

    /// Write a typed payload
    pub fn write(&self, payload: &Payload) -> Result<()> {
        self.write_raw(&payload.encode()?)
    }

    /// Read the payload interpreted as `kind`
    pub fn read(&self, kind: PayloadKind) -> Result<Payload> {
        Payload::decode(kind, &self.read_raw()?)
    }

    pub fn write_scalars<T: Scalar>(&self, values: &[T]) -> Result<()> {
        self.write_raw(&frame::encode_scalars(values))
    }

    pub fn read_scalars<T: Scalar>(&self) -> Result<Vec<T>> {
        frame::decode_scalars(&self.read_raw()?)
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.write_raw(data)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.read_raw()
    }

    pub fn write_ints(&self, data: &[i32]) -> Result<()> {
        self.write_scalars(data)
    }

    pub fn read_ints(&self) -> Result<Vec<i32>> {
        self.read_scalars()
    }

    pub fn write_floats(&self, data: &[f32]) -> Result<()> {
        self.write_scalars(data)
    }

    pub fn read_floats(&self) -> Result<Vec<f32>> {
        self.read_scalars()
    }

    pub fn write_doubles(&self, data: &[f64]) -> Result<()> {
        self.write_scalars(data)
    }

    pub fn read_doubles(&self) -> Result<Vec<f64>> {
        self.read_scalars()
    }

    pub fn write_text(&self, text: &str) -> Result<()> {
        self.write_raw(&frame::encode_text(text)?)
    }

    pub fn read_text(&self) -> Result<String> {
        frame::decode_text(&self.read_raw()?)
    }

    /// Detach from the map; later operations fail with [`MapError::HandleClosed`]
    pub fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.write(), MapState::Closed);
        match previous {
            MapState::Open(mapped) => detach(&self.name, mapped, self.config.lock_timeout),
            MapState::Degraded(_) => Ok(()),
            MapState::Closed => Err(MapError::HandleClosed),
        }
    }
}

impl Drop for NamedMap {
    fn drop(&mut self) {
        let previous = std::mem::replace(self.state.get_mut(), MapState::Closed);
        if let MapState::Open(mapped) = previous {
            if let Err(e) = detach(&self.name, mapped, self.config.lock_timeout) {
                warn!(name = %self.name, error = %e, "failed to detach named map on drop");
            }
        }
    }
}

impl std::fmt::Debug for NamedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.read() {
            MapState::Open(_) => "open",
            MapState::Degraded(_) => "degraded",
            MapState::Closed => "closed",
        };
        f.debug_struct("NamedMap")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &state)
            .finish()
    }
}

/// Open the lock, register as a holder and open the segment under it
fn attach(name: &str, config: &MapConfig) -> Result<Mapped> {
    if config.mode == OpenMode::OpenOrCreate && config.capacity < LEN_PREFIX {
        return Err(MapError::InvalidCapacity {
            min: LEN_PREFIX,
            got: config.capacity,
        });
    }
    let timeout = config.lock_timeout.max(ATTACH_LOCK_TIMEOUT);

    for _ in 0..ATTACH_ATTEMPTS {
        let lock = match config.mode {
            OpenMode::OpenOrCreate => NamedLock::open_or_create(name)?,
            OpenMode::OpenOnly => NamedLock::open_only(name)?,
        };

        let segment = {
            let guard = lock.acquire(timeout)?;
            if guard.was_abandoned() {
                warn!(name, "attaching to a map whose previous holder died mid-operation");
            }
            if lock.is_retired(&guard) {
                debug!(name, "lock object was retired by its last holder, reopening");
                continue;
            }

            let opened = match config.mode {
                OpenMode::OpenOrCreate => {
                    NamedSegment::open_or_create(name, config.capacity).map(|(s, _)| s)
                }
                OpenMode::OpenOnly => NamedSegment::open(name),
            };
            let segment = match opened {
                Ok(segment) => segment,
                Err(e) => {
                    if lock.holders(&guard) == 0 {
                        if let Err(teardown) = retire(name, &lock, &guard) {
                            warn!(name, error = %teardown, "failed to remove unused lock");
                        }
                    }
                    return Err(e);
                }
            };
            if segment.capacity() < LEN_PREFIX {
                return Err(MapError::InvalidCapacity {
                    min: LEN_PREFIX,
                    got: segment.capacity(),
                });
            }

            let holders = lock.attach(&guard);
            guard.release()?;
            debug!(name, holders, capacity = segment.capacity(), "attached to named map");
            segment
        };

        return Ok(Mapped { segment, lock });
    }

    Err(MapError::lock(
        name,
        "open",
        io::Error::new(io::ErrorKind::Other, "lock object kept being retired"),
    ))
}

/// Drop one holder; the last one out unlinks the OS names
fn detach(name: &str, mapped: Mapped, timeout: Duration) -> Result<()> {
    let Mapped { segment, lock } = mapped;
    let timeout = timeout.max(ATTACH_LOCK_TIMEOUT);

    let guard = lock.acquire(timeout)?;
    let remaining = lock.detach(&guard);
    let removed = if remaining == 0 {
        let removed = retire(name, &lock, &guard);
        if removed.is_ok() && lock.is_foreign() {
            info!(name, "last counted holder closed named map, left to the peer that created it");
        } else if removed.is_ok() {
            info!(name, "last holder closed named map, removed from the system");
        }
        removed
    } else {
        debug!(name, remaining, "detached from named map");
        Ok(())
    };
    let released = guard.release();

    drop(segment);
    removed.and(released)
}

/// Mark the lock retired and unlink the names this side owns
///
/// Every unlink is attempted even if an earlier one fails, so a failure
/// never leaves a retired companion reachable behind a removed map. The
/// companion goes last: openers that still reach it see it retired and
/// start over.
fn retire(name: &str, lock: &NamedLock, guard: &LockGuard<'_>) -> Result<()> {
    lock.retire(guard);

    let mut results = Vec::with_capacity(3);
    if !lock.is_foreign() {
        results.push(NamedLock::unlink_mutex(name));
        results.push(NamedSegment::unlink(name));
    }
    results.push(NamedLock::unlink_accounting(name));

    let mut first = Ok(());
    for result in results {
        if let Err(e) = result {
            warn!(name, error = %e, "failed to unlink part of a retired map");
            if first.is_ok() {
                first = Err(e);
            }
        }
    }
    first
}
