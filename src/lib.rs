//! MelShare - named shared memory maps for small typed buffers
//!
//! Processes on the same machine exchange numeric vectors and text through a
//! *named map*: a fixed-capacity POSIX shared memory segment holding one
//! length-prefixed frame, guarded by a named cross-process lock. The name is
//! the whole rendezvous; any implementation that follows the same frame
//! layout and lock naming can take part.
//!
//! # Architecture
//!
//! - [`shm`]: named segments (create or open, bounds-checked access)
//! - [`lock`]: the `<name>_mutex` robust process-shared lock
//! - [`frame`]: frame layout and typed payload codecs
//! - [`map`]: [`NamedMap`], the handle that ties the three together
//! - [`registry`]: name-keyed, reference-counted access for foreign callers
//! - [`net`]: a point-to-point UDP link for peers on other machines
//!
//! Frames carry no type tag. Writers and readers must agree on the payload
//! type of each map; a reader that guesses wrong gets
//! [`MapError::CorruptFrame`] whenever the byte count rules the type out.

pub mod error;
pub mod shm;
pub mod lock;
pub mod frame;
pub mod map;
pub mod registry;
pub mod net;
pub mod bindings;

pub use error::{MapError, NetError, Result};
pub use frame::{Payload, PayloadKind};
pub use map::{MapConfig, NamedMap, OpenMode};
pub use net::{DatagramLink, LinkConfig};
pub use registry::MapRegistry;
