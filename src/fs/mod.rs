//! Atomic FS layer, keyed serialization, and the capability oracle
//! (spec §4.1, §4.11, §9).

pub mod atomic;
pub mod capability;
pub mod keyed_queue;

pub use atomic::{create_unique, ensure_folder, read_with_retry, write_atomic, FsError};
pub use capability::{Capability, CapabilityOracle};
pub use keyed_queue::KeyedQueue;
