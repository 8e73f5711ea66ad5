//! Distributed driver locks.
//!
//! A driver lock is a key `lock/<driver_id>` whose value is the holder's
//! identity. There is no in-process lock state: every operation reads the
//! store, decides, and writes with the version it read.
//!
//! - [`CasLockMap`]: single-key check-and-set operations.
//! - [`SessionLock`]: TTL-bound, retrying mutual exclusion on one key.
//! - [`LockManager`]: driver lock operations serialized behind the session
//!   lock on `lock/master`.

mod cas;
mod manager;
mod session;

pub use cas::CasLockMap;
pub use manager::LockManager;
pub use session::{SessionLock, SessionLockGuard};
