//! Admission limiters: per-transfer bandwidth and per-origin request rate

pub mod bucket;
pub mod window;

pub use bucket::*;
pub use window::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Limiter state stays consistent across a panicking holder, so a poisoned
/// lock is recovered rather than propagated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
