//! Small internal helpers.
// (c) 2025 Ross Younger

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, accepting poisoned state. Handler panics are already caught
/// at the dispatch boundary; a poisoned lock elsewhere means a bug, but
/// cascading panics through unrelated callers helps nobody.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort rendering of a caught panic payload.
pub(crate) fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
