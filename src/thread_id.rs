//! A stable, process-unique thread identifier, independent of the OS TID.
//!
//! Grounded directly on `dispenso/thread_id.cpp`: a global atomic counter
//! handed out lazily the first time a thread asks for its id, cached in a
//! thread-local for the rest of the thread's life. IDs are never reused.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT_THREAD: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Returns the current thread's id, unique within the process and stable
/// for the thread's lifetime. IDs are assigned in call order, not spawn
/// order.
pub fn thread_id() -> u64 {
    CURRENT_THREAD.with(|cell| match cell.get() {
        Some(id) => id,
        None => {
            let id = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
            cell.set(Some(id));
            id
        }
    })
}
