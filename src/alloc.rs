//! A fixed-class small-buffer allocator for short-lived, same-size chunks.
//!
//! Grounded on `dispenso/pool_allocator.{h,cpp}` and
//! `dispenso/detail/once_callable_impl.h`'s `kMaxSmallBufferSize` path: each
//! thread keeps a private free-list per size class, refilled in batches from
//! (and overflowing in batches back to) a shared global reservoir. The
//! reservoir itself is backed by `crossbeam::queue::SegQueue`, an unbounded
//! lock-free MPMC queue — the Rust-idiomatic equivalent of the teacher's
//! spin-locked `Vec<char*>` reservoir (`PoolAllocatorT::backingAllocLock_`),
//! without needing a hand-rolled spinlock.
//!
//! This is the allocator that backs [`crate::once_fn::OnceFunction`]'s
//! erased closure storage; callables that don't fit any size class fall
//! through to the system allocator, exactly as `OnceCallableMalloc` does in
//! the original.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

/// Size classes, in bytes. The largest is the cutoff above which callers
/// must fall back to the system allocator.
const CLASS_SIZES: [usize; 5] = [16, 32, 64, 128, 256];

/// Largest size servable by the small-buffer allocator.
pub const MAX_SMALL_BUFFER: usize = CLASS_SIZES[CLASS_SIZES.len() - 1];

/// Number of chunks carved out of each freshly-allocated slab.
const CHUNKS_PER_SLAB: usize = 64;

/// Above this many free chunks, a thread pushes a batch back to the global
/// reservoir rather than growing its private free-list without bound.
const LOCAL_WATERMARK: usize = 128;

/// Batch size moved between a thread's free-list and the global reservoir.
const BATCH_SIZE: usize = 32;

static_assertions::const_assert!(LOCAL_WATERMARK > BATCH_SIZE);
static_assertions::const_assert!(CLASS_SIZES[0] < CLASS_SIZES[CLASS_SIZES.len() - 1]);

/// Returns the size class index able to hold an allocation of `size` bytes
/// with the given `align`, or `None` if it exceeds [`MAX_SMALL_BUFFER`] or
/// needs stricter alignment than the allocator guarantees (chunks are
/// `align_of::<usize>()`-aligned at minimum, and slabs are cache-line
/// aligned).
pub fn class_for(size: usize, align: usize) -> Option<usize> {
    if align > crate::CACHE_LINE_SIZE {
        return None;
    }
    CLASS_SIZES.iter().position(|&class_size| size <= class_size)
}

/// Returns the chunk size in bytes for a given class index.
pub fn class_size(class: usize) -> usize {
    CLASS_SIZES[class]
}

// SAFETY: the pointers stored here always originate from a slab allocation
// owned by this module; we hand out exclusive ownership of each chunk
// exactly once between `alloc` and the matching `dealloc`.
struct SendPtr(NonNull<u8>);
unsafe impl Send for SendPtr {}

struct GlobalClass {
    reservoir: SegQueue<SendPtr>,
    bytes_allocated: AtomicUsize,
}

impl GlobalClass {
    const fn new() -> Self {
        GlobalClass {
            reservoir: SegQueue::new(),
            bytes_allocated: AtomicUsize::new(0),
        }
    }
}

struct Global {
    classes: [GlobalClass; CLASS_SIZES.len()],
}

static GLOBAL: Global = Global {
    classes: [
        GlobalClass::new(),
        GlobalClass::new(),
        GlobalClass::new(),
        GlobalClass::new(),
        GlobalClass::new(),
    ],
};

thread_local! {
    static LOCAL: [std::cell::RefCell<Vec<NonNull<u8>>>; CLASS_SIZES.len()] = Default::default();
}

fn slab_layout(class: usize) -> Layout {
    let size = class_size(class) * CHUNKS_PER_SLAB;
    Layout::from_size_align(size, crate::CACHE_LINE_SIZE).expect("slab layout overflow")
}

/// Allocates one chunk of `class_size(class)` bytes from the thread's
/// private free-list, refilling from the global reservoir or the system
/// allocator as needed. Never blocks on other threads.
pub fn alloc(class: usize) -> NonNull<u8> {
    LOCAL.with(|locals| {
        let mut local = locals[class].borrow_mut();
        if let Some(ptr) = local.pop() {
            return ptr;
        }

        let global = &GLOBAL.classes[class];
        for _ in 0..BATCH_SIZE {
            match global.reservoir.pop() {
                Some(p) => local.push(p.0),
                None => break,
            }
        }
        if let Some(ptr) = local.pop() {
            return ptr;
        }

        // Reservoir was empty too: carve a fresh slab from the system.
        let layout = slab_layout(class);
        let slab = unsafe { std::alloc::alloc(layout) };
        let slab = NonNull::new(slab).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        global
            .bytes_allocated
            .fetch_add(layout.size(), Ordering::Relaxed);

        let size = class_size(class);
        for i in 1..CHUNKS_PER_SLAB {
            // SAFETY: each offset lands within the freshly allocated slab.
            let chunk = unsafe { NonNull::new_unchecked(slab.as_ptr().add(i * size)) };
            local.push(chunk);
        }
        slab
    })
}

/// Returns a chunk previously obtained from [`alloc`] with the same `class`
/// to the thread's private free-list, overflowing a batch to the global
/// reservoir if the local list has grown past its watermark.
///
/// # Safety
/// `ptr` must have been returned by `alloc(class)` and not already
/// deallocated.
pub unsafe fn dealloc(class: usize, ptr: NonNull<u8>) {
    LOCAL.with(|locals| {
        let mut local = locals[class].borrow_mut();
        local.push(ptr);
        if local.len() > LOCAL_WATERMARK {
            let global = &GLOBAL.classes[class];
            for _ in 0..BATCH_SIZE {
                if let Some(p) = local.pop() {
                    global.reservoir.push(SendPtr(p));
                } else {
                    break;
                }
            }
        }
    });
}

/// Total bytes ever carved from the system allocator for `class`. Exposed
/// for tests/instrumentation, matching the original's debug tooling.
pub fn bytes_allocated(class: usize) -> usize {
    GLOBAL.classes[class].bytes_allocated.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_for_fits_smallest() {
        assert_eq!(class_for(1, 1), Some(0));
        assert_eq!(class_for(16, 8), Some(0));
        assert_eq!(class_for(17, 8), Some(1));
        assert_eq!(class_for(256, 8), Some(4));
    }

    #[test]
    fn class_for_overflow_falls_through() {
        assert_eq!(class_for(257, 8), None);
        assert_eq!(class_for(8, 128), None);
    }

    #[test]
    fn alloc_dealloc_roundtrip() {
        let class = 2;
        let ptr = alloc(class);
        unsafe {
            *ptr.as_ptr() = 0xAB;
            assert_eq!(*ptr.as_ptr(), 0xAB);
            dealloc(class, ptr);
        }
    }

    #[test]
    fn bytes_allocated_grows_and_is_bounded_by_slab_granularity() {
        let class = 0;
        let before = bytes_allocated(class);
        // Force at least one slab to be carved by allocating more than a
        // slab's worth without returning any of them yet.
        let mut held = Vec::new();
        for _ in 0..(CHUNKS_PER_SLAB + 1) {
            held.push(alloc(class));
        }
        let after = bytes_allocated(class);
        assert!(after > before);
        assert_eq!((after - before) % slab_layout(class).size(), 0);

        for ptr in held {
            unsafe { dealloc(class, ptr) };
        }
    }

    #[test]
    fn many_threads_alloc_dealloc_without_crossing_wires() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..2000 {
                        let p = alloc(1);
                        unsafe {
                            *p.as_ptr() = 7;
                            assert_eq!(*p.as_ptr(), 7);
                            dealloc(1, p);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
