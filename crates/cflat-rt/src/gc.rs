//! The cflat allocator and semispace copying collector.
//!
//! Compiled cflat programs allocate every heap object through
//! [`_cflat_alloc`]. When the active half-space cannot satisfy a request,
//! the collector runs a Cheney copy: the stack walk forwards every root
//! into to-space, a two-finger scan forwards the pointer fields of the
//! copied objects, and the halves swap. Collection happens synchronously at
//! the allocation point with the caller's live stack as the root source.
//!
//! The process-wide [`Collector`] lives behind a mutex; the `extern "C"`
//! exports are thin trampolines over it. The mutex makes the ABI safe to
//! call from any context without UB concerns, though the runtime contract
//! is strictly single-threaded.

use std::ptr;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::HeapConfig;
use crate::header::Header;
use crate::heap::SemiSpace;
use crate::panic::fatal;
use crate::stack::{frame_base, FrameWalk};

// ---------------------------------------------------------------------------
// Global collector instance
// ---------------------------------------------------------------------------

/// The process-wide collector, created by [`_cflat_init_gc`].
static COLLECTOR: OnceLock<Mutex<Collector>> = OnceLock::new();

/// Get the global collector, or die with the contract-violation message.
fn collector() -> &'static Mutex<Collector> {
    match COLLECTOR.get() {
        Some(collector) => collector,
        None => fatal("_cflat_alloc should only be called after _cflat_init_gc"),
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Allocator and collector state: the two half-spaces, the stack-walk
/// terminator recorded at startup, and the log flag.
pub struct Collector {
    heap: SemiSpace,
    base_frame: *mut usize,
    gc_log: bool,
}

// Only ever touched by the single mutator thread; the mutex in COLLECTOR
// serializes any other access.
unsafe impl Send for Collector {}

impl Collector {
    /// Create a collector for a validated configuration. `base_frame` is the
    /// frame base of `main`'s caller; the root walk stops strictly before
    /// it. Returns `None` if the OS refuses the backing memory.
    pub fn new(config: HeapConfig, base_frame: *mut usize) -> Option<Collector> {
        let heap = SemiSpace::new(config.heap_words)?;
        Some(Collector {
            heap,
            base_frame,
            gc_log: config.gc_log,
        })
    }

    pub fn heap(&self) -> &SemiSpace {
        &self.heap
    }

    /// Reserve `1 + payload_words` words and return the payload pointer,
    /// one word past the reserved header slot. The payload is zeroed; the
    /// header slot is left for the caller (compiled code writes the header
    /// immediately after the allocation call returns). `None` if the
    /// reservation does not fit in from-space.
    pub fn try_alloc(&mut self, payload_words: usize) -> Option<*mut usize> {
        let start = self.heap.bump_alloc(1 + payload_words)?;
        // SAFETY: the reservation covers the header word plus the payload.
        let payload = unsafe { start.add(1) };
        unsafe { ptr::write_bytes(payload, 0, payload_words) };
        Some(payload)
    }

    /// Allocate `payload_words`, collecting once on exhaustion. `top_frame`
    /// is the frame base of the function that called `_cflat_alloc`, the
    /// top of the root walk. Returns `None` if the request still does not
    /// fit after a full collection.
    ///
    /// # Safety
    ///
    /// `top_frame` and every frame between it and the recorded base frame
    /// must follow the cflat frame layout, and every root slot must hold
    /// null or a valid payload pointer into from-space.
    pub unsafe fn alloc(
        &mut self,
        payload_words: usize,
        top_frame: *mut usize,
    ) -> Option<*mut usize> {
        if self.gc_log {
            print!("_cflat_alloc: attempting to allocate {payload_words} words...");
        }
        if let Some(payload) = self.try_alloc(payload_words) {
            if self.gc_log {
                println!("successful");
            }
            return Some(payload);
        }
        if self.gc_log {
            println!("triggering collection");
        }

        // SAFETY: forwarded to our own caller's contract.
        unsafe { self.collect(top_frame) };

        if self.gc_log {
            print!("_cflat_alloc: second attempt to allocate {payload_words} words...");
        }
        match self.try_alloc(payload_words) {
            Some(payload) => {
                if self.gc_log {
                    println!("successful");
                }
                Some(payload)
            }
            None => {
                if self.gc_log {
                    println!("out of memory");
                }
                None
            }
        }
    }

    /// Run one full collection with `top_frame` as the top of the root
    /// walk: forward every root, scan the copied objects breadth-first, and
    /// swap the half-spaces.
    ///
    /// # Safety
    ///
    /// Same contract as [`alloc`](Self::alloc).
    pub unsafe fn collect(&mut self, top_frame: *mut usize) {
        let mut free = self.heap.to_base();

        // SAFETY: the frame chain contract is the caller's.
        let walk = unsafe { FrameWalk::new(top_frame, self.base_frame) };
        for (index, frame) in walk.enumerate() {
            // SAFETY: frames yielded by the walk follow the cflat layout.
            let count = unsafe { frame.root_count() };
            if self.gc_log {
                println!(
                    "gc: processing stack frame {index} (from top of stack), with {count} pointers"
                );
            }
            for i in 0..count.max(0) as usize {
                if self.gc_log {
                    println!("-- processing pointer offset {i}");
                }
                // SAFETY: i is below the frame's root count.
                unsafe { self.forward(frame.root_slot(i), &mut free) };
            }
        }

        if self.gc_log {
            println!("gc: starting scan");
        }
        let mut scan = self.heap.to_base();
        while scan < free {
            // Only freshly copied objects sit between the two cursors, so
            // the word at `scan` is always a real header.
            // SAFETY: scan stays within the copied prefix of to-space.
            let header = Header::decode_object(unsafe { *scan });
            if self.gc_log {
                println!("-- scanning header {header}");
            }
            let width = header.payload_words();
            for offset in header.ptr_offsets() {
                // SAFETY: pointer fields lie within the object's payload.
                unsafe { self.forward(scan.add(1 + offset), &mut free) };
            }
            if self.gc_log {
                println!("-- incrementing scanning ptr by {}", 1 + width);
            }
            // SAFETY: the next object starts right past this one's payload.
            scan = unsafe { scan.add(1 + width) };
        }

        // SAFETY: free never leaves to-space (live data fits in one half).
        let live_words = unsafe { free.offset_from(self.heap.to_base()) } as usize;
        if self.gc_log {
            println!("gc: swapping from and to spaces ({live_words} words still live)");
        }
        self.heap.swap(live_words);
    }

    /// Forward the pointer held in `slot`: copy its referent into to-space
    /// on first visit, or rewrite the slot from the forwarding address left
    /// by an earlier visit. Null and non-from-space values are left alone.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for reads and writes; a from-space value in it
    /// must be the payload pointer of a live object.
    unsafe fn forward(&mut self, slot: *mut usize, free: &mut *mut usize) {
        // SAFETY: slot is valid per the caller's contract.
        let p = unsafe { *slot } as *mut usize;
        if p.is_null() || !self.heap.in_from_space(p) {
            return;
        }

        // SAFETY: a from-space payload pointer has its header one word below.
        let header_addr = unsafe { p.sub(1) };
        let from_rel = self.heap.from_rel(p);
        // SAFETY: header_addr points at the object's header word.
        match Header::decode(unsafe { *header_addr }, self.heap.to_space_range()) {
            Header::Forwarded { payload } => {
                if self.gc_log {
                    println!(
                        "---- copying object at relative address {from_rel} with header [Forwarded]"
                    );
                    println!(
                        "---- object forwarded to relative address {}",
                        self.heap.to_rel(payload)
                    );
                }
                // SAFETY: slot is valid for writes.
                unsafe { *slot = payload };
            }
            header => {
                let width = header.payload_words();
                let dest_header = *free;
                // SAFETY: to-space has room for all live data, so the
                // destination object (header + payload) is in bounds.
                let dest_payload = unsafe { dest_header.add(1) };
                if self.gc_log {
                    println!(
                        "---- copying object at relative address {from_rel} with header {header}"
                    );
                    println!(
                        "---- moving object from relative address {from_rel} to {}",
                        self.heap.to_rel(dest_payload as usize)
                    );
                }
                // SAFETY: source and destination both span 1 + width words
                // inside their respective half-spaces, which are disjoint.
                unsafe {
                    ptr::copy_nonoverlapping(header_addr, dest_header, 1 + width);
                    // The old header now holds the forwarding address; any
                    // later visitor of this object takes the branch above.
                    *header_addr = dest_payload as usize;
                    *slot = dest_payload as usize;
                    *free = dest_header.add(1 + width);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// extern "C" ABI functions
// ---------------------------------------------------------------------------

/// Initialize the runtime heap and record the stack-walk terminator.
///
/// Compiled cflat programs call this exactly once at the top of `main`; a
/// second call is a fatal contract violation. Reads `CFLAT_HEAP_WORDS` and
/// `CFLAT_GC_LOG`, allocates the backing memory, and captures the frame
/// base two levels up (the frame that called `main`) as the point where the
/// root walk stops.
#[no_mangle]
pub extern "C" fn _cflat_init_gc() {
    if COLLECTOR.get().is_some() {
        fatal("_cflat_init_gc should be called exactly once, at the beginning of main");
    }

    // SAFETY: our caller is `main` and frame pointers are preserved, so the
    // chain reaches main's caller. Must happen directly in this function.
    let base_frame = unsafe { frame_base(2) };

    let config = match HeapConfig::from_env() {
        Ok(config) => config,
        Err(err) => fatal(&err.to_string()),
    };
    let collector = match Collector::new(config, base_frame) {
        Some(collector) => collector,
        None => fatal("unsuccessful allocation of heap."),
    };

    if config.gc_log {
        println!("_cflat_init_gc: allocated heap of {} words", config.heap_words);
    }

    // Cannot fail: this thread is the only one running and the guard above
    // saw the cell empty.
    let _ = COLLECTOR.set(Mutex::new(collector));
}

/// Allocate `num_words` payload words and return the payload pointer.
///
/// The reservation is `num_words + 1` words; the returned pointer is one
/// word past the reserved header slot and the caller (compiler-generated
/// code) writes the object header at `result[-1]`. The payload is zeroed.
/// On exhaustion the collector runs once, using the caller's frame as the
/// top of the root walk; if the retry also fails the process reports
/// `out of memory` and exits.
#[no_mangle]
pub extern "C" fn _cflat_alloc(num_words: usize) -> *mut usize {
    // The caller's frame is the top of the root walk. This read must happen
    // here, not in a callee.
    // SAFETY: compiled cflat callers preserve frame pointers.
    let top_frame = unsafe { frame_base(1) };

    let mut collector = collector().lock();
    // SAFETY: the compiler guarantees the frame layout and root contents
    // between the caller's frame and the recorded base frame.
    match unsafe { collector.alloc(num_words, top_frame) } {
        Some(payload) => payload,
        None => fatal("out of memory"),
    }
}

/// Zero `num_words` words starting at `start`, going from low to high
/// addresses. Non-positive counts are a no-op.
///
/// # Safety
///
/// `start` must be valid for writes of `num_words` words.
#[no_mangle]
pub unsafe extern "C" fn _cflat_zero_words(start: *mut usize, num_words: i64) {
    if num_words <= 0 {
        return;
    }
    // SAFETY: the caller guarantees the range is writable.
    unsafe { ptr::write_bytes(start, 0, num_words as usize) };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
