//! Stack-frame discovery for the root walk.
//!
//! Compiled cflat code keeps frame pointers, and every frame whose function
//! has pointer-typed locals follows one layout: the word at offset 0 of the
//! frame base is the saved previous frame base, the word at offset -1 is the
//! compiler-emitted root count `R`, and the `R` root slots sit at offsets
//! -2 through -(R+1). The collector walks this chain from the frame that
//! triggered the allocation up to (but not including) the frame recorded at
//! startup as the walk terminator.

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("the cflat root walk reads the frame-pointer register; only x86-64 and aarch64 are supported");

/// Base pointer of the current function's stack frame.
///
/// Must stay `#[inline(always)]`: the read has to observe the frame of the
/// function this is written in, the way `__builtin_frame_address(0)` does.
/// The workspace builds with `-Cforce-frame-pointers=yes` so the register
/// actually holds a frame base.
#[inline(always)]
pub fn current_frame_base() -> *mut usize {
    let fp: *mut usize;
    unsafe {
        #[cfg(target_arch = "x86_64")]
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
        #[cfg(target_arch = "aarch64")]
        core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    fp
}

/// Frame base `levels` call frames above the function this is written in,
/// matching `__builtin_frame_address(levels)`: 0 is the current frame, 1 the
/// caller, 2 the caller's caller.
///
/// Must be invoked directly from the function whose ancestry is wanted,
/// never from a helper it calls (inlining keeps that true for this crate's
/// own uses).
///
/// # Safety
///
/// Every frame on the walked chain must keep a saved frame base at offset 0
/// of its frame base.
#[inline(always)]
pub unsafe fn frame_base(levels: usize) -> *mut usize {
    let mut fp = current_frame_base();
    for _ in 0..levels {
        // SAFETY: the caller guarantees the saved-frame chain is intact for
        // this many levels.
        fp = unsafe { *fp } as *mut usize;
    }
    fp
}

/// One frame on the cflat call stack, viewed through the compiler's layout
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    base: *mut usize,
}

impl StackFrame {
    pub fn new(base: *mut usize) -> StackFrame {
        StackFrame { base }
    }

    pub fn base(&self) -> *mut usize {
        self.base
    }

    /// The compiler-emitted root count at offset -1, read as a signed word.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a live frame following the cflat layout.
    pub unsafe fn root_count(&self) -> i64 {
        unsafe { *self.base.sub(1) as i64 }
    }

    /// Address of root slot `i` (offset `-2 - i` from the frame base).
    ///
    /// # Safety
    ///
    /// `i` must be below this frame's root count.
    pub unsafe fn root_slot(&self, i: usize) -> *mut usize {
        unsafe { self.base.sub(2 + i) }
    }

    /// The caller's frame, from the saved frame base at offset 0.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a live frame following the cflat layout.
    pub unsafe fn parent(&self) -> StackFrame {
        StackFrame::new(unsafe { *self.base } as *mut usize)
    }
}

/// Iterator over frames from `top` (the function that triggered the
/// allocation) toward the stack base, stopping as soon as the frame base
/// reaches or passes `terminator`.
pub struct FrameWalk {
    next: StackFrame,
    terminator: *mut usize,
}

impl FrameWalk {
    /// # Safety
    ///
    /// `top` must be the base of a live cflat frame, every frame between it
    /// and `terminator` must follow the cflat layout, and `terminator` must
    /// be on `top`'s saved-frame chain (stacks grow down, so each parent
    /// base is numerically larger than its child's).
    pub unsafe fn new(top: *mut usize, terminator: *mut usize) -> FrameWalk {
        FrameWalk {
            next: StackFrame::new(top),
            terminator,
        }
    }
}

impl Iterator for FrameWalk {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        if self.next.base() as usize >= self.terminator as usize {
            return None;
        }
        let frame = self.next;
        // SAFETY: the FrameWalk::new contract covers every frame before the
        // terminator.
        self.next = unsafe { frame.parent() };
        Some(frame)
    }
}
