//! Stack-switching coroutine primitive.
//!
//! A coroutine is a [`Stack`] (a private mmap'd region with a guard page)
//! plus a [`Context`] — the saved stack pointer of a suspended execution.
//! [`transfer`] saves the callee-saved registers of the running coroutine on
//! its own stack, records the stack pointer in `from`, then restores the
//! registers of `to` and continues where `to` left off. The first transfer
//! into a freshly [`prepare`]d context lands at the entry function.
//!
//! Only the System V x86-64 and AAPCS64 AArch64 ABIs are implemented. There
//! is no red-zone reliance and no TLS switch: the running thread keeps its
//! thread-locals across transfers.

use std::cell::Cell;
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

/// Default fiber stack size. Fibers created with a non-default size are not
/// recycled through the dead-fiber cache.
pub(crate) const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Minimum usable stack we are willing to create.
pub(crate) const MIN_STACK_SIZE: usize = 16 * 1024;

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    r#"
    .text
    .globl cordage_coro_transfer
    .globl _cordage_coro_transfer
cordage_coro_transfer:
_cordage_coro_transfer:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, [rsi]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
"#
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    r#"
    .text
    .globl cordage_coro_transfer
    .globl _cordage_coro_transfer
cordage_coro_transfer:
_cordage_coro_transfer:
    sub sp, sp, #0xa0
    stp x19, x20, [sp, #0x00]
    stp x21, x22, [sp, #0x10]
    stp x23, x24, [sp, #0x20]
    stp x25, x26, [sp, #0x30]
    stp x27, x28, [sp, #0x40]
    stp x29, x30, [sp, #0x50]
    stp d8,  d9,  [sp, #0x60]
    stp d10, d11, [sp, #0x70]
    stp d12, d13, [sp, #0x80]
    stp d14, d15, [sp, #0x90]
    mov x9, sp
    str x9, [x0]
    ldr x9, [x1]
    mov sp, x9
    ldp d14, d15, [sp, #0x90]
    ldp d12, d13, [sp, #0x80]
    ldp d10, d11, [sp, #0x70]
    ldp d8,  d9,  [sp, #0x60]
    ldp x29, x30, [sp, #0x50]
    ldp x27, x28, [sp, #0x40]
    ldp x25, x26, [sp, #0x30]
    ldp x23, x24, [sp, #0x20]
    ldp x21, x22, [sp, #0x10]
    ldp x19, x20, [sp, #0x00]
    add sp, sp, #0xa0
    ret
"#
);

extern "C" {
    fn cordage_coro_transfer(from: *mut usize, to: *const usize);
}

////////////////////////////////////////////////////////////////////////////////
// Context
////////////////////////////////////////////////////////////////////////////////

/// Saved execution state of a suspended coroutine: its stack pointer. The
/// callee-saved registers themselves live on the coroutine's stack.
#[derive(Default)]
pub(crate) struct Context {
    sp: Cell<usize>,
}

impl Context {
    pub const fn new() -> Self {
        Self { sp: Cell::new(0) }
    }
}

/// Swap CPU context: suspend the running coroutine into `from` and resume
/// `to`. Returns when something transfers back into `from`.
///
/// # Safety
///
/// `to` must hold a valid suspended context ([`prepare`]d or previously saved
/// by a transfer) and must not be running. Both contexts must belong to the
/// calling thread.
#[inline]
pub(crate) unsafe fn transfer(from: &Context, to: &Context) {
    cordage_coro_transfer(from.sp.as_ptr(), to.sp.as_ptr());
}

/// Arrange `ctx` so that the first transfer into it enters `entry` at the top
/// of `stack`. `entry` must never return.
pub(crate) fn prepare(ctx: &Context, stack: &Stack, entry: extern "C" fn() -> !) {
    let top = stack.top() as usize;
    debug_assert_eq!(top % 16, 0);

    #[cfg(target_arch = "x86_64")]
    unsafe {
        // Seven words below the top: six zeroed callee-saved registers and
        // the return address. After the six pops `ret` lands in `entry` with
        // rsp ≡ 8 (mod 16), the state right after a `call`.
        let sp = (top - 64) as *mut usize;
        ptr::write_bytes(sp, 0, 6);
        *sp.add(6) = entry as usize;
        ctx.sp.set(sp as usize);
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        // One full save frame; the x30 slot holds the entry so the final
        // `ret` of the transfer jumps there with sp back at the (16-aligned)
        // stack top.
        let sp = (top - 0xa0) as *mut usize;
        ptr::write_bytes(sp, 0, 0xa0 / 8);
        *sp.add(0x58 / 8) = entry as usize;
        ctx.sp.set(sp as usize);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Stack
////////////////////////////////////////////////////////////////////////////////

/// A coroutine stack: an anonymous private mapping with a `PROT_NONE` guard
/// page at the low end. Unmapped on drop.
pub(crate) struct Stack {
    base: NonNull<u8>,
    /// Total mapped size, guard page included.
    mapped: usize,
    size: usize,
}

impl Stack {
    pub fn new(size: usize) -> Result<Self> {
        let page = page_size();
        let size = round_up(size.max(MIN_STACK_SIZE), page);
        let mapped = size + page;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory {
                requested: mapped,
                object: "fiber stack",
            });
        }
        unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) };
        Ok(Self {
            base: unsafe { NonNull::new_unchecked(ptr.cast()) },
            mapped,
            size,
        })
    }

    /// Highest usable address; stacks grow down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped) };
    }
}

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[inline]
fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn stack_is_aligned_and_sized() {
        let s = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(s.top() as usize % 16, 0);
        assert!(s.size() >= DEFAULT_STACK_SIZE);
    }

    // A raw ping-pong between the test thread and one coroutine, below the
    // fiber machinery.
    thread_local! {
        static TRACE: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
        static MAIN_CTX: Context = const { Context::new() };
        static CORO_CTX: Context = const { Context::new() };
    }

    extern "C" fn bouncer() -> ! {
        TRACE.with(|t| t.borrow_mut().push(1));
        MAIN_CTX.with(|main| CORO_CTX.with(|coro| unsafe { transfer(coro, main) }));
        TRACE.with(|t| t.borrow_mut().push(3));
        MAIN_CTX.with(|main| CORO_CTX.with(|coro| unsafe { transfer(coro, main) }));
        unreachable!("transferred into a finished coroutine");
    }

    #[test]
    fn transfer_round_trips() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        CORO_CTX.with(|ctx| prepare(ctx, &stack, bouncer));
        MAIN_CTX.with(|main| {
            CORO_CTX.with(|coro| unsafe {
                transfer(main, coro);
                TRACE.with(|t| t.borrow_mut().push(2));
                transfer(main, coro);
                TRACE.with(|t| t.borrow_mut().push(4));
            });
        });
        TRACE.with(|t| assert_eq!(*t.borrow(), vec![1, 2, 3, 4]));
    }
}
