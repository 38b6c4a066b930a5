//! Freezes the state of a faulting thread into storage that outlives it.
//!
//! [`capture_exception`] runs on the faulting thread, from inside the fault
//! filter, so it must not allocate and does as little as possible. The
//! exception is copied by value into a static slot, as the original may live
//! on a stack that is about to be unwound, or that the fault itself trashed.

#![allow(unsafe_code)]

use crate::CrashContext;
use parking_lot::{Mutex, MutexGuard};
use std::{mem, ptr};

/// What the fault filter should tell the OS to do after a capture
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultDisposition {
    /// We did not take the exception, let other handlers have a look
    ContinueSearch,
    /// The exception was captured, proceed to our handler which will write a
    /// dump
    ExecuteHandler,
}

/// A copy of the exception that is to be written to the next dump.
///
/// There is only one of these per process, it is overwritten by every capture
/// and never cleared, so between dumps it simply holds the last exception.
#[repr(C)]
pub struct CapturedException {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    context: crash_context::CrashContext,
    #[cfg(target_os = "windows")]
    record: crash_context::EXCEPTION_RECORD,
    #[cfg(target_os = "windows")]
    context: crash_context::CONTEXT,
    #[cfg(target_os = "windows")]
    exception_code: i32,
    #[cfg(target_os = "macos")]
    exception_kind: u32,
    #[cfg(target_os = "macos")]
    exception_code: u64,
    thread_id: u32,
    /// False until the first capture, or if the last capture had no exception
    /// information attached to it
    valid: bool,
}

// SAFETY: the contained pointers are either null or point at memory owned by
// the captured process, they are never dereferenced by us
unsafe impl Send for CapturedException {}

/// The size of [`CapturedException`] is too big to reliably keep on the stack
/// of a thread that may have faulted due to a stack overflow, so it is kept as
/// a .bss field.
static CAPTURED: Mutex<CapturedException> = parking_lot::const_mutex(unsafe { mem::zeroed() });

impl CapturedException {
    /// The id of the thread the exception was captured on
    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Whether this holds an exception, as opposed to only a thread id
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The crash context of the captured thread
    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[inline]
    pub fn crash_context(&self) -> Option<&crash_context::CrashContext> {
        self.valid.then_some(&self.context)
    }

    /// The platform exception code
    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[inline]
    pub fn exception_code(&self) -> i64 {
        i64::from(self.context.siginfo.ssi_signo)
    }

    /// The platform exception code
    #[cfg(target_os = "windows")]
    #[inline]
    pub fn exception_code(&self) -> i64 {
        i64::from(self.exception_code)
    }

    /// The platform exception code
    #[cfg(target_os = "macos")]
    #[inline]
    pub fn exception_code(&self) -> i64 {
        self.exception_code as i64
    }

    /// The Mach exception type, eg. `EXC_BAD_ACCESS`
    #[cfg(target_os = "macos")]
    #[inline]
    pub fn exception_kind(&self) -> u32 {
        self.exception_kind
    }

    /// Creates `EXCEPTION_POINTERS` that refer to our own copies of the
    /// exception record and context, rather than the originals
    #[cfg(target_os = "windows")]
    pub fn exception_pointers(&self) -> Option<crash_context::EXCEPTION_POINTERS> {
        self.valid.then(|| crash_context::EXCEPTION_POINTERS {
            ExceptionRecord: (&self.record as *const crash_context::EXCEPTION_RECORD).cast_mut(),
            ContextRecord: (&self.context as *const crash_context::CONTEXT).cast_mut(),
        })
    }
}

/// Copies the exception described by `cc` into the process wide slot.
///
/// This performs no heap allocations. If the slot is currently being read
/// because a dump is in progress, nothing is copied and
/// [`FaultDisposition::ContinueSearch`] is returned.
pub fn capture_exception(cc: &CrashContext) -> FaultDisposition {
    let Some(mut slot) = CAPTURED.try_lock() else {
        debug_print!("capture slot is busy");
        return FaultDisposition::ContinueSearch;
    };

    // SAFETY: the pointers we copy from come from the OS or a context we
    // synthesized, and the slot is plain old data
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                ptr::copy_nonoverlapping(cc, &mut slot.context, 1);
                slot.thread_id = cc.tid as u32;
                slot.valid = true;
            } else if #[cfg(target_os = "windows")] {
                slot.thread_id = cc.thread_id;
                slot.exception_code = cc.exception_code as i32;

                if cc.exception_pointers.is_null() {
                    slot.valid = false;
                } else {
                    let ep = &*cc.exception_pointers;
                    ptr::copy_nonoverlapping(ep.ExceptionRecord, &mut slot.record, 1);
                    ptr::copy_nonoverlapping(ep.ContextRecord, &mut slot.context, 1);
                    slot.valid = true;
                }
            } else if #[cfg(target_os = "macos")] {
                slot.thread_id = cc.thread;

                if let Some(exc) = &cc.exception {
                    slot.exception_kind = exc.kind as u32;
                    slot.exception_code = exc.code as u64;
                    slot.valid = true;
                } else {
                    slot.valid = false;
                }
            }
        }
    }

    debug_print!("captured exception");
    FaultDisposition::ExecuteHandler
}

/// Captures the current thread as if it had hit a breakpoint.
///
/// This is how explicit dump requests without a live fault get a context, the
/// result is the same as the fault filter catching a trap raised on this
/// thread.
#[inline(never)]
pub(crate) fn capture_current_thread() -> FaultDisposition {
    // SAFETY: syscalls, and filling out a context for the calling thread
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                let mut cc: crash_context::CrashContext = mem::zeroed();
                crash_context::crash_context_getcontext(&mut cc.context);

                cfg_if::cfg_if! {
                    if #[cfg(target_arch = "aarch64")] {
                        let fp_ptr = cc.context.uc_mcontext.__reserved.as_ptr().cast::<crash_context::fpsimd_context>();

                        if (*fp_ptr).head.magic == crash_context::FPSIMD_MAGIC {
                            ptr::copy_nonoverlapping(fp_ptr, &mut cc.float_state, 1);
                        }
                    } else if #[cfg(not(target_arch = "arm"))] {
                        if !cc.context.uc_mcontext.fpregs.is_null() {
                            ptr::copy_nonoverlapping(cc.context.uc_mcontext.fpregs, ((&mut cc.float_state) as *mut crash_context::fpregset_t).cast(), 1);
                        }
                    }
                }

                cc.siginfo.ssi_signo = libc::SIGTRAP as u32;
                // SI_USER, ie. we raised it ourselves
                cc.siginfo.ssi_code = 0;
                cc.siginfo.ssi_pid = std::process::id();
                cc.pid = std::process::id() as i32;
                cc.tid = libc::syscall(libc::SYS_gettid) as i32;

                capture_exception(&cc)
            } else if #[cfg(target_os = "windows")] {
                const EXCEPTION_BREAKPOINT: i32 = 0x8000_0003_u32 as i32;

                let mut exception_record: crash_context::EXCEPTION_RECORD = mem::zeroed();
                let mut exception_context = mem::MaybeUninit::zeroed();

                crash_context::capture_context(exception_context.as_mut_ptr());

                let mut exception_context = exception_context.assume_init();
                exception_record.ExceptionCode = EXCEPTION_BREAKPOINT as _;

                let exception_ptrs = crash_context::EXCEPTION_POINTERS {
                    ExceptionRecord: &mut exception_record,
                    ContextRecord: &mut exception_context,
                };

                let cc = crash_context::CrashContext {
                    exception_pointers: &exception_ptrs,
                    process_id: std::process::id(),
                    thread_id: windows_sys::Win32::System::Threading::GetCurrentThreadId(),
                    exception_code: EXCEPTION_BREAKPOINT as _,
                };

                capture_exception(&cc)
            } else {
                let Some(mut slot) = CAPTURED.try_lock() else {
                    return FaultDisposition::ContinueSearch;
                };

                slot.thread_id = libc::pthread_mach_thread_np(libc::pthread_self());
                slot.valid = false;
                FaultDisposition::ExecuteHandler
            }
        }
    }
}

/// Locks the slot for reading, held by the dump thread while writing
#[inline]
pub(crate) fn lock_captured() -> MutexGuard<'static, CapturedException> {
    CAPTURED.lock()
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod test {
    use super::*;

    #[test]
    fn copies_context() {
        let _guard = crate::coordinator::test_lock();

        let mut cc: crash_context::CrashContext = unsafe { mem::zeroed() };
        cc.tid = 1234;
        cc.pid = 5678;
        cc.siginfo.ssi_signo = libc::SIGSEGV as u32;

        assert_eq!(capture_exception(&cc), FaultDisposition::ExecuteHandler);

        // The original can go away without affecting the copy
        drop(cc);

        let captured = lock_captured();
        assert!(captured.is_valid());
        assert_eq!(captured.thread_id(), 1234);
        assert_eq!(captured.exception_code(), i64::from(libc::SIGSEGV));
        assert_eq!(captured.crash_context().unwrap().pid, 5678);
    }

    #[test]
    fn busy_slot_continues_search() {
        let _guard = crate::coordinator::test_lock();

        let cc: crash_context::CrashContext = unsafe { mem::zeroed() };

        let held = lock_captured();
        assert_eq!(capture_exception(&cc), FaultDisposition::ContinueSearch);
        drop(held);

        assert_eq!(capture_exception(&cc), FaultDisposition::ExecuteHandler);
    }

    #[test]
    fn synthesizes_trap() {
        let _guard = crate::coordinator::test_lock();

        assert_eq!(capture_current_thread(), FaultDisposition::ExecuteHandler);

        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;

        let captured = lock_captured();
        assert!(captured.is_valid());
        assert_eq!(captured.thread_id(), tid);
        assert_eq!(captured.exception_code(), i64::from(libc::SIGTRAP));

        let cc = captured.crash_context().unwrap();
        assert_eq!(cc.pid as u32, std::process::id());
    }
}
