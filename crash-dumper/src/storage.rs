//! Backing storage that doesn't come from the global allocator.
//!
//! The dumper is most needed when the process has corrupted its own heap, so
//! the state shared with the dump thread is placed in pages obtained directly
//! from the OS rather than next to the allocations it might be asked to
//! explain.

#![allow(unsafe_code)]

use crate::Error;
use std::{mem, ptr::NonNull};

pub(crate) struct SeparateBox<T> {
    ptr: NonNull<T>,
}

// SAFETY: SeparateBox owns its value the same as Box does
unsafe impl<T: Send> Send for SeparateBox<T> {}
unsafe impl<T: Sync> Sync for SeparateBox<T> {}

impl<T> SeparateBox<T> {
    pub(crate) fn new(value: T) -> Result<Self, Error> {
        // Page granularity covers the alignment of anything we store
        debug_assert!(mem::align_of::<T>() <= 4096);

        let ptr = os::alloc(Self::size()).ok_or(Error::OutOfMemory)?;
        let ptr = ptr.cast::<T>();

        // SAFETY: the allocation is at least size_of::<T> and page aligned
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr })
    }

    /// Leaks the storage, the value is never dropped and the pages are never
    /// returned to the OS.
    ///
    /// This is used when something we can't stop may still be using the value.
    #[allow(clippy::mem_forget)]
    pub(crate) fn leak(self) -> &'static T
    where
        T: 'static,
    {
        let ptr = self.ptr;
        mem::forget(self);
        // SAFETY: the pages are never unmapped
        unsafe { ptr.as_ref() }
    }

    #[inline]
    fn size() -> usize {
        mem::size_of::<T>().max(1)
    }
}

impl<T> std::ops::Deref for SeparateBox<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: initialized in new and valid until drop
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for SeparateBox<T> {
    fn drop(&mut self) {
        // SAFETY: we own the value and the mapping
        unsafe {
            std::ptr::drop_in_place(self.ptr.as_ptr());
            os::free(self.ptr.cast(), Self::size());
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod os {
            use std::ptr::{self, NonNull};

            pub(super) fn alloc(size: usize) -> Option<NonNull<u8>> {
                // SAFETY: syscall
                let ptr = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        size,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANON,
                        -1,
                        0,
                    )
                };

                if ptr == libc::MAP_FAILED {
                    None
                } else {
                    NonNull::new(ptr.cast())
                }
            }

            pub(super) unsafe fn free(ptr: NonNull<u8>, size: usize) {
                let r = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
                debug_assert_eq!(r, 0, "munmap failed");
            }
        }
    } else if #[cfg(target_os = "windows")] {
        mod os {
            use std::ptr::{self, NonNull};
            use windows_sys::Win32::System::Memory as mem;

            pub(super) fn alloc(size: usize) -> Option<NonNull<u8>> {
                // SAFETY: syscall
                let ptr = unsafe {
                    mem::VirtualAlloc(
                        ptr::null(),
                        size,
                        mem::MEM_COMMIT | mem::MEM_RESERVE,
                        mem::PAGE_READWRITE,
                    )
                };

                NonNull::new(ptr.cast())
            }

            pub(super) unsafe fn free(ptr: NonNull<u8>, _size: usize) {
                let r = unsafe { mem::VirtualFree(ptr.as_ptr().cast(), 0, mem::MEM_RELEASE) };
                debug_assert_ne!(r, 0, "VirtualFree failed");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::SeparateBox;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct Tracked(Arc<AtomicUsize>, [u64; 1024]);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn drops_value() {
        let drops = Arc::new(AtomicUsize::new(0));

        let sb = SeparateBox::new(Tracked(drops.clone(), [7; 1024])).unwrap();
        assert_eq!(sb.1[1023], 7);
        drop(sb);

        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn leak_never_drops() {
        let drops = Arc::new(AtomicUsize::new(0));

        let leaked = SeparateBox::new(Tracked(drops.clone(), [1; 1024]))
            .unwrap()
            .leak();
        assert_eq!(leaked.1[0], 1);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
    }
}
