//! The capability that turns a captured exception into dump bytes.

use crate::{CapturedException, DumpTypeFlags, Error};
use std::{fs::File, path::Path};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        use linux as imp;
    } else if #[cfg(target_os = "windows")] {
        mod windows;
        use windows as imp;
    }
}

/// An opaque handle to the process being dumped, always the current one
#[derive(Copy, Clone, Debug)]
pub struct ProcessHandle(usize);

impl ProcessHandle {
    #[cfg(target_os = "windows")]
    #[inline]
    #[allow(unsafe_code)]
    pub fn current() -> Self {
        // SAFETY: returns a pseudo handle, it doesn't need to be closed
        Self(unsafe { windows_sys::Win32::System::Threading::GetCurrentProcess() } as usize)
    }

    #[cfg(not(target_os = "windows"))]
    #[inline]
    pub fn current() -> Self {
        Self(std::process::id() as usize)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

/// Everything a [`DumpWriter`] needs for a single dump
pub struct WriteRequest<'a> {
    pub process: ProcessHandle,
    pub process_id: u32,
    /// The file the dump is written to, it is created empty before the writer
    /// is called
    pub file: &'a mut File,
    pub path: &'a Path,
    pub flags: DumpTypeFlags,
    /// The exception to record in the dump, `None` if the last capture
    /// didn't have one
    pub exception: Option<&'a CapturedException>,
}

/// Writes the dump for a single request.
///
/// Implementations are called from the dump thread only, and never more than
/// one at a time.
pub trait DumpWriter: Send {
    fn write_dump(&mut self, request: WriteRequest<'_>) -> Result<(), Error>;
}

/// Acquires a [`DumpWriter`] during init.
///
/// If this fails the dumper stays uninitialized.
pub trait WriterLoader {
    fn load(&self) -> Result<Box<dyn DumpWriter>, Error>;
}

/// Loads the writer provided by the operating system.
///
/// * Windows - `MiniDumpWriteDump` from the `dbghelp.dll` in the system
///   directory. A copy loaded from anywhere else is rejected.
/// * Linux - [`minidump_writer`] from a forked child, which requires that
///   this process may be ptraced by its own children.
/// * Everything else - always unavailable.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemWriterLoader;

impl WriterLoader for SystemWriterLoader {
    fn load(&self) -> Result<Box<dyn DumpWriter>, Error> {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "windows"))] {
                imp::load()
            } else {
                Err(Error::WriterUnavailable(format!(
                    "no dump writer is available on {}",
                    std::env::consts::OS
                )))
            }
        }
    }
}
