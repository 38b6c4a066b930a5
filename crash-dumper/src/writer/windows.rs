#![allow(unsafe_code)]

use super::{DumpWriter, WriteRequest};
use crate::Error;
use libloading::os::windows::{LOAD_LIBRARY_SEARCH_SYSTEM32, Library};
use std::{
    ffi::{OsString, c_void},
    os::windows::{ffi::OsStringExt, io::AsRawHandle},
    path::PathBuf,
};
use windows_sys::Win32::System::{LibraryLoader as ll, SystemInformation::GetSystemDirectoryW};

const DBGHELP: &str = "dbghelp.dll";
const MAX_PATH: usize = 260;

/// <https://learn.microsoft.com/en-us/windows/win32/api/minidumpapiset/ns-minidumpapiset-minidump_exception_information>
#[repr(C, packed(4))]
struct MinidumpExceptionInformation {
    thread_id: u32,
    exception_pointers: *const crash_context::EXCEPTION_POINTERS,
    client_pointers: i32,
}

/// <https://learn.microsoft.com/en-us/windows/win32/api/minidumpapiset/nf-minidumpapiset-minidumpwritedump>
type MiniDumpWriteDumpFn = unsafe extern "system" fn(
    process: isize,
    process_id: u32,
    file: isize,
    dump_type: u32,
    exception_param: *const MinidumpExceptionInformation,
    user_stream_param: *const c_void,
    callback_param: *const c_void,
) -> i32;

pub(super) fn load() -> Result<Box<dyn DumpWriter>, Error> {
    let expected = system_dbghelp_path()?;

    // SAFETY: dbghelp has no initialization routines that could misbehave
    // just by being loaded
    let library = unsafe { Library::load_with_flags(DBGHELP, LOAD_LIBRARY_SEARCH_SYSTEM32) }
        .map_err(|err| Error::WriterUnavailable(format!("failed to load {DBGHELP}: {err}")))?;

    // SAFETY: the signature matches the documented one
    let write_dump = unsafe { library.get::<MiniDumpWriteDumpFn>(b"MiniDumpWriteDump\0") }
        .map(|sym| *sym)
        .map_err(|err| {
            Error::WriterUnavailable(format!("MiniDumpWriteDump is missing: {err}"))
        })?;

    // If a dbghelp was already loaded in the process, eg. one shipped next to
    // the executable, the loader hands that one back to us regardless of the
    // search flags, so check where the function actually lives
    let actual = module_path_of(write_dump as *const c_void)?;
    if !paths_equal(&actual, &expected) {
        return Err(Error::UntrustedWriter(actual));
    }

    log::debug!("loaded dump writer from '{}'", actual.display());

    Ok(Box::new(DbgHelpWriter {
        write_dump,
        _library: library,
    }))
}

struct DbgHelpWriter {
    write_dump: MiniDumpWriteDumpFn,
    /// Keeps `write_dump` valid, unloaded on drop
    _library: Library,
}

impl DumpWriter for DbgHelpWriter {
    fn write_dump(&mut self, request: WriteRequest<'_>) -> Result<(), Error> {
        let exception_pointers = request.exception.and_then(|exc| exc.exception_pointers());

        let exception_info = match (request.exception, &exception_pointers) {
            (Some(exc), Some(ep)) => Some(MinidumpExceptionInformation {
                thread_id: exc.thread_id(),
                exception_pointers: ep,
                // The pointers refer to our own address space
                client_pointers: 0,
            }),
            _ => None,
        };

        // SAFETY: all of the pointers passed are valid for the duration of the
        // call
        let ret = unsafe {
            (self.write_dump)(
                request.process.raw() as isize,
                request.process_id,
                request.file.as_raw_handle() as isize,
                request.flags.bits(),
                exception_info
                    .as_ref()
                    .map_or(std::ptr::null(), |ei| ei as *const _),
                std::ptr::null(),
                std::ptr::null(),
            )
        };

        if ret == 0 {
            Err(Error::Io(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

fn system_dbghelp_path() -> Result<PathBuf, Error> {
    let mut buf = [0u16; MAX_PATH];
    // SAFETY: syscall
    let len = unsafe { GetSystemDirectoryW(buf.as_mut_ptr(), buf.len() as u32) } as usize;

    if len == 0 || len > buf.len() {
        return Err(Error::WriterUnavailable(format!(
            "unable to locate the system directory: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut path = PathBuf::from(OsString::from_wide(&buf[..len]));
    path.push(DBGHELP);
    Ok(path)
}

/// Retrieves the path of the module that contains `addr`
fn module_path_of(addr: *const c_void) -> Result<PathBuf, Error> {
    let mut module = 0;

    // SAFETY: syscall, the refcount is unchanged so there's nothing to free
    let found = unsafe {
        ll::GetModuleHandleExW(
            ll::GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS
                | ll::GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            addr.cast(),
            &mut module,
        )
    };

    if found == 0 {
        return Err(Error::WriterUnavailable(format!(
            "unable to find the module containing MiniDumpWriteDump: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut buf = [0u16; MAX_PATH];
    // SAFETY: syscall
    let len = unsafe { ll::GetModuleFileNameW(module, buf.as_mut_ptr(), buf.len() as u32) } as usize;

    if len == 0 || len >= buf.len() {
        return Err(Error::WriterUnavailable(format!(
            "unable to retrieve the path of {DBGHELP}: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(PathBuf::from(OsString::from_wide(&buf[..len])))
}

/// Paths are case insensitive on Windows
fn paths_equal(a: &std::path::Path, b: &std::path::Path) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}
