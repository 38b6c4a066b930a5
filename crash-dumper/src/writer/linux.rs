#![allow(unsafe_code)]

use super::{DumpWriter, WriteRequest};
use crate::{DumpTypeFlags, Error};
use minidump_writer::{app_memory::AppMemory, minidump_writer::MinidumpWriter};

const PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// `ptrace_scope` mode in which no process may ptrace another
const PTRACE_SCOPE_NONE: &str = "3";

pub(super) fn load() -> Result<Box<dyn DumpWriter>, Error> {
    // Yama isn't present on every kernel, in which case ptrace is only
    // restricted by the regular permission checks, which a child passes
    match std::fs::read_to_string(PTRACE_SCOPE) {
        Ok(scope) if scope.trim() == PTRACE_SCOPE_NONE => {
            return Err(Error::WriterUnavailable(format!(
                "ptrace is disabled by {PTRACE_SCOPE}"
            )));
        }
        Ok(_) => {}
        Err(err) => log::debug!("unable to read {PTRACE_SCOPE}: {err}"),
    }

    Ok(Box::new(ForkingWriter))
}

/// A process can't ptrace itself, so the dump is written by a forked child
/// that attaches to us while we wait for it to exit
struct ForkingWriter;

impl DumpWriter for ForkingWriter {
    fn write_dump(&mut self, request: WriteRequest<'_>) -> Result<(), Error> {
        let pid = request.process_id as i32;
        let context = request.exception.and_then(|exc| exc.crash_context());
        let blamed_thread = context.map_or(pid, |cc| cc.tid);

        // Do as much as possible before forking, the child is a copy of a
        // multithreaded process and should do no more than it needs to
        let app_memory = if request.flags.contains(DumpTypeFlags::WITH_FULL_MEMORY) {
            writable_mappings(pid)
        } else {
            Vec::new()
        };

        let mut writer = MinidumpWriter::new(pid, blamed_thread);
        if let Some(cc) = context {
            writer.set_crash_context(minidump_writer::crash_context::CrashContext {
                inner: cc.clone(),
            });
        }
        if !app_memory.is_empty() {
            writer.set_app_memory(app_memory);
        }

        let _dumpable = SetDumpable::new();

        // SAFETY: the child only runs the writer and then exits without
        // unwinding or running any destructors
        let child = unsafe { libc::fork() };

        match child {
            -1 => Err(Error::Fork(std::io::Error::last_os_error())),
            0 => {
                let code = match writer.dump(request.file) {
                    Ok(_) => 0,
                    Err(_err) => {
                        debug_print!("minidump-writer failed");
                        1
                    }
                };

                // SAFETY: syscall
                unsafe { libc::_exit(code) }
            }
            child => {
                let status = wait_for(child)?;

                if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                    Ok(())
                } else if libc::WIFEXITED(status) {
                    Err(Error::ChildFailed(libc::WEXITSTATUS(status)))
                } else {
                    // Killed by a signal, report it the way a shell would
                    Err(Error::ChildFailed(128 + libc::WTERMSIG(status)))
                }
            }
        }
    }
}

fn wait_for(child: libc::pid_t) -> Result<i32, Error> {
    let mut status = 0;

    loop {
        // SAFETY: syscall
        if unsafe { libc::waitpid(child, &mut status, 0) } != -1 {
            return Ok(status);
        }

        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

/// The readable and writable mappings of the process that aren't backed by a
/// file, ie. the heap, stacks and other anonymous memory
fn writable_mappings(pid: i32) -> Vec<AppMemory> {
    let maps = match proc_maps::get_process_maps(pid) {
        Ok(maps) => maps,
        Err(err) => {
            log::warn!("unable to read memory mappings, full dump will only contain stacks: {err}");
            return Vec::new();
        }
    };

    maps.into_iter()
        .filter(|map| {
            map.is_read()
                && map.is_write()
                && map.filename().is_none_or(|name| {
                    name.to_str()
                        .is_some_and(|name| name == "[heap]" || name == "[stack]")
                })
        })
        .map(|map| AppMemory {
            ptr: map.start(),
            length: map.size(),
        })
        .collect()
}

/// These aren't taken from libc as they are missing on some targets
const PR_GET_DUMPABLE: i32 = 3;
const PR_SET_DUMPABLE: i32 = 4;
const PR_SET_PTRACER: i32 = 0x59616d61;
const PR_SET_PTRACER_ANY: i32 = -1;

/// Allows our children to ptrace us for as long as it is alive, restoring the
/// original state on drop
struct SetDumpable {
    was_dumpable: bool,
}

impl SetDumpable {
    fn new() -> Self {
        // SAFETY: syscalls
        unsafe {
            let was_dumpable = libc::syscall(libc::SYS_prctl, PR_GET_DUMPABLE, 0, 0, 0, 0) > 0;

            if !was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            // Only needed when ptrace_scope is 1, but harmless otherwise. The
            // pid of the child isn't known until after the fork, at which
            // point it's too late
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0);

            Self { was_dumpable }
        }
    }
}

impl Drop for SetDumpable {
    fn drop(&mut self) {
        // SAFETY: syscalls
        unsafe {
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, 0, 0, 0, 0);

            if !self.was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 0, 0, 0, 0);
            }
        }
    }
}
