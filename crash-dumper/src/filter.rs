//! Routes unhandled faults into the dumper.

#![allow(unsafe_code)]

use crate::{DumpKind, Error, FaultDisposition, capture, coordinator::SharedRef};
use crash_handler::{CrashEventResult, CrashHandler};

/// The installed process wide fault filter, detached on drop
pub(crate) struct FaultFilter {
    _handler: CrashHandler,
}

impl FaultFilter {
    /// Installs the filter, a fault captures the faulting thread and then
    /// waits for a dump of the specified kind to be written before letting
    /// the process die
    pub(crate) fn install(shared: SharedRef, kind: DumpKind) -> Result<Self, Error> {
        // SAFETY: the closure only copies the exception into static storage
        // and waits on the signals, neither of which allocate
        let handler = CrashHandler::attach(unsafe {
            crash_handler::make_crash_event(move |cc: &crash_handler::CrashContext| {
                debug_print!("fault filter invoked");

                if capture::capture_exception(cc) != FaultDisposition::ExecuteHandler {
                    return CrashEventResult::Handled(false);
                }

                if shared.get().request_dump(kind).is_err() {
                    debug_print!("dump thread is unavailable");
                    return CrashEventResult::Handled(false);
                }

                debug_print!("fault dump complete");
                CrashEventResult::Handled(true)
            })
        })?;

        log::debug!("installed fault filter, unhandled faults write {kind} dumps");

        Ok(Self { _handler: handler })
    }
}
