use crate::{
    capture,
    coordinator::{Shared, SharedRef},
    event::Signal,
    naming::Timestamp,
    writer::{ProcessHandle, WriteRequest},
};

/// The code the dump thread exits with.
///
/// Purely diagnostic, they don't change the behavior of the dumper, only
/// what is logged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum WorkerExitCode {
    /// The thread was asked to quit
    Success = 0x0,
    /// Waiting on the signals failed
    FailureWait = 0x37DA_1040,
    /// The thread was started without the state it needs
    FailureParam = 0x4EA5_27BB,
    /// The thread didn't exit in time during shutdown and was terminated, or
    /// abandoned
    ForcedTerminate = 0x158B_1154,
}

impl WorkerExitCode {
    pub(crate) fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0x0 => Self::Success,
            0x37DA_1040 => Self::FailureWait,
            0x4EA5_27BB => Self::FailureParam,
            0x158B_1154 => Self::ForcedTerminate,
            _ => return None,
        })
    }
}

/// The body of the dump thread
pub(crate) fn run(shared: Option<SharedRef>) -> WorkerExitCode {
    let Some(shared) = shared else {
        log::error!("the dump thread was started without its shared state");
        return WorkerExitCode::FailureParam;
    };

    let shared = shared.get();
    shared.wait_resumed();

    loop {
        match shared
            .signals
            .wait_any(&[Signal::Request, Signal::Quit], None)
        {
            Ok(Signal::Request) => {
                shared.signals.reset(Signal::Complete);
                create_dump(shared);
                shared.signals.reset(Signal::Request);
                shared.signals.set(Signal::Complete);
            }
            Ok(signal) => {
                debug_assert_eq!(signal, Signal::Quit);
                log::debug!("dump thread is exiting");
                return WorkerExitCode::Success;
            }
            Err(err) => {
                log::error!("dump thread failed waiting for a request: {err:?}");
                return WorkerExitCode::FailureWait;
            }
        }
    }
}

/// Writes a single dump.
///
/// The dump thread itself doesn't allocate, the path is formatted into
/// storage prepared at init. Only the writer, and whatever logger is
/// installed, may touch the heap.
fn create_dump(shared: &Shared) {
    let kind = shared.requested_kind();

    let mut dump_path = shared.dump_path.lock();
    dump_path.format(kind, Timestamp::now());
    let path = dump_path.path();

    let mut file = match dump_path.create() {
        Ok(file) => file,
        Err(err) => {
            log::error!("unable to create dump file '{}': {err}", path.display());
            return;
        }
    };

    let mut writer = shared.writer.lock();
    let Some(writer) = writer.as_mut() else {
        log::error!("no dump writer is loaded");
        return;
    };

    let captured = capture::lock_captured();

    let request = WriteRequest {
        process: ProcessHandle::current(),
        process_id: std::process::id(),
        file: &mut file,
        path,
        flags: kind.flags(),
        exception: captured.is_valid().then_some(&*captured),
    };

    match writer.write_dump(request) {
        Ok(()) => log::info!("wrote {kind} dump to '{}'", path.display()),
        Err(err) => log::error!("unable to write {kind} dump '{}': {err}", path.display()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        DumpKind, DumpWriter, Error,
        coordinator::test_lock,
        naming::{DumpNaming, DumpPath},
    };
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct CountingWriter(Arc<AtomicUsize>);

    impl DumpWriter for CountingWriter {
        fn write_dump(&mut self, request: WriteRequest<'_>) -> Result<(), Error> {
            use std::io::Write;

            self.0.fetch_add(1, Ordering::SeqCst);
            request.file.write_all(b"MDMP")?;
            Ok(())
        }
    }

    fn shared(dir: &std::path::Path, calls: &Arc<AtomicUsize>) -> Shared {
        let naming = DumpNaming {
            product: 'T',
            build_id: "test".to_owned(),
            pid: std::process::id(),
        };

        Shared::new(
            DumpPath::new(dir, &naming).unwrap(),
            Box::new(CountingWriter(calls.clone())),
        )
    }

    #[test]
    fn quit_before_request() {
        let _guard = test_lock();
        let td = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let shared = shared(td.path(), &calls);
        shared.resume();
        shared.signals.set(Signal::Quit);

        assert_eq!(run(Some(SharedRef::from(&shared))), WorkerExitCode::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(td.path()).unwrap().count(), 0);
    }

    #[test]
    fn writes_requested_dump() {
        let _guard = test_lock();
        let td = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let shared = shared(td.path(), &calls);
        shared.resume();
        shared.set_requested_kind(DumpKind::Full);
        shared.signals.set(Signal::Request);

        std::thread::scope(|s| {
            let sr = SharedRef::from(&shared);
            let worker = s.spawn(move || run(Some(sr)));

            shared
                .signals
                .wait(Signal::Complete, Some(std::time::Duration::from_secs(10)))
                .unwrap();
            assert!(!shared.signals.is_set(Signal::Request));

            shared.signals.set(Signal::Quit);
            assert_eq!(worker.join().unwrap(), WorkerExitCode::Success);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let files: Vec<_> = std::fs::read_dir(td.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("CrashFT-"));
        assert!(files[0].ends_with(&format!("-test-pid{}.dmp", std::process::id())));
        assert_eq!(std::fs::read(td.path().join(&files[0])).unwrap(), b"MDMP");
    }

    #[test]
    fn closed_signals_fail() {
        let _guard = test_lock();
        let td = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let shared = shared(td.path(), &calls);
        shared.resume();
        shared.signals.close();

        assert_eq!(
            run(Some(SharedRef::from(&shared))),
            WorkerExitCode::FailureWait
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_state() {
        assert_eq!(run(None), WorkerExitCode::FailureParam);
    }

    #[test]
    fn exit_codes() {
        for code in [
            WorkerExitCode::Success,
            WorkerExitCode::FailureWait,
            WorkerExitCode::FailureParam,
            WorkerExitCode::ForcedTerminate,
        ] {
            assert_eq!(WorkerExitCode::from_u32(code as u32), Some(code));
        }

        assert_eq!(WorkerExitCode::from_u32(259), None);
    }
}
