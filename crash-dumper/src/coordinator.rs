#![allow(unsafe_code)]

use crate::{
    CrashContext, DUMP_DIRECTORY_NAME, DumpKind, DumperConfig, Error, FaultDisposition,
    WorkerExitCode, capture,
    event::{Signal, SignalSet, WaitError},
    filter::FaultFilter,
    naming::{DumpNaming, DumpPath},
    retention,
    storage::SeparateBox,
    worker,
    writer::{DumpWriter, SystemWriterLoader, WriterLoader},
};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
        mpsc,
    },
    thread,
};

/// Sentinel exit code of a dump thread that hasn't exited yet
const STILL_ACTIVE: u32 = 259;

/// Only one dumper may be running per process, as the captured exception slot
/// and the fault filter are process wide
static INSTANCE_RUNNING: AtomicBool = AtomicBool::new(false);

/// The lifecycle of a [`CrashDumper`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DumperState {
    Uninitialized,
    Running,
    ShuttingDown,
    /// Terminal, the dumper can't be initialized again
    ShutDown,
}

/// State shared between the dumper, the dump thread, and the fault filter
pub(crate) struct Shared {
    pub(crate) signals: SignalSet,
    requested_kind: AtomicU8,
    /// Only ever locked by the dump thread
    pub(crate) dump_path: Mutex<DumpPath>,
    /// Only ever locked by the dump thread while it is alive
    pub(crate) writer: Mutex<Option<Box<dyn DumpWriter>>>,
    resumed: AtomicBool,
    worker_exit: AtomicU32,
}

impl Shared {
    pub(crate) fn new(dump_path: DumpPath, writer: Box<dyn DumpWriter>) -> Self {
        Self {
            signals: SignalSet::new(),
            requested_kind: AtomicU8::new(DumpKind::Minimal as u8),
            dump_path: Mutex::new(dump_path),
            writer: Mutex::new(Some(writer)),
            resumed: AtomicBool::new(false),
            worker_exit: AtomicU32::new(STILL_ACTIVE),
        }
    }

    #[inline]
    pub(crate) fn requested_kind(&self) -> DumpKind {
        DumpKind::from_u8(self.requested_kind.load(Ordering::Acquire)).unwrap_or(DumpKind::Minimal)
    }

    #[inline]
    pub(crate) fn set_requested_kind(&self, kind: DumpKind) {
        self.requested_kind.store(kind as u8, Ordering::Release);
    }

    /// Lets the dump thread proceed past [`Self::wait_resumed`], the thread
    /// still needs to be unparked
    #[inline]
    pub(crate) fn resume(&self) {
        self.resumed.store(true, Ordering::Release);
    }

    pub(crate) fn wait_resumed(&self) {
        while !self.resumed.load(Ordering::Acquire) {
            thread::park();
        }
    }

    #[inline]
    pub(crate) fn is_worker_alive(&self) -> bool {
        self.worker_exit.load(Ordering::Acquire) == STILL_ACTIVE
    }

    #[inline]
    fn worker_exit_code(&self) -> Option<WorkerExitCode> {
        WorkerExitCode::from_u32(self.worker_exit.load(Ordering::Acquire))
    }

    /// Asks the dump thread for a dump of the specified kind of whatever is in
    /// the captured exception slot, and blocks until it is written.
    ///
    /// This is also called from the fault filter, so it must not allocate.
    pub(crate) fn request_dump(&self, kind: DumpKind) -> Result<(), WaitError> {
        if !self.is_worker_alive() {
            return Err(WaitError::Closed);
        }

        self.set_requested_kind(kind);
        self.signals.set(Signal::Request);
        self.signals.wait(Signal::Complete, None)?;
        self.signals.reset(Signal::Complete);
        Ok(())
    }
}

/// A pointer to the [`Shared`] state that can be moved to the dump thread and
/// into the fault filter.
#[derive(Copy, Clone)]
pub(crate) struct SharedRef(NonNull<Shared>);

// SAFETY: Shared is Sync, and is either leaked, or only freed once the dump
// thread has exited and the fault filter has been detached
unsafe impl Send for SharedRef {}
unsafe impl Sync for SharedRef {}

impl From<&Shared> for SharedRef {
    #[inline]
    fn from(shared: &Shared) -> Self {
        Self(NonNull::from(shared))
    }
}

impl SharedRef {
    #[inline]
    pub(crate) fn get<'a>(self) -> &'a Shared {
        // SAFETY: see the Send impl
        unsafe { self.0.as_ref() }
    }
}

struct Running {
    shared: SeparateBox<Shared>,
    thread: thread::JoinHandle<()>,
    exit_rx: mpsc::Receiver<WorkerExitCode>,
    filter: Option<FaultFilter>,
}

/// Writes crash dumps from a dedicated thread.
///
/// ```no_run
/// use crash_dumper::{CrashDumper, DumpKind, DumperConfig};
///
/// let mut dumper = CrashDumper::new(DumperConfig::default().product('G'));
/// dumper.init(std::env::temp_dir());
///
/// // Writes a dump of the calling thread, blocking until it is on disk
/// dumper.trigger_dump(DumpKind::Minimal);
///
/// dumper.shutdown();
/// ```
pub struct CrashDumper {
    config: DumperConfig,
    state: DumperState,
    dump_dir: Option<PathBuf>,
    running: Option<Running>,
    exit_code: Option<WorkerExitCode>,
}

impl Default for CrashDumper {
    fn default() -> Self {
        Self::new(DumperConfig::default())
    }
}

impl CrashDumper {
    pub fn new(config: DumperConfig) -> Self {
        Self {
            config,
            state: DumperState::Uninitialized,
            dump_dir: None,
            running: None,
            exit_code: None,
        }
    }

    /// Starts the dumper, writing dumps to `<root>/CrashDumps` with the
    /// writer provided by the operating system.
    ///
    /// See [`Self::init_with_loader`].
    #[inline]
    pub fn init(&mut self, root: impl AsRef<Path>) {
        self.init_with_loader(root, &SystemWriterLoader);
    }

    /// Starts the dumper with a writer acquired from `loader`.
    ///
    /// If anything fails the failure is logged, the dumper stays
    /// [`DumperState::Uninitialized`] and every trigger becomes a no-op.
    pub fn init_with_loader(&mut self, root: impl AsRef<Path>, loader: &dyn WriterLoader) {
        match self.state {
            DumperState::Uninitialized => {}
            DumperState::Running => {
                log::warn!("crash dumper is already initialized");
                return;
            }
            DumperState::ShuttingDown | DumperState::ShutDown => {
                log::warn!("crash dumper has been shut down and can't be initialized again");
                return;
            }
        }

        if INSTANCE_RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!("crash dumps are disabled: {}", Error::AlreadyRunning);
            return;
        }

        match self.start(root.as_ref(), loader) {
            Ok(running) => {
                self.running = Some(running);
                self.state = DumperState::Running;
            }
            Err(err) => {
                INSTANCE_RUNNING.store(false, Ordering::Release);
                log::error!("crash dumps are disabled: {err}");
            }
        }
    }

    fn start(&mut self, root: &Path, loader: &dyn WriterLoader) -> Result<Running, Error> {
        let writer = loader.load()?;

        let dump_dir = root.join(DUMP_DIRECTORY_NAME);
        std::fs::create_dir_all(&dump_dir)?;
        log::info!("storing crash dumps in '{}'", dump_dir.display());

        for (kind, report) in retention::apply_policy(&dump_dir, &self.config) {
            log::debug!(
                "kept {} {kind} dumps, deleted {}, failed to delete {}",
                report.kept.len(),
                report.deleted.len(),
                report.failed.len()
            );
        }

        let naming = DumpNaming {
            product: self.config.product,
            build_id: self.config.build_id.clone(),
            pid: std::process::id(),
        };

        let dump_path = DumpPath::new(&dump_dir, &naming)?;
        let shared = SeparateBox::new(Shared::new(dump_path, writer))?;
        let shared_ref = SharedRef::from(&*shared);
        let (exit_tx, exit_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("crash-dumper".to_owned())
            .spawn(move || {
                let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    worker::run(Some(shared_ref))
                })) {
                    Ok(code) => code,
                    Err(_) => {
                        log::error!("dump thread panicked");
                        WorkerExitCode::FailureWait
                    }
                };

                let shared = shared_ref.get();
                if code != WorkerExitCode::Success {
                    // Release anyone still waiting for a dump that will never
                    // be written
                    shared.signals.close();
                }
                shared.worker_exit.store(code as u32, Ordering::Release);

                // The receiver is gone if the dumper abandoned us
                let _ = exit_tx.send(code);
            })?;

        shared.resume();
        thread.thread().unpark();

        let filter = if self.config.install_fault_filter {
            match FaultFilter::install(shared_ref, self.config.fault_kind) {
                Ok(filter) => Some(filter),
                Err(err) => {
                    log::error!("unable to install fault filter, only explicit dumps will be written: {err}");
                    None
                }
            }
        } else {
            None
        };

        self.dump_dir = Some(dump_dir);

        Ok(Running {
            shared,
            thread,
            exit_rx,
            filter,
        })
    }

    /// Stops the dump thread and releases everything acquired by init.
    ///
    /// If the thread doesn't exit within the configured grace period, eg.
    /// because it is stuck writing a dump, it is forcefully terminated on
    /// Windows, or abandoned on other platforms, which may leave a partially
    /// written dump behind.
    ///
    /// Calling this more than once, or without a successful init, is fine.
    pub fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            self.state = DumperState::ShutDown;
            return;
        };

        self.state = DumperState::ShuttingDown;

        let Running {
            shared,
            thread,
            exit_rx,
            filter,
        } = running;

        // Detach first so that a fault during shutdown doesn't wait on a
        // thread that is going away
        drop(filter);

        shared.signals.set(Signal::Quit);

        let code = match exit_rx.recv_timeout(self.config.shutdown_grace) {
            Ok(code) => {
                if thread.join().is_err() {
                    log::error!("failed to join dump thread");
                }

                shared.signals.close();
                // Drops the writer, unloading it
                drop(shared);
                code
            }
            Err(_) => {
                log::warn!(
                    "dump thread didn't exit within {:?}, terminating it",
                    self.config.shutdown_grace
                );

                terminate(thread);
                shared.signals.close();

                // The thread may still be using the shared state and the writer,
                // so neither can be freed
                let _leaked = shared.leak();
                WorkerExitCode::ForcedTerminate
            }
        };

        log::info!("crash dumper shut down, dump thread exited with {code:?}");

        self.exit_code = Some(code);
        self.state = DumperState::ShutDown;

        if code == WorkerExitCode::ForcedTerminate {
            // The old thread may own the captured exception slot forever, a
            // new dumper would never be able to capture anything
            log::warn!("no other crash dumper can be started in this process");
        } else {
            INSTANCE_RUNNING.store(false, Ordering::Release);
        }
    }

    /// Writes a dump of the calling thread, blocking until it has been
    /// written.
    ///
    /// No trap is actually raised, the calling thread's context is captured
    /// directly, which produces the same dump the fault filter would for a
    /// breakpoint on this thread.
    ///
    /// This is a no-op if the dumper isn't running.
    pub fn trigger_dump(&self, kind: DumpKind) {
        let Some(shared) = self.running_shared(kind) else {
            return;
        };

        if capture::capture_current_thread() != FaultDisposition::ExecuteHandler {
            log::warn!("a dump is already in progress, ignoring {kind} dump request");
            return;
        }

        Self::request(shared, kind);
    }

    /// Writes a dump of the exception described by `cc`, blocking until it
    /// has been written.
    ///
    /// This is a no-op if the dumper isn't running.
    pub fn trigger_dump_for_exception(&self, cc: &CrashContext, kind: DumpKind) {
        let Some(shared) = self.running_shared(kind) else {
            return;
        };

        if capture::capture_exception(cc) != FaultDisposition::ExecuteHandler {
            log::warn!("a dump is already in progress, ignoring {kind} dump request");
            return;
        }

        Self::request(shared, kind);
    }

    fn running_shared(&self, kind: DumpKind) -> Option<&Shared> {
        let Some(running) = &self.running else {
            log::warn!("crash dumper isn't running, ignoring {kind} dump request");
            return None;
        };

        let shared = &*running.shared;
        if !shared.is_worker_alive() {
            log::error!(
                "dump thread has exited with {:?}, ignoring {kind} dump request",
                shared.worker_exit_code()
            );
            return None;
        }

        Some(shared)
    }

    fn request(shared: &Shared, kind: DumpKind) {
        if let Err(err) = shared.request_dump(kind) {
            log::error!("failed waiting for {kind} dump to complete: {err:?}");
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state == DumperState::Running
    }

    #[inline]
    pub fn state(&self) -> DumperState {
        self.state
    }

    /// The directory dumps are written to, once initialized
    #[inline]
    pub fn dump_directory(&self) -> Option<&Path> {
        self.dump_dir.as_deref()
    }

    /// The exit code of the dump thread, `None` if it is still running or was
    /// never started
    pub fn worker_exit_code(&self) -> Option<WorkerExitCode> {
        match &self.running {
            Some(running) => running.shared.worker_exit_code(),
            None => self.exit_code,
        }
    }
}

impl Drop for CrashDumper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(target_os = "windows")]
fn terminate(thread: thread::JoinHandle<()>) {
    use std::os::windows::io::AsRawHandle;

    // SAFETY: the handle is valid until the JoinHandle is dropped
    let ret = unsafe {
        windows_sys::Win32::System::Threading::TerminateThread(
            thread.as_raw_handle() as isize,
            WorkerExitCode::ForcedTerminate as u32,
        )
    };

    if ret == 0 {
        log::error!(
            "failed to terminate dump thread: {}",
            std::io::Error::last_os_error()
        );
    }

    // Dropping closes the handle without joining the thread
}

#[cfg(not(target_os = "windows"))]
fn terminate(thread: thread::JoinHandle<()>) {
    // There is no way to safely kill a single thread, so it is detached
    // instead, it will either finish on its own or die with the process
    drop(thread);
}

/// Serializes tests that touch process wide state, the captured exception
/// slot and the single instance guard
#[cfg(test)]
pub(crate) fn test_lock() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = parking_lot::const_mutex(());
    LOCK.lock()
}
