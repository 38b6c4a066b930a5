use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("the dump writer is unavailable: {0}")]
    WriterUnavailable(String),
    #[error("the dump writer '{}' is not the system-provided library", .0.display())]
    UntrustedWriter(PathBuf),
    #[error("the dump writer failed: {0}")]
    Writer(String),
    #[error("another crash dumper is already running in this process")]
    AlreadyRunning,
    #[error("dump paths in '{}' would be too long", .0.display())]
    DumpPathTooLong(PathBuf),
    #[error("unable to map memory outside of the global allocator")]
    OutOfMemory,
    #[error(transparent)]
    FaultFilter(#[from] crash_handler::Error),
    #[error("failed to fork the dump writer process")]
    Fork(#[source] std::io::Error),
    #[error("the dump writer process exited with status {0}")]
    ChildFailed(i32),
}
