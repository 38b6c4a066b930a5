use crate::DumpKind;
use std::time::Duration;

/// Settings for a [`crate::CrashDumper`].
///
/// The defaults keep 2 full and 10 minimal dumps, give the dump thread 3
/// seconds to exit on shutdown, and install the process wide fault filter.
#[derive(Clone, Debug)]
pub struct DumperConfig {
    /// Single letter identifying the product in dump file names
    pub product: char,
    /// Build identifier embedded in dump file names
    pub build_id: String,
    /// The number of full dumps kept when pruning at init
    pub keep_full: usize,
    /// The number of minimal dumps kept when pruning at init
    pub keep_minimal: usize,
    /// How long shutdown waits for the dump thread before giving up on it
    pub shutdown_grace: Duration,
    /// Whether unhandled faults are routed to the dumper
    pub install_fault_filter: bool,
    /// The kind of dump written for an unhandled fault
    pub fault_kind: DumpKind,
}

impl Default for DumperConfig {
    fn default() -> Self {
        Self {
            product: 'Z',
            build_id: env!("CARGO_PKG_VERSION").to_owned(),
            keep_full: 2,
            keep_minimal: 10,
            shutdown_grace: Duration::from_secs(3),
            install_fault_filter: true,
            fault_kind: DumpKind::Minimal,
        }
    }
}

impl DumperConfig {
    #[inline]
    pub fn product(mut self, product: char) -> Self {
        self.product = product;
        self
    }

    #[inline]
    pub fn build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = build_id.into();
        self
    }

    #[inline]
    pub fn keep(mut self, kind: DumpKind, count: usize) -> Self {
        match kind {
            DumpKind::Full => self.keep_full = count,
            DumpKind::Minimal => self.keep_minimal = count,
        }
        self
    }

    #[inline]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[inline]
    pub fn install_fault_filter(mut self, install: bool) -> Self {
        self.install_fault_filter = install;
        self
    }

    #[inline]
    pub fn fault_kind(mut self, kind: DumpKind) -> Self {
        self.fault_kind = kind;
        self
    }

    /// The number of dumps of the specified kind that are kept
    #[inline]
    pub fn keep_count(&self, kind: DumpKind) -> usize {
        match kind {
            DumpKind::Full => self.keep_full,
            DumpKind::Minimal => self.keep_minimal,
        }
    }
}
