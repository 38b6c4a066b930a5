// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:

//! In-process crash dump capture.
//!
//! A [`CrashDumper`] owns a single dedicated thread that does nothing but wait
//! for a dump request. Keeping the thread alive and idle for the lifetime of
//! the process means that a dump can still be written when the thread that
//! faulted, or the heap it was using, is in an unknown state.
//!
//! The bytes of the dump itself are produced by a [`DumpWriter`], which is
//! loaded once during [`CrashDumper::init`]. On Windows this is
//! `MiniDumpWriteDump` from the `dbghelp.dll` in the system directory, any
//! other copy is refused. On Linux the dump is written by
//! [`minidump-writer`](https://docs.rs/minidump-writer) from a forked child
//! that ptraces this process.
//!
//! Nothing in the public lifecycle surfaces an error. If something goes wrong
//! the failure is logged and the dumper stays, or becomes, inert, after which
//! every call is a no-op.

pub use crash_context::CrashContext;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
#[allow(unsafe_code)]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len() as _);
    }
}

mod capture;
mod config;
mod coordinator;
mod errors;
mod event;
mod filter;
mod kind;
pub mod naming;
pub mod retention;
mod storage;
mod worker;
mod writer;

pub use capture::{CapturedException, FaultDisposition, capture_exception};
pub use config::DumperConfig;
pub use coordinator::{CrashDumper, DumperState};
pub use errors::Error;
pub use kind::{DumpKind, DumpTypeFlags};
pub use worker::WorkerExitCode;
pub use writer::{DumpWriter, ProcessHandle, SystemWriterLoader, WriteRequest, WriterLoader};

/// The name of the directory, relative to the root path given to
/// [`CrashDumper::init`], that dumps are written to
pub const DUMP_DIRECTORY_NAME: &str = "CrashDumps";
