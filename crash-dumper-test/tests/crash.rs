#![cfg(target_os = "linux")]

use std::{
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{Command, Output},
};

fn run(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crash-dumper-test"))
        .arg("--root")
        .arg(root)
        .args(["--product", "T"])
        .args(args)
        .output()
        .expect("failed to run crash-dumper-test")
}

/// Asserts the dump directory holds exactly one minidump, named for the
/// expected kind
fn assert_minidump(root: &Path, prefix: &str) {
    let dumps: Vec<_> = std::fs::read_dir(root.join("CrashDumps"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(dumps.len(), 1, "{dumps:?}");

    let name = dumps[0].file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with(prefix), "{name}");
    assert!(name.ends_with(".dmp"), "{name}");

    let md = std::fs::read(&dumps[0]).unwrap();
    assert!(md.len() > 4, "dump is only {} bytes", md.len());
    assert_eq!(&md[..4], b"MDMP");
}

fn run_crash(fault: &str, kind: &str, threaded: bool) {
    let td = tempfile::tempdir().unwrap();

    let mut args = vec!["crash", "--fault", fault, "--kind", kind];
    if threaded {
        args.push("--threaded");
    }

    let output = run(td.path(), &args);
    assert!(
        output.status.signal().is_some(),
        "{fault} didn't kill the process: {:?}\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let prefix = if kind == "full" { "CrashFT-" } else { "CrashMT-" };
    assert_minidump(td.path(), prefix);
}

#[test]
fn segfault_simple() {
    run_crash("segv", "minimal", false);
}

#[test]
fn segfault_threaded() {
    run_crash("segv", "minimal", true);
}

#[test]
fn abort_simple() {
    run_crash("abort", "minimal", false);
}

#[test]
fn trap_simple() {
    run_crash("trap", "minimal", false);
}

#[test]
fn illegal_full() {
    run_crash("illegal", "full", false);
}

#[test]
fn trigger_full() {
    let td = tempfile::tempdir().unwrap();

    let output = run(td.path(), &["trigger", "--kind", "full"]);
    assert!(
        output.status.success(),
        "{:?}\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    assert_minidump(td.path(), "CrashFT-");
}
