use crash_dumper::{
    DumpKind, DumperConfig,
    retention::{apply_policy, keep_newest, list_dumps},
};
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

/// Creates a file whose modification time is `age` seconds in the past
fn touch(dir: &Path, name: &str, age: u64) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(age))
        .unwrap();
    path
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[test]
fn keeps_most_recent() {
    let td = tempfile::tempdir().unwrap();

    // Names deliberately don't sort in the same order as modification times
    let ages = [(0, 50), (1, 10), (2, 40), (3, 20), (4, 30)];
    for (i, age) in ages {
        touch(td.path(), &format!("CrashMZ-{i}.dmp"), age);
    }

    let report = keep_newest(td.path(), DumpKind::Minimal, 2);
    assert_eq!(report.kept.len(), 2);
    assert_eq!(report.deleted.len(), 3);
    assert!(report.failed.is_empty());

    // Newest first
    assert_eq!(report.kept[0].file_name().unwrap(), "CrashMZ-1.dmp");
    assert_eq!(report.kept[1].file_name().unwrap(), "CrashMZ-3.dmp");

    assert_eq!(names(td.path()), ["CrashMZ-1.dmp", "CrashMZ-3.dmp"]);
}

#[test]
fn ignores_other_files() {
    let td = tempfile::tempdir().unwrap();

    for i in 0..4 {
        touch(td.path(), &format!("CrashFZ-{i}.dmp"), 100 + i);
        touch(td.path(), &format!("CrashMZ-{i}.dmp"), 100 + i);
    }
    touch(td.path(), "notes.txt", 1000);
    touch(td.path(), "Crash.log", 1000);
    std::fs::create_dir(td.path().join("CrashFZ-directory")).unwrap();

    let report = keep_newest(td.path(), DumpKind::Full, 1);
    assert_eq!(report.kept.len(), 1);
    assert_eq!(report.deleted.len(), 3);

    assert_eq!(
        names(td.path()),
        [
            "Crash.log",
            "CrashFZ-0.dmp",
            "CrashFZ-directory",
            "CrashMZ-0.dmp",
            "CrashMZ-1.dmp",
            "CrashMZ-2.dmp",
            "CrashMZ-3.dmp",
            "notes.txt",
        ]
    );
}

#[test]
fn fewer_than_keep() {
    let td = tempfile::tempdir().unwrap();

    touch(td.path(), "CrashFZ-a.dmp", 5);
    touch(td.path(), "CrashFZ-b.dmp", 10);

    let report = keep_newest(td.path(), DumpKind::Full, 2);
    assert_eq!(report.kept.len(), 2);
    assert!(report.deleted.is_empty());

    let report = keep_newest(td.path(), DumpKind::Full, 0);
    assert!(report.kept.is_empty());
    assert_eq!(report.deleted.len(), 2);
    assert!(names(td.path()).is_empty());
}

#[test]
fn missing_directory() {
    let td = tempfile::tempdir().unwrap();
    let missing = td.path().join("nope");

    let report = keep_newest(&missing, DumpKind::Minimal, 0);
    assert!(report.kept.is_empty());
    assert!(report.deleted.is_empty());
    assert!(report.failed.is_empty());

    assert!(list_dumps(&missing, DumpKind::Minimal).is_err());
}

#[test]
fn default_policy() {
    let td = tempfile::tempdir().unwrap();

    for i in 0..5 {
        touch(td.path(), &format!("CrashFZ-{i}.dmp"), i);
    }
    for i in 0..12 {
        touch(td.path(), &format!("CrashMZ-{i:02}.dmp"), i);
    }

    let reports = apply_policy(td.path(), &DumperConfig::default());

    for (kind, report) in reports {
        match kind {
            DumpKind::Full => {
                assert_eq!(report.kept.len(), 2);
                assert_eq!(report.deleted.len(), 3);
            }
            DumpKind::Minimal => {
                assert_eq!(report.kept.len(), 10);
                assert_eq!(report.deleted.len(), 2);
            }
        }
    }

    let full = list_dumps(td.path(), DumpKind::Full).unwrap();
    assert_eq!(full.len(), 2);
    assert!(full[0].modified >= full[1].modified);
    assert_eq!(full[0].path.file_name().unwrap(), "CrashFZ-0.dmp");
}
