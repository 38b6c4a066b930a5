//! Dump file naming.
//!
//! Every dump file is named
//! `Crash<kind><product>-<YYYYMMDD>-<HHMMSS>-<build id>-pid<pid>.dmp`, eg.
//! `CrashFZ-20250102-030405-abc1234-pid42.dmp`. The timestamp only has second
//! resolution, so two dumps of the same kind written by the same process in
//! the same second share a name, the latter replacing the former. Since only a
//! single dump is ever in flight per process this is only realistic across a
//! restart that reuses the pid.
//!
//! Characters that can't appear in a file name, path separators included, are
//! replaced with `_` so that a dump always lands directly in the dump
//! directory.
//!
//! The dump thread formats names into a [`DumpPath`] prepared at init, so
//! naming and creating a dump file never touches the heap.

#![allow(unsafe_code)]

use crate::{DumpKind, Error};
use std::{
    ffi::OsStr,
    fmt::{self, Write as _},
    fs::File,
    io::{self, Write as _},
    path::{MAIN_SEPARATOR, Path},
};

/// The prefix shared by every dump file
pub const DUMP_FILE_PREFIX: &str = "Crash";

/// The extension of every dump file
pub const DUMP_FILE_EXTENSION: &str = "dmp";

/// The longest dump file path, in bytes, that can be written
pub const MAX_DUMP_PATH: usize = 4096;

/// The longest `-<build id>-pid<pid>.dmp`
const MAX_SUFFIX: usize = 256;

/// `Crash<kind><product>-YYYYMMDD-HHMMSS`, the product may be up to 4 bytes
const MAX_STEM: usize = DUMP_FILE_PREFIX.len() + 1 + 4 + 16;

/// A local wall clock time with second resolution
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    /// The current local time, read without allocating.
    ///
    /// The first call in a process may load the time zone rules, which does
    /// allocate.
    #[cfg(unix)]
    pub fn now() -> Self {
        // SAFETY: syscalls, tm is plain data that localtime_r fills out
        unsafe {
            let now = libc::time(std::ptr::null_mut());
            let mut tm: libc::tm = std::mem::zeroed();
            if libc::localtime_r(&now, &mut tm).is_null() {
                libc::gmtime_r(&now, &mut tm);
            }

            Self {
                year: (tm.tm_year + 1900) as u16,
                month: (tm.tm_mon + 1) as u8,
                day: tm.tm_mday as u8,
                hour: tm.tm_hour as u8,
                minute: tm.tm_min as u8,
                second: tm.tm_sec as u8,
            }
        }
    }

    /// The current local time, read without allocating
    #[cfg(target_os = "windows")]
    pub fn now() -> Self {
        use windows_sys::Win32::{
            Foundation::SYSTEMTIME, System::SystemInformation::GetLocalTime,
        };

        // SAFETY: syscall, SYSTEMTIME is plain data that GetLocalTime fills out
        let st = unsafe {
            let mut st: SYSTEMTIME = std::mem::zeroed();
            GetLocalTime(&mut st);
            st
        };

        Self {
            year: st.wYear,
            month: st.wMonth as u8,
            day: st.wDay as u8,
            hour: st.wHour as u8,
            minute: st.wMinute as u8,
            second: st.wSecond as u8,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}{:02}{:02}-{:02}{:02}{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

#[inline]
fn file_name_char(c: char) -> char {
    match c {
        '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
        c if c.is_control() => '_',
        c => c,
    }
}

/// `Crash<kind><product>-<timestamp>`
struct Stem {
    kind: DumpKind,
    product: char,
    timestamp: Timestamp,
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{DUMP_FILE_PREFIX}{}{}-{}",
            self.kind.letter(),
            file_name_char(self.product),
            self.timestamp
        )
    }
}

/// `-<build id>-pid<pid>.dmp`
struct Suffix<'n> {
    build_id: &'n str,
    pid: u32,
}

impl fmt::Display for Suffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('-')?;
        for c in self.build_id.chars() {
            f.write_char(file_name_char(c))?;
        }
        write!(f, "-pid{}.{DUMP_FILE_EXTENSION}", self.pid)
    }
}

/// The parts of a dump file name that stay the same for the lifetime of a
/// process
#[derive(Clone, Debug)]
pub struct DumpNaming {
    /// Single letter identifying the product that wrote the dump
    pub product: char,
    /// The build identifier, typically a short commit hash
    pub build_id: String,
    /// The process the dumps are written for
    pub pid: u32,
}

impl DumpNaming {
    /// Creates the name of a dump of the specified kind written at `timestamp`
    pub fn file_name(&self, kind: DumpKind, timestamp: &Timestamp) -> String {
        format!("{}{}", self.stem(kind, *timestamp), self.suffix())
    }

    #[inline]
    fn stem(&self, kind: DumpKind, timestamp: Timestamp) -> Stem {
        Stem {
            kind,
            product: self.product,
            timestamp,
        }
    }

    #[inline]
    fn suffix(&self) -> Suffix<'_> {
        Suffix {
            build_id: &self.build_id,
            pid: self.pid,
        }
    }
}

/// The file name prefix shared by all dumps of the specified kind, eg.
/// `CrashM`
#[inline]
pub fn kind_prefix(kind: DumpKind) -> String {
    format!("{DUMP_FILE_PREFIX}{}", kind.letter())
}

/// The path of the next dump, formatted in place.
///
/// Holds `<dir>/` followed by the file name of the last formatted dump, and
/// a copy of the parts of the name that never change.
pub(crate) struct DumpPath {
    buf: [u8; MAX_DUMP_PATH],
    /// The length of `<dir>/`
    dir_len: usize,
    /// The length of the whole path, excluding the NUL terminator
    len: usize,
    product: char,
    suffix: [u8; MAX_SUFFIX],
    suffix_len: usize,
}

impl DumpPath {
    pub(crate) fn new(dir: &Path, naming: &DumpNaming) -> Result<Self, Error> {
        let too_long = || Error::DumpPathTooLong(dir.to_owned());

        let mut dp = Self {
            buf: [0; MAX_DUMP_PATH],
            dir_len: 0,
            len: 0,
            product: naming.product,
            suffix: [0; MAX_SUFFIX],
            suffix_len: 0,
        };

        let mut suffix = &mut dp.suffix[..];
        write!(suffix, "{}", naming.suffix()).map_err(|_e| too_long())?;
        dp.suffix_len = MAX_SUFFIX - suffix.len();

        let dir = dir.as_os_str().as_encoded_bytes();
        let mut rest = &mut dp.buf[..];
        rest.write_all(dir).map_err(|_e| too_long())?;
        if !dir.is_empty() && !dir.ends_with(&[MAIN_SEPARATOR as u8]) {
            rest.write_all(&[MAIN_SEPARATOR as u8])
                .map_err(|_e| too_long())?;
        }
        dp.dir_len = MAX_DUMP_PATH - rest.len();

        // Room for the longest name plus the terminator
        if dp.dir_len + MAX_STEM + dp.suffix_len + 1 > MAX_DUMP_PATH {
            return Err(too_long());
        }

        dp.len = dp.dir_len;

        // The first lookup loads the time zone rules, which is better done
        // here than on the dump thread
        let _ = Timestamp::now();

        Ok(dp)
    }

    /// Formats the path of a dump of the specified kind written at
    /// `timestamp`, retrieved with [`Self::path`]
    pub(crate) fn format(&mut self, kind: DumpKind, timestamp: Timestamp) {
        let stem = Stem {
            kind,
            product: self.product,
            timestamp,
        };

        let mut rest = &mut self.buf[self.dir_len..];
        let capacity = rest.len();
        // Neither can fail, there is room for the longest name, checked in new
        let _ = write!(rest, "{stem}");
        let _ = rest.write_all(&self.suffix[..self.suffix_len]);
        let written = capacity - rest.len();

        self.len = self.dir_len + written;
        self.buf[self.len] = 0;
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        // SAFETY: the buffer holds the encoded bytes of a path followed by
        // UTF-8
        Path::new(unsafe { OsStr::from_encoded_bytes_unchecked(&self.buf[..self.len]) })
    }

    /// Creates, or truncates, the file at [`Self::path`] for reading and
    /// writing
    #[cfg(unix)]
    pub(crate) fn create(&self) -> io::Result<File> {
        use std::os::fd::FromRawFd;

        let path = std::ffi::CStr::from_bytes_with_nul(&self.buf[..=self.len])
            .map_err(|_e| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: syscall with a NUL terminated path
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                0o666 as libc::c_uint,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: we own the descriptor we just opened
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    /// Creates, or truncates, the file at [`Self::path`] for reading and
    /// writing
    #[cfg(target_os = "windows")]
    pub(crate) fn create(&self) -> io::Result<File> {
        use std::os::windows::{ffi::OsStrExt, io::FromRawHandle};
        use windows_sys::Win32::{Foundation as wf, Storage::FileSystem as fs};

        let mut wide = [0u16; MAX_DUMP_PATH];
        let mut len = 0;
        for unit in self.path().as_os_str().encode_wide() {
            if len + 1 >= wide.len() {
                return Err(io::ErrorKind::InvalidInput.into());
            }
            wide[len] = unit;
            len += 1;
        }

        // SAFETY: syscall with a NUL terminated path
        let handle = unsafe {
            fs::CreateFileW(
                wide.as_ptr(),
                fs::FILE_GENERIC_READ | fs::FILE_GENERIC_WRITE,
                fs::FILE_SHARE_READ | fs::FILE_SHARE_WRITE | fs::FILE_SHARE_DELETE,
                std::ptr::null(),
                fs::CREATE_ALWAYS,
                fs::FILE_ATTRIBUTE_NORMAL,
                0,
            )
        };

        if handle == wf::INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: we own the handle we just opened
        Ok(unsafe { File::from_raw_handle(handle as _) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn timestamp() -> Timestamp {
        Timestamp {
            year: 2025,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
        }
    }

    #[test]
    fn full_dump_name() {
        let naming = DumpNaming {
            product: 'Z',
            build_id: "abc1234".to_owned(),
            pid: 42,
        };

        assert_eq!(
            naming.file_name(DumpKind::Full, &timestamp()),
            "CrashFZ-20250102-030405-abc1234-pid42.dmp"
        );
    }

    #[test]
    fn minimal_dump_name() {
        let naming = DumpNaming {
            product: 'G',
            build_id: "deadbee".to_owned(),
            pid: 31337,
        };

        let name = naming.file_name(DumpKind::Minimal, &timestamp());
        assert_eq!(name, "CrashMG-20250102-030405-deadbee-pid31337.dmp");
        assert!(name.starts_with(&kind_prefix(DumpKind::Minimal)));
        assert!(!name.starts_with(&kind_prefix(DumpKind::Full)));
    }

    #[test]
    fn separators_are_replaced() {
        let naming = DumpNaming {
            product: '/',
            build_id: "feature/x\\y:z".to_owned(),
            pid: 1,
        };

        assert_eq!(
            naming.file_name(DumpKind::Minimal, &timestamp()),
            "CrashM_-20250102-030405-feature_x_y_z-pid1.dmp"
        );
    }

    #[test]
    fn formats_in_place() {
        let naming = DumpNaming {
            product: 'Z',
            build_id: "release/1.0".to_owned(),
            pid: 7,
        };

        let dir = Path::new("dumps");
        let mut dp = DumpPath::new(dir, &naming).unwrap();

        dp.format(DumpKind::Full, timestamp());
        assert_eq!(dp.path().parent(), Some(dir));
        assert_eq!(
            dp.path().file_name().unwrap().to_str().unwrap(),
            naming.file_name(DumpKind::Full, &timestamp())
        );

        // A shorter name completely replaces the previous one
        dp.format(DumpKind::Minimal, Timestamp { year: 999, ..timestamp() });
        assert_eq!(
            dp.path().file_name().unwrap().to_str().unwrap(),
            "CrashMZ-09990102-030405-release_1.0-pid7.dmp"
        );
    }

    #[test]
    fn creates_file() {
        let td = tempfile::tempdir().unwrap();
        let naming = DumpNaming {
            product: 'Z',
            build_id: "abc1234".to_owned(),
            pid: 7,
        };

        let mut dp = DumpPath::new(td.path(), &naming).unwrap();
        dp.format(DumpKind::Minimal, Timestamp::now());

        {
            use std::io::Write;
            let mut file = dp.create().unwrap();
            file.write_all(b"first dump").unwrap();
        }

        // Truncates what was there
        {
            use std::io::Write;
            let mut file = dp.create().unwrap();
            file.write_all(b"MDMP").unwrap();
        }

        assert_eq!(std::fs::read(dp.path()).unwrap(), b"MDMP");
        assert_eq!(std::fs::read_dir(td.path()).unwrap().count(), 1);
    }

    #[test]
    fn rejects_long_directory() {
        let naming = DumpNaming {
            product: 'Z',
            build_id: "abc1234".to_owned(),
            pid: 7,
        };

        let dir = "d".repeat(MAX_DUMP_PATH);
        assert!(matches!(
            DumpPath::new(Path::new(&dir), &naming),
            Err(Error::DumpPathTooLong(_))
        ));
    }

    #[test]
    fn now_is_plausible() {
        let now = Timestamp::now();
        assert!(now.year >= 2024);
        assert!((1..=12).contains(&now.month));
        assert!((1..=31).contains(&now.day));
        assert!(now.hour < 24);
    }
}
