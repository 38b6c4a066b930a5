use std::fmt;

/// How much of the process ends up in a dump
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DumpKind {
    /// Smallest dump type with call stacks and some supporting variables
    Minimal = b'M',
    /// Largest dump size including complete memory contents of the process
    Full = b'F',
}

impl DumpKind {
    /// The letter that identifies this kind in a dump file name
    #[inline]
    pub fn letter(self) -> char {
        self as u8 as char
    }

    /// The writer flags used for this kind of dump
    pub fn flags(self) -> DumpTypeFlags {
        let minimal =
            DumpTypeFlags::WITH_INDIRECTLY_REFERENCED_MEMORY | DumpTypeFlags::SCAN_MEMORY;

        match self {
            Self::Minimal => minimal,
            Self::Full => {
                minimal
                    | DumpTypeFlags::WITH_FULL_MEMORY
                    | DumpTypeFlags::WITH_DATA_SEGS
                    | DumpTypeFlags::WITH_HANDLE_DATA
                    | DumpTypeFlags::WITH_THREAD_INFO
                    | DumpTypeFlags::WITH_FULL_MEMORY_INFO
                    | DumpTypeFlags::WITH_PRIVATE_READ_WRITE_MEMORY
            }
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            b'M' => Some(Self::Minimal),
            b'F' => Some(Self::Full),
            _ => None,
        }
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minimal => "minimal",
            Self::Full => "full",
        })
    }
}

/// The set of `MINIDUMP_TYPE` flags passed to the writer.
///
/// The values match the Windows definition, other writers only look at the
/// flags they can honor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct DumpTypeFlags(u32);

impl DumpTypeFlags {
    pub const NORMAL: Self = Self(0x0000_0000);
    pub const WITH_DATA_SEGS: Self = Self(0x0000_0001);
    pub const WITH_FULL_MEMORY: Self = Self(0x0000_0002);
    pub const WITH_HANDLE_DATA: Self = Self(0x0000_0004);
    pub const SCAN_MEMORY: Self = Self(0x0000_0010);
    pub const WITH_INDIRECTLY_REFERENCED_MEMORY: Self = Self(0x0000_0040);
    pub const WITH_PRIVATE_READ_WRITE_MEMORY: Self = Self(0x0000_0200);
    pub const WITH_FULL_MEMORY_INFO: Self = Self(0x0000_0800);
    pub const WITH_THREAD_INFO: Self = Self(0x0000_1000);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DumpTypeFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn letters() {
        assert_eq!(DumpKind::Minimal.letter(), 'M');
        assert_eq!(DumpKind::Full.letter(), 'F');

        for kind in [DumpKind::Minimal, DumpKind::Full] {
            assert_eq!(DumpKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(DumpKind::from_u8(b'X'), None);
    }

    #[test]
    fn full_is_superset_of_minimal() {
        let minimal = DumpKind::Minimal.flags();
        let full = DumpKind::Full.flags();

        assert!(full.contains(minimal));
        assert_ne!(full, minimal);
        assert!(!minimal.contains(DumpTypeFlags::WITH_FULL_MEMORY));
        assert_eq!(minimal.bits(), 0x50);
        assert_eq!(full.bits(), 0x1a57);
    }
}
