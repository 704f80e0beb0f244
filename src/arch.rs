//! Architecture descriptor.
//!
//! The original source (`launch-cache/Architectures.hpp`) selects pointer
//! width, endianness and a `ReferenceKinds` enumeration at compile time, once
//! per architecture struct (`ppc`, `x86_64`, ...). Per the REDESIGN FLAGS in
//! the spec this becomes one concrete trait, `ArchOps`, read at run time from
//! a value rather than monomorphised per type. All numeric field reads/writes
//! in this crate go through it; no raw host-order access is permitted.

use core::fmt;

/// Byte order of a Mach-O slice's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    #[inline]
    pub fn read_u16(self, data: &[u8]) -> u16 {
        let b: [u8; 2] = data[..2].try_into().unwrap();
        match self {
            Endianness::Little => u16::from_le_bytes(b),
            Endianness::Big => u16::from_be_bytes(b),
        }
    }

    #[inline]
    pub fn read_u32(self, data: &[u8]) -> u32 {
        let b: [u8; 4] = data[..4].try_into().unwrap();
        match self {
            Endianness::Little => u32::from_le_bytes(b),
            Endianness::Big => u32::from_be_bytes(b),
        }
    }

    #[inline]
    pub fn read_u64(self, data: &[u8]) -> u64 {
        let b: [u8; 8] = data[..8].try_into().unwrap();
        match self {
            Endianness::Little => u64::from_le_bytes(b),
            Endianness::Big => u64::from_be_bytes(b),
        }
    }

    #[inline]
    pub fn write_u32(self, data: &mut [u8], value: u32) {
        let b = match self {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };
        data[..4].copy_from_slice(&b);
    }

    #[inline]
    pub fn write_u64(self, data: &mut [u8], value: u64) {
        let b = match self {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };
        data[..8].copy_from_slice(&b);
    }
}

/// The reference-kind enumeration from `Architectures.hpp`, trimmed to the
/// kinds C5/C6 actually act on (absolute pointer vs. PC-relative 32-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Pointer,
    PcRel32,
    TextAbsolute32,
}

/// CPU family, used to pick the ARM back-compat list in C3 and the
/// split-segment fix-up recipes in C5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFamily {
    X86,
    X86_64,
    Arm,
    Arm64,
}

/// One selected (cputype, cpusubtype) pair plus the behavior that depends on
/// it. This is the run-time stand-in for the source's per-architecture
/// trait specializations.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub family: CpuFamily,
    pub pointer_size: u8,
    pub endianness: Endianness,
}

impl fmt::Debug for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arch({:?}, {}-bit)", self.family, self.pointer_size * 8)
    }
}

impl Arch {
    pub fn from_cpu(cpu_type: u32, cpu_subtype: u32) -> Option<Self> {
        use crate::macho_const::*;
        let (family, pointer_size, endianness) = match cpu_type {
            CPU_TYPE_X86 => (CpuFamily::X86, 4, Endianness::Little),
            CPU_TYPE_X86_64 => (CpuFamily::X86_64, 8, Endianness::Little),
            CPU_TYPE_ARM => (CpuFamily::Arm, 4, Endianness::Little),
            CPU_TYPE_ARM64 => (CpuFamily::Arm64, 8, Endianness::Little),
            _ => return None,
        };
        Some(Arch {
            cpu_type,
            cpu_subtype: cpu_subtype & !CPU_SUBTYPE_MASK,
            family,
            pointer_size,
            endianness,
        })
    }

    #[inline]
    pub fn is_64(&self) -> bool {
        self.pointer_size == 8
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        0x1000
    }

    #[inline]
    pub fn page_align(&self, value: u64) -> u64 {
        let page = self.page_size();
        (value + page - 1) & !(page - 1)
    }

    /// Returns true if `a` is back-compat with (can run in place of) a slice
    /// built for `want`, per the ARM subtype family list
    /// `v7 ⊇ v6 ⊇ v5 ⊇ v4`. Non-ARM architectures only match exactly.
    pub fn subtype_compatible(&self, want_subtype: u32) -> bool {
        use crate::macho_const::*;
        if self.cpu_type != CPU_TYPE_ARM {
            return self.cpu_subtype == want_subtype;
        }
        let rank = |sub: u32| -> i32 {
            match sub {
                CPU_SUBTYPE_ARM_V4T => 0,
                CPU_SUBTYPE_ARM_V5TEJ => 1,
                CPU_SUBTYPE_ARM_V6 => 2,
                CPU_SUBTYPE_ARM_V7 | CPU_SUBTYPE_ARM_V7F | CPU_SUBTYPE_ARM_V7S => 3,
                _ => -1,
            }
        };
        let have = rank(self.cpu_subtype);
        let want = rank(want_subtype);
        have >= 0 && want >= 0 && have >= want
    }

    /// Per-arch hook: where writable segments start once TEXT placement
    /// ends. x86_64 leaves a gap to keep DATA within a 32-bit-signed
    /// displacement of TEXT; other arches pack immediately.
    pub fn writable_base(&self, end_text: u64) -> u64 {
        match self.family {
            CpuFamily::X86_64 => self.page_align(end_text),
            _ => self.page_align(end_text),
        }
    }

    /// Per-arch hook: where the read-only (non-writable, non-executable,
    /// non-LINKEDIT) region starts.
    pub fn readonly_base(&self, end_writable: u64, _end_text: u64) -> u64 {
        self.page_align(end_writable)
    }

    /// Whether this architecture forbids a segment that is both writable
    /// and executable (all do, in this builder; kept as a hook per the
    /// source's per-arch behavior table).
    pub fn forbids_writable_executable(&self) -> bool {
        true
    }

    /// Whether `__IMPORT` segments should have their permissions rewritten
    /// from writable to executable (done for 32-bit x86/ARM stub-style
    /// import sections; a no-op elsewhere).
    pub fn rewrites_import_to_executable(&self) -> bool {
        matches!(self.family, CpuFamily::X86 | CpuFamily::Arm) && !self.is_64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho_const::*;

    #[test]
    fn arm_subtype_back_compat() {
        let v7 = Arch::from_cpu(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7).unwrap();
        assert!(v7.subtype_compatible(CPU_SUBTYPE_ARM_V6));
        assert!(v7.subtype_compatible(CPU_SUBTYPE_ARM_V4T));
        let v6 = Arch::from_cpu(CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6).unwrap();
        assert!(!v6.subtype_compatible(CPU_SUBTYPE_ARM_V7));
    }

    #[test]
    fn non_arm_matches_exactly() {
        let a = Arch::from_cpu(CPU_TYPE_X86_64, 3).unwrap();
        assert!(a.subtype_compatible(3));
        assert!(!a.subtype_compatible(4));
    }
}
