//! C2 — layout view.
//!
//! Parses a single Mach-O slice into segments, dependency list, and the
//! cached offsets of the symbol table / dynamic symbol table / dyld-info
//! streams that the later phases need, and exposes the mutable "new
//! address" / "mapped address" per segment that the placer and buffer
//! allocator fill in. Grounded on `MachOLayoutAbstraction`/`MachOLayout` in
//! `launch-cache/MachOLayout.hpp`.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::macho_const::*;
use crate::raw::{self, LoadCommandIter};

/// A section inside a segment, trimmed to the fields C5/C6 need (indirect
/// symbol table walking, lazy/non-lazy pointer slides).
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub name: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub section_type: u32,
    /// For indirect-symbol-table sections, the starting index into that
    /// table (`reserved1`).
    pub indirect_sym_index: u32,
}

/// A mutable view onto one Mach-O segment command (§3 Segment).
#[derive(Debug, Clone)]
pub struct Segment {
    pub orig_addr: u64,
    pub orig_vmsize: u64,
    pub orig_file_off: u64,
    pub orig_file_size: u64,
    pub orig_perms: u32,
    pub name: String,
    pub sections: Vec<SectionInfo>,

    pub size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub perms: u32,
    pub new_addr: Option<u64>,
    pub mapped_addr: Option<u64>,
}

impl Segment {
    pub fn readable(&self) -> bool {
        self.perms & VM_PROT_READ != 0
    }
    pub fn writable(&self) -> bool {
        self.perms & VM_PROT_WRITE != 0
    }
    pub fn executable(&self) -> bool {
        self.perms & VM_PROT_EXECUTE != 0
    }

    /// Resets the mutable working fields back to the segment's originals,
    /// as the placer does at the start of each build.
    pub fn reset(&mut self) {
        self.size = self.orig_vmsize;
        self.file_off = self.orig_file_off;
        self.file_size = self.orig_file_size;
        self.perms = self.orig_perms;
        self.new_addr = None;
        self.mapped_addr = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Dylib,
    Bundle,
    Executable,
    DylibStub,
    Dylinker,
}

impl FileType {
    fn from_raw(v: u32) -> Option<Self> {
        match v {
            MH_EXECUTE => Some(FileType::Executable),
            MH_DYLIB => Some(FileType::Dylib),
            MH_BUNDLE => Some(FileType::Bundle),
            MH_DYLIB_STUB => Some(FileType::DylibStub),
            MH_DYLINKER => Some(FileType::Dylinker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub weak: bool,
    pub reexport: bool,
    pub upward: bool,
}

/// C2 output: one parsed dylib (or executable) slice.
#[derive(Debug, Clone)]
pub struct DylibLayout {
    pub arch: Arch,
    pub file_type: FileType,
    pub install_name: String,
    pub current_version: u32,
    pub compatibility_version: u32,
    pub segments: Vec<Segment>,
    pub dependencies: Vec<Dependency>,
    pub flags: u32,
    pub mtime: u64,
    pub inode: u64,
    pub uid: u32,
    pub has_split_seg_info: bool,

    pub symtab: Option<raw::SymtabCommand>,
    pub dysymtab: Option<raw::DysymtabCommand>,
    pub dyld_info: Option<raw::DyldInfoCommand>,
    pub function_starts: Option<raw::LinkeditDataCommand>,
    pub data_in_code: Option<raw::LinkeditDataCommand>,
    pub split_seg_info: Option<raw::LinkeditDataCommand>,
    pub uuid: Option<[u8; 16]>,
}

impl DylibLayout {
    /// Parses `data` as a single Mach-O slice.
    ///
    /// `reject_rpath` should be set when parsing anything other than a
    /// root executable: a shared dylib carrying `LC_RPATH` is rejected
    /// per §4.2.
    pub fn parse(data: &[u8], reject_rpath: bool) -> Result<Self> {
        let header = raw::read_header(data)?;
        let arch = Arch::from_cpu(header.cputype, header.cpusubtype)
            .ok_or_else(|| Error::unsupported("unrecognized cpu type"))?;
        let file_type = FileType::from_raw(header.filetype)
            .ok_or_else(|| Error::macho("unsupported Mach-O file type for cache inclusion"))?;

        let mut segments = Vec::new();
        let mut dependencies = Vec::new();
        let mut install_name = String::new();
        let mut current_version = 0u32;
        let mut compatibility_version = 0u32;
        let mut symtab = None;
        let mut dysymtab = None;
        let mut dyld_info = None;
        let mut function_starts = None;
        let mut data_in_code = None;
        let mut split_seg_info = None;
        let mut uuid = None;

        for lc in LoadCommandIter::new(&header, data)? {
            let lc = lc?;
            match lc.cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let raw_seg = raw::parse_segment(&lc, header.endian, header.is64)?;
                    let raw_sections =
                        raw::parse_sections(&lc, header.endian, header.is64, raw_seg.nsects)?;
                    let sections = raw_sections
                        .into_iter()
                        .map(|s| SectionInfo {
                            name: cstr16(&s.name),
                            segname: cstr16(&s.segname),
                            addr: s.addr,
                            size: s.size,
                            section_type: s.flags & SECTION_TYPE_MASK,
                            indirect_sym_index: s.reserved1,
                        })
                        .collect();
                    segments.push(Segment {
                        orig_addr: raw_seg.vmaddr,
                        orig_vmsize: raw_seg.vmsize,
                        orig_file_off: raw_seg.fileoff,
                        orig_file_size: raw_seg.filesize,
                        orig_perms: raw_seg.initprot,
                        name: raw::segment_name(&raw_seg),
                        sections,
                        size: raw_seg.vmsize,
                        file_off: raw_seg.fileoff,
                        file_size: raw_seg.filesize,
                        perms: raw_seg.initprot,
                        new_addr: None,
                        mapped_addr: None,
                    });
                }
                LC_SYMTAB => symtab = Some(raw::parse_symtab(&lc, header.endian)?),
                LC_DYSYMTAB => dysymtab = Some(raw::parse_dysymtab(&lc, header.endian)?),
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    dyld_info = Some(raw::parse_dyld_info(&lc, header.endian)?)
                }
                LC_FUNCTION_STARTS => {
                    function_starts = Some(raw::parse_linkedit_data(&lc, header.endian)?)
                }
                LC_DATA_IN_CODE => data_in_code = Some(raw::parse_linkedit_data(&lc, header.endian)?),
                LC_SEGMENT_SPLIT_INFO => {
                    split_seg_info = Some(raw::parse_linkedit_data(&lc, header.endian)?)
                }
                LC_ID_DYLIB => {
                    let fields = raw::parse_dylib_fields(&lc, header.endian)?;
                    install_name =
                        String::from_utf8_lossy(raw::read_cstr(lc.data, fields.name_offset as usize)?)
                            .into_owned();
                    current_version = fields.current_version;
                    compatibility_version = fields.compatibility_version;
                }
                LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                    let name = String::from_utf8_lossy(raw::dylib_name(&lc, header.endian)?).into_owned();
                    dependencies.push(Dependency {
                        name,
                        weak: lc.cmd == LC_LOAD_WEAK_DYLIB,
                        reexport: lc.cmd == LC_REEXPORT_DYLIB,
                        upward: lc.cmd == LC_LOAD_UPWARD_DYLIB,
                    });
                }
                LC_RPATH => {
                    if reject_rpath {
                        return Err(Error::unsupported("LC_RPATH in a would-be-shared dylib"));
                    }
                }
                LC_UUID => {
                    if lc.data.len() >= 24 {
                        let mut u = [0u8; 16];
                        u.copy_from_slice(&lc.data[8..24]);
                        uuid = Some(u);
                    }
                }
                LC_CODE_SIGNATURE | LC_DYLIB_CODE_SIGN_DRS => {
                    // Handled by C7; nothing to capture at parse time.
                }
                other => {
                    if other & LC_REQ_DYLD != 0 {
                        return Err(Error::unsupported("unknown load command required by loader"));
                    }
                }
            }
        }

        let layout = DylibLayout {
            arch,
            file_type,
            install_name,
            current_version,
            compatibility_version,
            segments,
            dependencies,
            flags: header.flags,
            mtime: 0,
            inode: 0,
            uid: 0,
            has_split_seg_info: split_seg_info.is_some(),
            symtab,
            dysymtab,
            dyld_info,
            function_starts,
            data_in_code,
            split_seg_info,
            uuid,
        };
        layout.validate_segment_shape()?;
        Ok(layout)
    }

    fn validate_segment_shape(&self) -> Result<()> {
        let linkedit = self.segments.iter().filter(|s| s.name == "__LINKEDIT").count();
        if linkedit != 1 {
            return Err(Error::macho("a dylib layout must have exactly one __LINKEDIT segment"));
        }
        let text = self.segments.iter().filter(|s| s.name == "__TEXT").count();
        if text > 1 {
            return Err(Error::macho("at most one __TEXT segment is permitted"));
        }
        let data = self.segments.iter().filter(|s| s.name == "__DATA").count();
        if data > 1 {
            return Err(Error::macho("at most one __DATA segment is permitted"));
        }
        Ok(())
    }

    pub fn linkedit_segment(&self) -> &Segment {
        self.segments.iter().find(|s| s.name == "__LINKEDIT").expect("validated at parse time")
    }

    pub fn linkedit_segment_mut(&mut self) -> &mut Segment {
        self.segments.iter_mut().find(|s| s.name == "__LINKEDIT").expect("validated at parse time")
    }

    pub fn text_segment(&self) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == "__TEXT")
    }

    pub fn data_segment(&self) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == "__DATA")
    }

    pub fn import_segment_mut(&mut self) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.name == "__IMPORT")
    }

    /// Lowest original address among this layout's segments.
    pub fn base_address(&self) -> u64 {
        self.segments.iter().map(|s| s.orig_addr).min().unwrap_or(0)
    }

    pub fn highest_address(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.orig_addr + s.orig_vmsize)
            .max()
            .unwrap_or(0)
    }

    /// Classification used by C3's `find_shareable`: whether the install
    /// name places this dylib under a location the shared cache is allowed
    /// to publish from.
    pub fn is_sharable_location(&self) -> bool {
        self.install_name.starts_with("/usr/lib/") || self.install_name.starts_with("/System/Library/")
    }

    pub fn is_two_level_namespace(&self) -> bool {
        self.flags & MH_TWOLEVEL != 0 && self.flags & MH_FORCE_FLAT == 0
    }

    /// Locates the segment owning `va`, for `slide_for_original_va`.
    pub fn segment_containing_orig(&self, va: u64) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| va >= s.orig_addr && va < s.orig_addr + s.orig_vmsize)
    }

    /// Locates the segment owning `va` by its *new* address, for
    /// `slide_for_new_va`.
    pub fn segment_containing_new(&self, va: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| {
            if let Some(new_addr) = s.new_addr {
                va >= new_addr && va < new_addr + s.size
            } else {
                false
            }
        })
    }
}

fn cstr16(name: &[u8; 16]) -> String {
    let end = name.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&name[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::build_dylib;

    #[test]
    fn parses_segments_and_dependencies() {
        let data = build_dylib("/usr/lib/libA.dylib", &["/usr/lib/libB.dylib"], &[]);
        let layout = DylibLayout::parse(&data, true).unwrap();
        assert_eq!(layout.install_name, "/usr/lib/libA.dylib");
        assert_eq!(layout.dependencies.len(), 1);
        assert_eq!(layout.dependencies[0].name, "/usr/lib/libB.dylib");
        assert!(layout.segments.iter().any(|s| s.name == "__LINKEDIT"));
        assert!(layout.is_sharable_location());
    }

    #[test]
    fn rejects_rpath_in_shared_dylib() {
        let mut data = build_dylib("/usr/lib/libA.dylib", &[], &[]);
        crate::test_support::append_rpath(&mut data, "/usr/lib");
        assert!(DylibLayout::parse(&data, true).is_err());
    }
}
