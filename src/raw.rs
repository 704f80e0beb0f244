//! Byte-level Mach-O load-command reading.
//!
//! This is the "typed view layer" the spec treats as an external
//! collaborator (§1): a minimal, direct reader of the handful of load
//! commands C2–C8 care about. Endianness always goes through
//! [`crate::arch::Endianness`]; no host-order reads are permitted outside
//! this module.

use crate::arch::Endianness;
use crate::error::{Error, Result};
use crate::macho_const::*;

#[derive(Debug, Clone, Copy)]
pub struct RawHeader {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub is64: bool,
    pub endian: Endianness,
    pub header_size: usize,
}

pub fn detect(data: &[u8]) -> Result<(bool, Endianness)> {
    if data.len() < 4 {
        return Err(Error::macho("slice shorter than a Mach-O magic"));
    }
    let magic_le = Endianness::Little.read_u32(data);
    match magic_le {
        MH_MAGIC => Ok((false, Endianness::Little)),
        MH_CIGAM => Ok((false, Endianness::Big)),
        MH_MAGIC_64 => Ok((true, Endianness::Little)),
        MH_CIGAM_64 => Ok((true, Endianness::Big)),
        _ => Err(Error::macho("unrecognized Mach-O magic")),
    }
}

pub fn read_header(data: &[u8]) -> Result<RawHeader> {
    let (is64, endian) = detect(data)?;
    let header_size = if is64 { 32 } else { 28 };
    if data.len() < header_size {
        return Err(Error::macho("truncated Mach-O header"));
    }
    let cputype = endian.read_u32(&data[4..]);
    let cpusubtype = endian.read_u32(&data[8..]);
    let filetype = endian.read_u32(&data[12..]);
    let ncmds = endian.read_u32(&data[16..]);
    let sizeofcmds = endian.read_u32(&data[20..]);
    let flags = endian.read_u32(&data[24..]);
    Ok(RawHeader {
        cputype,
        cpusubtype,
        filetype,
        ncmds,
        sizeofcmds,
        flags,
        is64,
        endian,
        header_size,
    })
}

/// One raw load command: its `cmd` id and the full command bytes
/// (including the 8-byte `cmd`/`cmdsize` prefix).
#[derive(Debug, Clone, Copy)]
pub struct LoadCommand<'a> {
    pub cmd: u32,
    pub data: &'a [u8],
}

pub struct LoadCommandIter<'a> {
    data: &'a [u8],
    remaining: u32,
    endian: Endianness,
}

impl<'a> LoadCommandIter<'a> {
    pub fn new(header: &RawHeader, data: &'a [u8]) -> Result<Self> {
        let commands = data
            .get(header.header_size..header.header_size + header.sizeofcmds as usize)
            .ok_or_else(|| Error::macho("load command table runs past end of file"))?;
        Ok(LoadCommandIter {
            data: commands,
            remaining: header.ncmds,
            endian: header.endian,
        })
    }
}

impl<'a> Iterator for LoadCommandIter<'a> {
    type Item = Result<LoadCommand<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.data.len() < 8 {
            return Some(Err(Error::macho("truncated load command")));
        }
        let cmd = self.endian.read_u32(self.data);
        let cmdsize = self.endian.read_u32(&self.data[4..]) as usize;
        if cmdsize < 8 || cmdsize > self.data.len() {
            return Some(Err(Error::macho("invalid load command size")));
        }
        let (this, rest) = self.data.split_at(cmdsize);
        self.data = rest;
        self.remaining -= 1;
        Some(Ok(LoadCommand { cmd, data: this }))
    }
}

pub fn read_cstr(data: &[u8], offset: usize) -> Result<&[u8]> {
    let tail = data.get(offset..).ok_or_else(|| Error::macho("string offset out of range"))?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(&tail[..end])
}

#[derive(Debug, Clone)]
pub struct RawSegmentCommand {
    pub name: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub fn parse_segment(lc: &LoadCommand, endian: Endianness, is64: bool) -> Result<RawSegmentCommand> {
    let d = lc.data;
    if is64 {
        if d.len() < 72 {
            return Err(Error::macho("truncated LC_SEGMENT_64"));
        }
        let mut name = [0u8; 16];
        name.copy_from_slice(&d[8..24]);
        Ok(RawSegmentCommand {
            name,
            vmaddr: endian.read_u64(&d[24..]),
            vmsize: endian.read_u64(&d[32..]),
            fileoff: endian.read_u64(&d[40..]),
            filesize: endian.read_u64(&d[48..]),
            maxprot: endian.read_u32(&d[56..]),
            initprot: endian.read_u32(&d[60..]),
            nsects: endian.read_u32(&d[64..]),
            flags: endian.read_u32(&d[68..]),
        })
    } else {
        if d.len() < 56 {
            return Err(Error::macho("truncated LC_SEGMENT"));
        }
        let mut name = [0u8; 16];
        name.copy_from_slice(&d[8..24]);
        Ok(RawSegmentCommand {
            name,
            vmaddr: u64::from(endian.read_u32(&d[24..])),
            vmsize: u64::from(endian.read_u32(&d[28..])),
            fileoff: u64::from(endian.read_u32(&d[32..])),
            filesize: u64::from(endian.read_u32(&d[36..])),
            maxprot: endian.read_u32(&d[40..]),
            initprot: endian.read_u32(&d[44..]),
            nsects: endian.read_u32(&d[48..]),
            flags: endian.read_u32(&d[52..]),
        })
    }
}

pub fn segment_name(seg: &RawSegmentCommand) -> String {
    let end = seg.name.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&seg.name[..end]).into_owned()
}

#[derive(Debug, Clone, Copy)]
pub struct DylibCommandFields {
    pub name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

pub fn parse_dylib_fields(lc: &LoadCommand, endian: Endianness) -> Result<DylibCommandFields> {
    let d = lc.data;
    if d.len() < 24 {
        return Err(Error::macho("truncated dylib load command"));
    }
    Ok(DylibCommandFields {
        name_offset: endian.read_u32(&d[8..]),
        timestamp: endian.read_u32(&d[12..]),
        current_version: endian.read_u32(&d[16..]),
        compatibility_version: endian.read_u32(&d[20..]),
    })
}

pub fn dylib_name<'a>(lc: &LoadCommand<'a>, endian: Endianness) -> Result<&'a [u8]> {
    let fields = parse_dylib_fields(lc, endian)?;
    read_cstr(lc.data, fields.name_offset as usize)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SymtabCommand {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

pub fn parse_symtab(lc: &LoadCommand, endian: Endianness) -> Result<SymtabCommand> {
    let d = lc.data;
    if d.len() < 24 {
        return Err(Error::macho("truncated LC_SYMTAB"));
    }
    Ok(SymtabCommand {
        symoff: endian.read_u32(&d[8..]),
        nsyms: endian.read_u32(&d[12..]),
        stroff: endian.read_u32(&d[16..]),
        strsize: endian.read_u32(&d[20..]),
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DysymtabCommand {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

pub fn parse_dysymtab(lc: &LoadCommand, endian: Endianness) -> Result<DysymtabCommand> {
    let d = lc.data;
    if d.len() < 80 {
        return Err(Error::macho("truncated LC_DYSYMTAB"));
    }
    let u32_at = |off: usize| endian.read_u32(&d[off..]);
    Ok(DysymtabCommand {
        ilocalsym: u32_at(8),
        nlocalsym: u32_at(12),
        iextdefsym: u32_at(16),
        nextdefsym: u32_at(20),
        iundefsym: u32_at(24),
        nundefsym: u32_at(28),
        // tocoff/ntoc (32,36), modtaboff/nmodtab (40,44), extrefsymoff/nextrefsyms (48,52)
        indirectsymoff: u32_at(56),
        nindirectsyms: u32_at(60),
        extreloff: u32_at(64),
        nextrel: u32_at(68),
        locreloff: u32_at(72),
        nlocrel: u32_at(76),
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DyldInfoCommand {
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

pub fn parse_dyld_info(lc: &LoadCommand, endian: Endianness) -> Result<DyldInfoCommand> {
    let d = lc.data;
    if d.len() < 48 {
        return Err(Error::macho("truncated LC_DYLD_INFO"));
    }
    let u32_at = |off: usize| endian.read_u32(&d[off..]);
    Ok(DyldInfoCommand {
        rebase_off: u32_at(8),
        rebase_size: u32_at(12),
        bind_off: u32_at(16),
        bind_size: u32_at(20),
        weak_bind_off: u32_at(24),
        weak_bind_size: u32_at(28),
        lazy_bind_off: u32_at(32),
        lazy_bind_size: u32_at(36),
        export_off: u32_at(40),
        export_size: u32_at(44),
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkeditDataCommand {
    pub dataoff: u32,
    pub datasize: u32,
}

pub fn parse_linkedit_data(lc: &LoadCommand, endian: Endianness) -> Result<LinkeditDataCommand> {
    let d = lc.data;
    if d.len() < 16 {
        return Err(Error::macho("truncated linkedit_data_command"));
    }
    Ok(LinkeditDataCommand {
        dataoff: endian.read_u32(&d[8..]),
        datasize: endian.read_u32(&d[12..]),
    })
}

pub fn rpath<'a>(lc: &LoadCommand<'a>, endian: Endianness) -> Result<&'a [u8]> {
    let offset = endian.read_u32(&lc.data[8..]) as usize;
    read_cstr(lc.data, offset)
}

#[derive(Debug, Clone, Copy)]
pub struct RawSection {
    pub name: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub flags: u32,
    pub reserved1: u32,
}

pub fn parse_sections(
    segment_lc: &LoadCommand,
    endian: Endianness,
    is64: bool,
    nsects: u32,
) -> Result<Vec<RawSection>> {
    let header_size = if is64 { 72 } else { 56 };
    let entry_size = if is64 { 80 } else { 68 };
    let mut out = Vec::with_capacity(nsects as usize);
    let mut off = header_size;
    for _ in 0..nsects {
        let d = segment_lc
            .data
            .get(off..off + entry_size)
            .ok_or_else(|| Error::macho("section table runs past end of segment command"))?;
        let mut name = [0u8; 16];
        name.copy_from_slice(&d[0..16]);
        let mut segname = [0u8; 16];
        segname.copy_from_slice(&d[16..32]);
        let (addr, size, flags, reserved1) = if is64 {
            (
                endian.read_u64(&d[32..]),
                endian.read_u64(&d[40..]),
                endian.read_u32(&d[64..]),
                endian.read_u32(&d[68..]),
            )
        } else {
            (
                u64::from(endian.read_u32(&d[32..])),
                u64::from(endian.read_u32(&d[36..])),
                endian.read_u32(&d[60..]),
                endian.read_u32(&d[64..]),
            )
        };
        out.push(RawSection { name, segname, addr, size, flags, reserved1 });
        off += entry_size;
    }
    Ok(out)
}
