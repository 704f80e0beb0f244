//! C7 — LINKEDIT merger.
//!
//! Grounded on `LinkEditOptimizer::optimizeLinkedit` in
//! `launch-cache/CacheFileAbstraction.hpp`: per dylib, re-pack weak-bind
//! info, the (already rebased/rebuilt) export trie, the symbol table, the
//! function-starts and data-in-code tables, and the indirect symbol table
//! into one compact LINKEDIT blob with a single shared string pool,
//! dropping what's already been consumed (rebase/bind/lazy-bind streams,
//! `LC_SEGMENT_SPLIT_INFO`).
//!
//! Legacy external/local relocations are not rewritten by this pass — a
//! cache-eligible dylib built with `LC_DYLD_INFO_ONLY` never carries them,
//! and this builder does not target the relocation-based (pre-10.6) bind
//! format (see DESIGN.md).

use crate::error::{Error, Result};
use macho_view::arch::Endianness;
use macho_view::layout::DylibLayout;
use macho_view::macho_const::*;
use macho_view::raw;

#[derive(Debug, Clone, Copy, Default)]
pub struct NList {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

fn read_nlist(data: &[u8], off: usize, endian: Endianness, is64: bool) -> Result<NList> {
    if is64 {
        let d = data.get(off..off + 16).ok_or_else(|| Error::malformed("truncated nlist_64 entry"))?;
        Ok(NList {
            n_strx: endian.read_u32(d),
            n_type: d[4],
            n_sect: d[5],
            n_desc: endian.read_u16(&d[6..]),
            n_value: endian.read_u64(&d[8..]),
        })
    } else {
        let d = data.get(off..off + 12).ok_or_else(|| Error::malformed("truncated nlist entry"))?;
        Ok(NList {
            n_strx: endian.read_u32(d),
            n_type: d[4],
            n_sect: d[5],
            n_desc: endian.read_u16(&d[6..]),
            n_value: u64::from(endian.read_u32(&d[8..])),
        })
    }
}

pub(crate) fn write_nlist(out: &mut Vec<u8>, n: &NList, endian: Endianness, is64: bool) {
    let mut strx = [0u8; 4];
    endian.write_u32(&mut strx, n.n_strx);
    out.extend_from_slice(&strx);
    out.push(n.n_type);
    out.push(n.n_sect);
    // n_desc shares u16's layout with the low half of a u32 write; encode
    // through a 4-byte scratch buffer since Endianness has no u16 writer.
    let mut tmp = [0u8; 4];
    endian.write_u32(&mut tmp, u32::from(n.n_desc));
    out.extend_from_slice(&tmp[..2]);
    if is64 {
        let mut value = [0u8; 8];
        endian.write_u64(&mut value, n.n_value);
        out.extend_from_slice(&value);
    } else {
        let mut value = [0u8; 4];
        endian.write_u32(&mut value, n.n_value as u32);
        out.extend_from_slice(&value);
    }
}

struct RawSymbol {
    old_index: u32,
    nlist: NList,
    name: Vec<u8>,
}

fn read_symbols(source: &[u8], layout: &DylibLayout, lo: u32, count: u32) -> Result<Vec<RawSymbol>> {
    let Some(symtab) = layout.symtab else { return Ok(Vec::new()) };
    let endian = layout.arch.endianness;
    let is64 = layout.arch.is_64();
    let entry_size = if is64 { 16 } else { 12 };
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let idx = lo + i;
        let off = symtab.symoff as usize + idx as usize * entry_size;
        let nlist = read_nlist(source, off, endian, is64)?;
        let name = raw::read_cstr(source, symtab.stroff as usize + nlist.n_strx as usize)
            .unwrap_or(&[])
            .to_vec();
        out.push(RawSymbol { old_index: idx, nlist, name });
    }
    Ok(out)
}

/// One symbol moved out of the mapped symbol table into the unmapped
/// local-symbols block: its real name and nlist data, recorded for the
/// cache's "local symbols" file section, keyed by owning dylib at the
/// builder level.
pub struct UnmappedLocal {
    pub name: Vec<u8>,
    pub nlist: NList,
}

pub struct MergedLinkedit {
    /// The new `__LINKEDIT` segment content, ready to be copied at its
    /// placed file offset.
    pub data: Vec<u8>,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub function_starts_off: u32,
    pub function_starts_size: u32,
    pub data_in_code_off: u32,
    pub data_in_code_size: u32,
    pub unmapped_locals: Vec<UnmappedLocal>,
}

const REDACTED: &[u8] = b"<redacted>";

fn slice_or_empty(source: &[u8], range: Option<(u32, u32)>) -> Result<&[u8]> {
    let Some((off, size)) = range else { return Ok(&[]) };
    if size == 0 {
        return Ok(&[]);
    }
    source
        .get(off as usize..(off + size) as usize)
        .ok_or_else(|| Error::malformed("linkedit sub-stream runs past end of file"))
}

fn intern(strings: &mut Vec<u8>, name: &[u8]) -> u32 {
    let off = strings.len() as u32;
    strings.extend_from_slice(name);
    strings.push(0);
    off
}

/// Merges one dylib's LINKEDIT content. `export_trie` is the already
/// rebased/hoisted blob from [`crate::binder::finalize_export_trie`].
/// When `dont_map_local_symbols` is set, non-stab local symbols are pulled
/// out of the mapped string pool into [`MergedLinkedit::unmapped_locals`]
/// and their `n_strx` redirected to a single shared `<redacted>` string,
/// matching the real cache's space-saving default.
pub fn merge_linkedit(source: &[u8], layout: &DylibLayout, export_trie: &[u8], dont_map_local_symbols: bool) -> Result<MergedLinkedit> {
    let endian = layout.arch.endianness;
    let is64 = layout.arch.is_64();

    let weak_bind = slice_or_empty(source, layout.dyld_info.map(|i| (i.weak_bind_off, i.weak_bind_size)))?.to_vec();
    let function_starts = slice_or_empty(source, layout.function_starts.map(|i| (i.dataoff, i.datasize)))?.to_vec();
    let data_in_code = slice_or_empty(source, layout.data_in_code.map(|i| (i.dataoff, i.datasize)))?.to_vec();

    let dysymtab = layout.dysymtab.unwrap_or_default();
    let locals = read_symbols(source, layout, dysymtab.ilocalsym, dysymtab.nlocalsym)?;
    let mut defined = read_symbols(source, layout, dysymtab.iextdefsym, dysymtab.nextdefsym)?;
    let undefined = read_symbols(source, layout, dysymtab.iundefsym, dysymtab.nundefsym)?;

    // Defined externals ship alphabetically sorted in the merged cache.
    defined.sort_by(|a, b| a.name.cmp(&b.name));

    let total_old = dysymtab.ilocalsym + dysymtab.nlocalsym + dysymtab.nextdefsym + dysymtab.nundefsym;
    let mut old_to_new: Vec<Option<u32>> = vec![None; total_old as usize];

    let mut strings = vec![0u8];
    let redacted_off = dont_map_local_symbols.then(|| intern(&mut strings, REDACTED));

    let mut symbols = Vec::new();
    let mut unmapped_locals = Vec::new();

    let ilocalsym = symbols.len() as u32;
    for sym in &locals {
        if sym.nlist.n_type & N_STAB != 0 {
            continue;
        }
        let new_idx = symbols.len() as u32;
        if let Some(slot) = old_to_new.get_mut(sym.old_index as usize) {
            *slot = Some(new_idx);
        }
        if dont_map_local_symbols {
            unmapped_locals.push(UnmappedLocal { name: sym.name.clone(), nlist: sym.nlist });
            symbols.push(NList { n_strx: redacted_off.unwrap_or(0), ..sym.nlist });
        } else {
            let n_strx = intern(&mut strings, &sym.name);
            symbols.push(NList { n_strx, ..sym.nlist });
        }
    }
    let nlocalsym = symbols.len() as u32 - ilocalsym;

    let iextdefsym = symbols.len() as u32;
    for sym in &defined {
        let new_idx = symbols.len() as u32;
        if let Some(slot) = old_to_new.get_mut(sym.old_index as usize) {
            *slot = Some(new_idx);
        }
        let n_strx = intern(&mut strings, &sym.name);
        symbols.push(NList { n_strx, ..sym.nlist });
    }
    let nextdefsym = symbols.len() as u32 - iextdefsym;

    let iundefsym = symbols.len() as u32;
    for sym in &undefined {
        let new_idx = symbols.len() as u32;
        if let Some(slot) = old_to_new.get_mut(sym.old_index as usize) {
            *slot = Some(new_idx);
        }
        let n_strx = intern(&mut strings, &sym.name);
        symbols.push(NList { n_strx, ..sym.nlist });
    }
    let nundefsym = symbols.len() as u32 - iundefsym;

    let mut out = Vec::new();
    let weak_bind_off = out.len() as u32;
    out.extend_from_slice(&weak_bind);
    let weak_bind_size = weak_bind.len() as u32;

    let export_off = out.len() as u32;
    out.extend_from_slice(export_trie);
    let export_size = export_trie.len() as u32;

    let symoff = out.len() as u32;
    for sym in &symbols {
        write_nlist(&mut out, sym, endian, is64);
    }
    let nsyms = symbols.len() as u32;

    let function_starts_off = out.len() as u32;
    out.extend_from_slice(&function_starts);
    let function_starts_size = function_starts.len() as u32;

    let data_in_code_off = out.len() as u32;
    out.extend_from_slice(&data_in_code);
    let data_in_code_size = data_in_code.len() as u32;

    let indirectsymoff = out.len() as u32;
    let nindirectsyms = remap_indirect_symtab(source, layout, &old_to_new, &mut out)?;

    let stroff = out.len() as u32;
    out.extend_from_slice(&strings);
    let strsize = strings.len() as u32;

    Ok(MergedLinkedit {
        data: out,
        weak_bind_off,
        weak_bind_size,
        export_off,
        export_size,
        symoff,
        nsyms,
        stroff,
        strsize,
        ilocalsym,
        nlocalsym,
        iextdefsym,
        nextdefsym,
        iundefsym,
        nundefsym,
        indirectsymoff,
        nindirectsyms,
        function_starts_off,
        function_starts_size,
        data_in_code_off,
        data_in_code_size,
        unmapped_locals,
    })
}

fn remap_indirect_symtab(source: &[u8], layout: &DylibLayout, old_to_new: &[Option<u32>], out: &mut Vec<u8>) -> Result<u32> {
    let Some(dysymtab) = layout.dysymtab else { return Ok(0) };
    if dysymtab.nindirectsyms == 0 {
        return Ok(0);
    }
    let endian = layout.arch.endianness;
    for i in 0..dysymtab.nindirectsyms {
        let off = dysymtab.indirectsymoff as usize + i as usize * 4;
        let old_idx = endian.read_u32(
            source
                .get(off..off + 4)
                .ok_or_else(|| Error::malformed("indirect symbol table runs past end of file"))?,
        );
        let new_idx = if old_idx == INDIRECT_SYMBOL_LOCAL || old_idx == INDIRECT_SYMBOL_ABS {
            old_idx
        } else {
            old_to_new.get(old_idx as usize).copied().flatten().unwrap_or(INDIRECT_SYMBOL_ABS)
        };
        let mut buf = [0u8; 4];
        endian.write_u32(&mut buf, new_idx);
        out.extend_from_slice(&buf);
    }
    Ok(dysymtab.nindirectsyms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::build_cache_ready_dylib;

    #[test]
    fn merges_without_local_symbols() {
        let data = build_cache_ready_dylib("/usr/lib/libA.dylib", &[]);
        let layout = DylibLayout::parse(&data, true).unwrap();
        let merged = merge_linkedit(&data, &layout, &[], true).unwrap();
        assert_eq!(merged.nsyms, 0);
        assert_eq!(merged.strsize as usize, merged.data.len() - merged.stroff as usize);
    }

    #[test]
    fn sorts_defined_externals_alphabetically() {
        // Two defined external symbols out of alpha order.
        let data = crate::test_support::build_dylib_with_symbols(&[("_zzz", 0x1000), ("_aaa", 0x1010)]);
        let layout = DylibLayout::parse(&data, true).unwrap();
        let merged = merge_linkedit(&data, &layout, &[], false).unwrap();
        assert_eq!(merged.nextdefsym, 2);
        let first = read_nlist(&merged.data, merged.symoff as usize, layout.arch.endianness, layout.arch.is_64()).unwrap();
        let name = raw::read_cstr(&merged.data, merged.stroff as usize + first.n_strx as usize).unwrap();
        assert_eq!(name, b"_aaa");
    }
}
