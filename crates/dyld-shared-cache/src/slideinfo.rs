//! C8 — slide-info builder.
//!
//! Grounded on `dyld_cache_slide_info`/`ASLR_Tracker` in
//! `update_dyld_shared_cache.cpp`: a dense per-page bitmap (one bit per
//! pointer-sized slot) recording which slots in a writable page were
//! rebased or bound, deduplicated across identical pages via a
//! table-of-contents. 32-bit architectures never carry slide info — the
//! cache is built at a single fixed load address for them.

use crate::error::Result;
use macho_view::arch::Arch;
use std::collections::{HashMap, HashSet};

const PAGE_SIZE: u64 = 0x1000;
const ENTRY_SIZE: usize = 128;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SlideInfoHeader {
    pub version: u32,
    pub toc_offset: u32,
    pub toc_count: u32,
    pub entries_offset: u32,
    pub entries_count: u32,
    pub entries_size: u32,
}

pub struct SlideInfo {
    pub header: SlideInfoHeader,
    pub data: Vec<u8>,
}

/// Builds the slide-info blob for one writable mapping, given every
/// pointer site within it (in mapped/new-address-space terms) that the
/// rebaser and binder touched.
///
/// Returns `None` on 32-bit architectures, or when the mapping contains no
/// rebased/bound pointers.
pub fn build(arch: &Arch, mapping_start: u64, mapping_size: u64, pointers_in_data: &HashSet<u64>) -> Result<Option<SlideInfo>> {
    if !arch.is_64() {
        return Ok(None);
    }
    if pointers_in_data.is_empty() {
        return Ok(None);
    }

    let page_count = mapping_size.div_ceil(PAGE_SIZE) as usize;
    let mut pages: Vec<[u8; ENTRY_SIZE]> = vec![[0u8; ENTRY_SIZE]; page_count];

    for &va in pointers_in_data {
        if va < mapping_start || va >= mapping_start + mapping_size {
            continue;
        }
        let rel = va - mapping_start;
        if !rel.is_multiple_of(4) {
            continue;
        }
        let page = (rel / PAGE_SIZE) as usize;
        let in_page = rel % PAGE_SIZE;
        let slot = (in_page / 8) as usize;
        let bit = ((in_page / 4) % 2) as u8;
        if let Some(entry) = pages.get_mut(page) {
            entry[slot] |= 1 << bit;
        }
    }

    let mut dedup: HashMap<[u8; ENTRY_SIZE], u16> = HashMap::new();
    let mut entries = Vec::new();
    let mut toc = Vec::with_capacity(page_count);
    for page in &pages {
        let idx = *dedup.entry(*page).or_insert_with(|| {
            let i = entries.len() as u16;
            entries.extend_from_slice(page);
            i
        });
        toc.push(idx);
    }

    let header = SlideInfoHeader {
        version: 1,
        toc_offset: 0, // filled in by caller once placed after the header
        toc_count: toc.len() as u32,
        entries_offset: 0,
        entries_count: (entries.len() / ENTRY_SIZE) as u32,
        entries_size: ENTRY_SIZE as u32,
    };

    let mut data = Vec::new();
    for t in &toc {
        data.extend_from_slice(&t.to_le_bytes());
    }
    let entries_offset = data.len() as u32;
    data.extend_from_slice(&entries);

    let header = SlideInfoHeader {
        toc_offset: 0,
        entries_offset,
        ..header
    };

    Ok(Some(SlideInfo { header, data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use macho_view::macho_const::CPU_TYPE_X86_64;

    #[test]
    fn dedups_identical_pages() {
        let arch = Arch::from_cpu(CPU_TYPE_X86_64, 3).unwrap();
        let mut pointers = HashSet::new();
        pointers.insert(0x2000u64); // page 0
        pointers.insert(0x3000u64); // page 1, identical bit pattern
        let info = build(&arch, 0x2000, 0x2000, &pointers).unwrap().unwrap();
        assert_eq!(info.header.toc_count, 2);
        assert_eq!(info.header.entries_count, 1, "identical pages dedup to one entry");
    }

    #[test]
    fn no_pointers_yields_no_slide_info() {
        let arch = Arch::from_cpu(CPU_TYPE_X86_64, 3).unwrap();
        assert!(build(&arch, 0x2000, 0x1000, &HashSet::new()).unwrap().is_none());
    }
}
