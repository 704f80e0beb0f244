//! C4 — placer.
//!
//! Grounded on `ArchLayout::assignNewBaseAddresses` in
//! `launch-cache/CacheFileAbstraction.hpp`: reset, then TEXT → writable →
//! read-only → LINKEDIT, each packed contiguously and page-aligned.
//!
//! LINKEDIT placement is split into its own pass (`place_linkedit`) because
//! its per-dylib size is only known once C7 has merged each dylib's symbol
//! table, export trie and string pool — the first pass here only carries
//! the non-LINKEDIT segments to their final addresses.

use crate::error::{Error, Result};
use macho_view::arch::Arch;
use macho_view::layout::DylibLayout;

/// One `(start_va, size, file_off, max_prot, init_prot)` cache mapping.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub start_va: u64,
    pub size: u64,
    pub file_off: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

#[derive(Debug)]
pub struct PlacementResult {
    pub mappings: Vec<Mapping>,
    /// Where the LINKEDIT pass should start placing from.
    pub linkedit_start: u64,
    /// File offset the LINKEDIT pass should start writing at.
    pub linkedit_file_off: u64,
}

pub struct LinkeditPlacementResult {
    pub mapping: Mapping,
    /// Index of the first `__LINKEDIT` segment across all dylibs, in
    /// placement order — it owns the merged LINKEDIT area (C7).
    pub first_linkedit: Option<(usize, usize)>,
}

pub(crate) const HEADER_RESERVATION: u64 = 0x8000;
const VM_PROT_READ: u32 = 0x1;
const VM_PROT_WRITE: u32 = 0x2;
const VM_PROT_EXECUTE: u32 = 0x4;

/// Places every non-`__LINKEDIT` segment of every dylib in `layouts`, in the
/// given order (callers choose the deterministic order — alphabetic or by
/// assigned address — per §5's ordering-guarantee note).
pub fn place(layouts: &mut [DylibLayout], arch: &Arch, shared_region_start: u64) -> Result<PlacementResult> {
    for l in layouts.iter_mut() {
        for seg in &mut l.segments {
            seg.reset();
            if arch.rewrites_import_to_executable() && seg.name == "__IMPORT" {
                seg.perms = (seg.perms & !VM_PROT_WRITE) | VM_PROT_EXECUTE;
            }
            if seg.perms & VM_PROT_WRITE != 0 && seg.perms & VM_PROT_EXECUTE != 0 && arch.forbids_writable_executable() {
                return Err(Error::layout_overflow("found writable and executable segment"));
            }
        }
    }

    let text_start = shared_region_start + HEADER_RESERVATION;
    let mut va = text_start;
    for l in layouts.iter_mut() {
        for seg in &mut l.segments {
            if is_text_class(seg.perms) && seg.name != "__LINKEDIT" {
                seg.new_addr = Some(va);
                va += seg.size.max(1);
                va = arch.page_align(va);
            }
        }
    }
    let end_text = va;

    let mut va = arch.writable_base(end_text);
    let start_writable = va;
    for l in layouts.iter_mut() {
        for seg in &mut l.segments {
            if seg.perms & VM_PROT_WRITE != 0 && seg.name != "__LINKEDIT" {
                seg.new_addr = Some(va);
                va += seg.size.max(1);
                va = arch.page_align(va);
            }
        }
    }
    let end_writable = va;

    let mut va = arch.readonly_base(end_writable, end_text);
    let start_ro = va;
    for l in layouts.iter_mut() {
        for seg in &mut l.segments {
            if !is_text_class(seg.perms) && seg.perms & VM_PROT_WRITE == 0 && seg.name != "__LINKEDIT" {
                seg.new_addr = Some(va);
                va += seg.size.max(1);
                va = arch.page_align(va);
            }
        }
    }
    let end_ro = va;

    // The header, mapping table and image table live at file offset 0,
    // inside the address range of the first (TEXT) mapping ahead of any
    // placed segment — so that mapping's start_va reaches back to
    // shared_region_start rather than text_start.
    let mut file_off = 0u64;
    let mut mappings = Vec::new();
    for (start, end, max_prot, init_prot) in [
        (shared_region_start, end_text, VM_PROT_READ | VM_PROT_EXECUTE, VM_PROT_READ | VM_PROT_EXECUTE),
        (start_writable, end_writable, VM_PROT_READ | VM_PROT_WRITE, VM_PROT_READ | VM_PROT_WRITE),
        (start_ro, end_ro, VM_PROT_READ, VM_PROT_READ),
    ] {
        let size = end.saturating_sub(start);
        mappings.push(Mapping {
            start_va: start,
            size,
            file_off,
            max_prot,
            init_prot,
        });
        file_off += size;
    }

    for l in layouts.iter_mut() {
        for seg in &mut l.segments {
            if seg.name == "__LINKEDIT" {
                continue;
            }
            let Some(new_addr) = seg.new_addr else { continue };
            let mapping = mappings
                .iter()
                .find(|m| new_addr >= m.start_va && new_addr < m.start_va + m.size)
                .ok_or_else(|| Error::layout_overflow("placed segment fell outside every mapping"))?;
            seg.file_off = mapping.file_off + (new_addr - mapping.start_va);
            seg.file_size = seg.size;
        }
    }

    Ok(PlacementResult {
        mappings,
        linkedit_start: end_ro,
        linkedit_file_off: file_off,
    })
}

/// Places every dylib's `__LINKEDIT` segment contiguously from
/// `result.linkedit_start`, using the merged sizes C7 computed (parallel to
/// `layouts`, in the same order place() was called with).
pub fn place_linkedit(
    layouts: &mut [DylibLayout],
    arch: &Arch,
    result: &PlacementResult,
    merged_sizes: &[u64],
) -> Result<LinkeditPlacementResult> {
    let mut va = result.linkedit_start;
    let start = va;
    let mut first_linkedit = None;
    for (li, l) in layouts.iter_mut().enumerate() {
        for (si, seg) in l.segments.iter_mut().enumerate() {
            if seg.name == "__LINKEDIT" {
                seg.new_addr = Some(va);
                seg.size = merged_sizes[li].max(1);
                if first_linkedit.is_none() {
                    first_linkedit = Some((li, si));
                }
                va += seg.size;
                va = arch.page_align(va);
            }
        }
    }
    let end = va;
    let size = end.saturating_sub(start);
    let mapping = Mapping {
        start_va: start,
        size,
        file_off: result.linkedit_file_off,
        max_prot: VM_PROT_READ,
        init_prot: VM_PROT_READ,
    };

    for l in layouts.iter_mut() {
        for seg in &mut l.segments {
            if seg.name != "__LINKEDIT" {
                continue;
            }
            let new_addr = seg.new_addr.expect("just placed above");
            seg.file_off = mapping.file_off + (new_addr - mapping.start_va);
            seg.file_size = seg.size;
        }
    }

    Ok(LinkeditPlacementResult { mapping, first_linkedit })
}

fn is_text_class(perms: u32) -> bool {
    perms & VM_PROT_EXECUTE != 0 && perms & VM_PROT_WRITE == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::build_cache_ready_dylib;
    use macho_view::arch::Arch;

    #[test]
    fn places_without_overlap_and_page_aligned() {
        let data_a = build_cache_ready_dylib("/usr/lib/libA.dylib", &[]);
        let data_b = build_cache_ready_dylib("/usr/lib/libB.dylib", &[]);
        let mut layouts = vec![
            DylibLayout::parse(&data_a, true).unwrap(),
            DylibLayout::parse(&data_b, true).unwrap(),
        ];
        let arch = Arch::from_cpu(0x0100_0007, 3).unwrap();
        let result = place(&mut layouts, &arch, 0x9_0000_0000).unwrap();
        let merged_sizes: Vec<u64> = layouts.iter().map(|l| l.linkedit_segment().orig_vmsize).collect();
        let linkedit = place_linkedit(&mut layouts, &arch, &result, &merged_sizes).unwrap();

        assert_eq!(result.mappings.len(), 3);
        let mut seen: Vec<(u64, u64)> = Vec::new();
        for l in &layouts {
            for seg in &l.segments {
                let new_addr = seg.new_addr.expect("every segment placed");
                assert_eq!(new_addr % 0x1000, 0, "page aligned");
                for (start, size) in &seen {
                    let end = start + size;
                    assert!(new_addr >= end || new_addr + seg.size <= *start, "no overlap");
                }
                seen.push((new_addr, seg.size));

                let all_mappings: Vec<Mapping> = result.mappings.iter().copied().chain([linkedit.mapping]).collect();
                let mapping = all_mappings
                    .iter()
                    .find(|m| new_addr >= m.start_va && new_addr < m.start_va + m.size)
                    .unwrap();
                assert_eq!(mapping.init_prot & seg.perms, seg.perms, "invariant 1: perms match mapping class");
            }
        }
        assert!(linkedit.first_linkedit.is_some());
    }

    #[test]
    fn rejects_writable_executable_segment() {
        let data = build_cache_ready_dylib("/usr/lib/libA.dylib", &[]);
        let mut layouts = vec![DylibLayout::parse(&data, true).unwrap()];
        layouts[0].segments[0].orig_perms = VM_PROT_WRITE | VM_PROT_EXECUTE;
        let arch = Arch::from_cpu(0x0100_0007, 3).unwrap();
        let err = place(&mut layouts, &arch, 0x1000).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LayoutOverflow);
    }
}
