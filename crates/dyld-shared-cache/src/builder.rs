//! Builder — orchestrates C3 through C8 into one complete cache image.
//!
//! Grounded on `CacheBuilder::buildCache` in
//! `launch-cache/CacheFileAbstraction.hpp`: place every shareable dylib's
//! non-`__LINKEDIT` segments, rebase and bind each against the placed
//! buffer, merge each dylib's LINKEDIT region, place `__LINKEDIT` itself,
//! patch each dylib's own load commands to its final offsets, then stitch
//! the header, mapping table, image table, slide info and unmapped local
//! symbols around the result.

use crate::binder::{bind_dylib, finalize_export_trie, ExportCache};
use crate::depgraph::DependencyGraph;
use crate::error::{Error, Result, Warning};
use crate::header::{self, AliasEntry, CacheHeaderInputs, ImageEntry};
use crate::linkedit::{self, write_nlist, MergedLinkedit, NList};
use crate::placer::{self, HEADER_RESERVATION};
use crate::rebaser::{apply_split_seg_fixups, rebase_dyld_info};
use crate::slideinfo::{self, SlideInfoHeader};
use macho_view::arch::{Arch, Endianness};
use macho_view::buffer::{CacheBuffer, Mapping as BufferMapping};
use macho_view::layout::DylibLayout;
use macho_view::macho_const::*;
use std::collections::{HashMap, HashSet};

/// Build-time toggles (§6's build-mode flags, trimmed to the ones this
/// builder actually honors).
pub struct BuildOptions {
    pub shared_region_start: u64,
    /// Redirects non-stab local symbols to a shared `<redacted>` string and
    /// records them in the unmapped-locals region instead of the mapped
    /// string pool.
    pub dont_map_local_symbols: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            shared_region_start: 0x7fff_0000_0000,
            dont_map_local_symbols: true,
        }
    }
}

pub struct BuildResult {
    pub data: Vec<u8>,
    pub warnings: Vec<Warning>,
}

/// Runs placement, rebasing, binding, the LINKEDIT merge, and slide-info
/// generation over `graph`'s shareable set, for a single architecture.
pub fn build_cache(graph: &mut DependencyGraph, arch: &Arch, options: &BuildOptions) -> Result<BuildResult> {
    let shareable = graph.find_shareable();
    let mut order = shareable;
    order.sort_by(|&a, &b| graph.nodes[a].canonical_path.cmp(&graph.nodes[b].canonical_path));
    let pos_of: HashMap<usize, usize> = order.iter().enumerate().map(|(pos, &orig)| (orig, pos)).collect();

    let mut layouts: Vec<DylibLayout> = order.iter().map(|&i| graph.nodes[i].layout.clone()).collect();
    let sources: Vec<Vec<u8>> = order.iter().map(|&i| graph.nodes[i].source_data.clone()).collect();
    // Every dependency of a shareable node is itself shareable (find_shareable's
    // fix-point guarantees closure), so this remap never misses an entry.
    let depends_on: Vec<Vec<usize>> = order
        .iter()
        .map(|&orig| {
            graph.nodes[orig]
                .depends_on
                .iter()
                .map(|d| *pos_of.get(d).expect("shareable set is closed under dependency"))
                .collect()
        })
        .collect();

    let placement = placer::place(&mut layouts, arch, options.shared_region_start)?;

    let stage1_mappings: Vec<BufferMapping> = placement
        .mappings
        .iter()
        .map(|m| BufferMapping { start_va: m.start_va, size: m.size, file_offset: m.file_off })
        .collect();
    let mut buffer = CacheBuffer::new(placement.linkedit_file_off as usize, stage1_mappings);

    for (li, layout) in layouts.iter().enumerate() {
        copy_non_linkedit_segments(&sources[li], layout, &mut buffer)?;
    }

    let mut pointers_in_data: HashSet<u64> = HashSet::new();
    for (li, layout) in layouts.iter().enumerate() {
        rebase_dyld_info(&sources[li], layout, &mut buffer, &mut pointers_in_data)?;
        apply_split_seg_fixups(&sources[li], layout, &mut buffer)?;
    }

    let cache = ExportCache::new(&layouts, &sources, &depends_on);
    for (li, layout) in layouts.iter().enumerate() {
        bind_dylib(&sources[li], li, layout, &mut buffer, &cache, &depends_on, &mut pointers_in_data)?;
    }

    let shareable_positions: HashSet<usize> = (0..order.len()).collect();
    let final_ordinal: HashMap<usize, u32> = (0..order.len()).map(|i| (i, i as u32)).collect();

    let mut merged: Vec<MergedLinkedit> = Vec::with_capacity(order.len());
    for (li, layout) in layouts.iter().enumerate() {
        let trie = finalize_export_trie(li, layout, &depends_on, &shareable_positions, &final_ordinal, &cache)?;
        merged.push(linkedit::merge_linkedit(&sources[li], layout, &trie, options.dont_map_local_symbols)?);
    }
    let merged_sizes: Vec<u64> = merged.iter().map(|m| m.data.len() as u64).collect();

    let linkedit_placement = placer::place_linkedit(&mut layouts, arch, &placement, &merged_sizes)?;
    let stage2_size = linkedit_placement.mapping.file_off + linkedit_placement.mapping.size;
    buffer.data.resize(stage2_size as usize, 0);
    buffer.mappings.push(BufferMapping {
        start_va: linkedit_placement.mapping.start_va,
        size: linkedit_placement.mapping.size,
        file_offset: linkedit_placement.mapping.file_off,
    });

    for (li, layout) in layouts.iter().enumerate() {
        let off = layout.linkedit_segment().file_off as usize;
        let data = &merged[li].data;
        buffer
            .data
            .get_mut(off..off + data.len())
            .ok_or_else(|| Error::layout_overflow("placed __LINKEDIT runs past end of cache buffer"))?
            .copy_from_slice(data);
    }

    for (li, layout) in layouts.iter().enumerate() {
        patch_load_commands(&mut buffer, layout, &merged[li])?;
    }

    let locals_region = build_unmapped_locals(&layouts, &merged);
    let local_symbols_off = buffer.data.len() as u64;
    let local_symbols_size = locals_region.len() as u64;
    buffer.data.extend_from_slice(&locals_region);

    let writable_mapping = *placement
        .mappings
        .get(1)
        .ok_or_else(|| Error::layout_overflow("no writable mapping was placed"))?;
    let slide_info = slideinfo::build(arch, writable_mapping.start_va, writable_mapping.size, &pointers_in_data)?;
    let (slide_info_off, slide_info_size) = match &slide_info {
        Some(info) => {
            let off = buffer.data.len() as u64;
            let mut blob = Vec::new();
            write_slide_info_header(&mut blob, &info.header);
            blob.extend_from_slice(&info.data);
            let size = blob.len() as u64;
            buffer.data.extend_from_slice(&blob);
            (off, size)
        }
        None => (0, 0),
    };

    struct ImageRaw {
        address: u64,
        mtime: u64,
        inode: u64,
        name: String,
    }
    let mut image_raw = Vec::with_capacity(order.len());
    for layout in &layouts {
        let text = layout.text_segment().ok_or_else(|| Error::layout_overflow("dylib has no __TEXT segment"))?;
        let address = text.new_addr.ok_or_else(|| Error::layout_overflow("__TEXT was not placed"))?;
        image_raw.push(ImageRaw {
            address,
            mtime: layout.mtime,
            inode: layout.inode,
            name: layout.install_name.clone(),
        });
    }
    let mut alias_raw = Vec::new();
    for (alias_path, target_orig) in &graph.aliases {
        if let Some(&pos) = pos_of.get(target_orig) {
            let img = &image_raw[pos];
            alias_raw.push(ImageRaw {
                address: img.address,
                mtime: img.mtime,
                inode: img.inode,
                name: alias_path.clone(),
            });
        }
    }

    let all_mappings: Vec<placer::Mapping> = placement.mappings.iter().copied().chain([linkedit_placement.mapping]).collect();
    let image_count = (image_raw.len() + alias_raw.len()) as u32;
    let table_bytes = header::HEADER_SIZE as u32 + all_mappings.len() as u32 * 32 + image_count * 32;

    let mut path_pool = Vec::new();
    let images: Vec<ImageEntry> = image_raw
        .iter()
        .map(|r| ImageEntry {
            address: r.address,
            mod_time: r.mtime,
            inode: r.inode,
            path_offset: intern_path(&mut path_pool, table_bytes, &r.name),
        })
        .collect();
    let aliases: Vec<AliasEntry> = alias_raw
        .iter()
        .map(|r| AliasEntry {
            address: r.address,
            mod_time: r.mtime,
            inode: r.inode,
            path_offset: intern_path(&mut path_pool, table_bytes, &r.name),
        })
        .collect();

    let header_inputs = CacheHeaderInputs {
        arch,
        mappings: &all_mappings,
        images: &images,
        aliases: &aliases,
        dyld_base_address: options.shared_region_start,
        code_signature_off: 0,
        code_signature_size: 0,
        slide_info_off,
        slide_info_size,
        local_symbols_off,
        local_symbols_size,
        uuid: [0u8; 16],
    };
    let mut header_bytes = header::build(&header_inputs);
    header_bytes.extend_from_slice(&path_pool);

    if header_bytes.len() as u64 > HEADER_RESERVATION {
        return Err(Error::layout_overflow("header, image table and path pool overran the reserved header space"));
    }
    if buffer.data.len() < header_bytes.len() {
        return Err(Error::layout_overflow("cache buffer shorter than the assembled header"));
    }
    buffer.data[..header_bytes.len()].copy_from_slice(&header_bytes);

    let uuid = header::derive_uuid(&buffer.data);
    buffer.data[0x58..0x68].copy_from_slice(&uuid);

    Ok(BuildResult {
        data: buffer.data,
        warnings: std::mem::take(&mut graph.warnings),
    })
}

fn copy_non_linkedit_segments(source: &[u8], layout: &DylibLayout, buffer: &mut CacheBuffer) -> Result<()> {
    for seg in &layout.segments {
        if seg.name == "__LINKEDIT" {
            continue;
        }
        let len = (seg.orig_file_size as usize).min(seg.size as usize);
        if len == 0 {
            continue;
        }
        let src = source
            .get(seg.orig_file_off as usize..seg.orig_file_off as usize + len)
            .ok_or_else(|| Error::malformed("segment file range runs past end of dylib"))?;
        let dst_off = seg.file_off as usize;
        let dst = buffer
            .data
            .get_mut(dst_off..dst_off + len)
            .ok_or_else(|| Error::layout_overflow("placed segment runs past end of cache buffer"))?;
        dst.copy_from_slice(src);
    }
    Ok(())
}

fn intern_path(pool: &mut Vec<u8>, base: u32, s: &str) -> u32 {
    let off = base + pool.len() as u32;
    pool.extend_from_slice(s.as_bytes());
    pool.push(0);
    off
}

fn write_slide_info_header(out: &mut Vec<u8>, header: &SlideInfoHeader) {
    const SLIDE_INFO_HEADER_SIZE: u32 = 24;
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&(header.toc_offset + SLIDE_INFO_HEADER_SIZE).to_le_bytes());
    out.extend_from_slice(&header.toc_count.to_le_bytes());
    out.extend_from_slice(&(header.entries_offset + SLIDE_INFO_HEADER_SIZE).to_le_bytes());
    out.extend_from_slice(&header.entries_count.to_le_bytes());
    out.extend_from_slice(&header.entries_size.to_le_bytes());
}

/// Builds the combined `dyld_cache_local_symbols_info` region: a header, one
/// `dyld_cache_local_symbols_entry` per dylib, then the concatenated nlist
/// table and string pool for every symbol [`crate::linkedit::merge_linkedit`]
/// pulled out of the mapped symbol table.
fn build_unmapped_locals(layouts: &[DylibLayout], merged: &[MergedLinkedit]) -> Vec<u8> {
    const INFO_HEADER_SIZE: usize = 24;
    const ENTRY_SIZE: usize = 12;

    let mut strings = vec![0u8];
    let mut nlist_bytes = Vec::new();
    let mut dylib_entries: Vec<(u32, u32, u32)> = Vec::with_capacity(layouts.len());
    let mut nlist_count = 0u32;

    for (layout, m) in layouts.iter().zip(merged) {
        let start_index = nlist_count;
        for local in &m.unmapped_locals {
            let n_strx = strings.len() as u32;
            strings.extend_from_slice(&local.name);
            strings.push(0);
            write_nlist(&mut nlist_bytes, &NList { n_strx, ..local.nlist }, layout.arch.endianness, layout.arch.is_64());
            nlist_count += 1;
        }
        let dylib_file_off = layout.text_segment().map(|s| s.file_off).unwrap_or(0);
        dylib_entries.push((dylib_file_off as u32, start_index, nlist_count - start_index));
    }

    let nlist_offset = (INFO_HEADER_SIZE + dylib_entries.len() * ENTRY_SIZE) as u32;
    let strings_offset = nlist_offset + nlist_bytes.len() as u32;

    let mut out = Vec::with_capacity(strings_offset as usize + strings.len());
    out.extend_from_slice(&nlist_offset.to_le_bytes());
    out.extend_from_slice(&nlist_count.to_le_bytes());
    out.extend_from_slice(&strings_offset.to_le_bytes());
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    out.extend_from_slice(&(INFO_HEADER_SIZE as u32).to_le_bytes());
    out.extend_from_slice(&(dylib_entries.len() as u32).to_le_bytes());
    for (dylib_off, start, count) in &dylib_entries {
        out.extend_from_slice(&dylib_off.to_le_bytes());
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
    }
    out.extend_from_slice(&nlist_bytes);
    out.extend_from_slice(&strings);
    out
}

fn write_u32_at(lc: &mut [u8], off: usize, endian: Endianness, value: u32) {
    endian.write_u32(&mut lc[off..off + 4], value);
}

/// Rewrites one dylib's own load commands in place: segment/section fields
/// track the placed addresses and file offsets, the LINKEDIT-pointing
/// commands point at the merged blob, `LC_SEGMENT_SPLIT_INFO` /
/// `LC_DYLIB_CODE_SIGN_DRS` / `LC_CODE_SIGNATURE` are dropped outright (any
/// rewrite already invalidates a real code signature), and `ncmds`/
/// `sizeofcmds` shrink to match.
fn patch_load_commands(buffer: &mut CacheBuffer, layout: &DylibLayout, merged: &MergedLinkedit) -> Result<()> {
    let text = layout.text_segment().ok_or_else(|| Error::layout_overflow("dylib has no __TEXT segment"))?;
    let delta_file = text.file_off as i64 - text.orig_file_off as i64;
    // The Mach-O header always sits at file offset 0 of the original slice.
    let header_off = delta_file as u64;

    let endian = layout.arch.endianness;
    let is64 = layout.arch.is_64();
    let header_size = if is64 { 32 } else { 28 };

    let header_bytes = buffer
        .data
        .get(header_off as usize..header_off as usize + header_size)
        .ok_or_else(|| Error::layout_overflow("mach header runs past end of cache buffer"))?
        .to_vec();
    let orig_ncmds = endian.read_u32(&header_bytes[16..]);
    let orig_sizeofcmds = endian.read_u32(&header_bytes[20..]);

    let cmds_off = header_off as usize + header_size;
    let cmds_bytes = buffer
        .data
        .get(cmds_off..cmds_off + orig_sizeofcmds as usize)
        .ok_or_else(|| Error::layout_overflow("load commands run past end of cache buffer"))?
        .to_vec();

    let linkedit_file_off = layout.linkedit_segment().file_off as u32;

    let mut new_cmds = Vec::with_capacity(cmds_bytes.len());
    let mut new_ncmds = 0u32;
    let mut pos = 0usize;
    while pos + 8 <= cmds_bytes.len() && new_ncmds < orig_ncmds {
        let cmd = endian.read_u32(&cmds_bytes[pos..]);
        let cmdsize = endian.read_u32(&cmds_bytes[pos + 4..]) as usize;
        if cmdsize < 8 || pos + cmdsize > cmds_bytes.len() {
            return Err(Error::malformed("invalid load command size while patching"));
        }
        let mut lc = cmds_bytes[pos..pos + cmdsize].to_vec();
        pos += cmdsize;

        match cmd {
            LC_SEGMENT_SPLIT_INFO | LC_DYLIB_CODE_SIGN_DRS | LC_CODE_SIGNATURE => continue,
            LC_SEGMENT | LC_SEGMENT_64 => patch_segment_command(&mut lc, layout, endian, is64)?,
            LC_SYMTAB => {
                write_u32_at(&mut lc, 8, endian, linkedit_file_off + merged.symoff);
                write_u32_at(&mut lc, 12, endian, merged.nsyms);
                write_u32_at(&mut lc, 16, endian, linkedit_file_off + merged.stroff);
                write_u32_at(&mut lc, 20, endian, merged.strsize);
            }
            LC_DYSYMTAB => {
                write_u32_at(&mut lc, 8, endian, merged.ilocalsym);
                write_u32_at(&mut lc, 12, endian, merged.nlocalsym);
                write_u32_at(&mut lc, 16, endian, merged.iextdefsym);
                write_u32_at(&mut lc, 20, endian, merged.nextdefsym);
                write_u32_at(&mut lc, 24, endian, merged.iundefsym);
                write_u32_at(&mut lc, 28, endian, merged.nundefsym);
                write_u32_at(&mut lc, 56, endian, linkedit_file_off + merged.indirectsymoff);
                write_u32_at(&mut lc, 60, endian, merged.nindirectsyms);
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                // Rebase/bind/lazy-bind streams are fully consumed by this
                // pass and never copied into the merged blob.
                write_u32_at(&mut lc, 8, endian, 0);
                write_u32_at(&mut lc, 12, endian, 0);
                write_u32_at(&mut lc, 16, endian, 0);
                write_u32_at(&mut lc, 20, endian, 0);
                write_u32_at(&mut lc, 24, endian, linkedit_file_off + merged.weak_bind_off);
                write_u32_at(&mut lc, 28, endian, merged.weak_bind_size);
                write_u32_at(&mut lc, 32, endian, 0);
                write_u32_at(&mut lc, 36, endian, 0);
                write_u32_at(&mut lc, 40, endian, linkedit_file_off + merged.export_off);
                write_u32_at(&mut lc, 44, endian, merged.export_size);
            }
            LC_FUNCTION_STARTS => {
                write_u32_at(&mut lc, 8, endian, linkedit_file_off + merged.function_starts_off);
                write_u32_at(&mut lc, 12, endian, merged.function_starts_size);
            }
            LC_DATA_IN_CODE => {
                write_u32_at(&mut lc, 8, endian, linkedit_file_off + merged.data_in_code_off);
                write_u32_at(&mut lc, 12, endian, merged.data_in_code_size);
            }
            LC_ID_DYLIB => write_u32_at(&mut lc, 12, endian, 0),
            _ => {}
        }

        new_cmds.extend_from_slice(&lc);
        new_ncmds += 1;
    }

    let new_sizeofcmds = new_cmds.len() as u32;
    if new_sizeofcmds > orig_sizeofcmds {
        return Err(Error::layout_overflow("patched load commands grew larger than the original"));
    }

    let mut new_header = header_bytes;
    write_u32_at(&mut new_header, 16, endian, new_ncmds);
    write_u32_at(&mut new_header, 20, endian, new_sizeofcmds);
    buffer.data[header_off as usize..header_off as usize + header_size].copy_from_slice(&new_header);

    let cmds_region = &mut buffer.data[cmds_off..cmds_off + orig_sizeofcmds as usize];
    cmds_region[..new_cmds.len()].copy_from_slice(&new_cmds);
    cmds_region[new_cmds.len()..].fill(0);
    Ok(())
}

fn patch_segment_command(lc: &mut [u8], layout: &DylibLayout, endian: Endianness, is64: bool) -> Result<()> {
    let mut name = [0u8; 16];
    name.copy_from_slice(&lc[8..24]);
    let end = name.iter().position(|&b| b == 0).unwrap_or(16);
    let seg_name = String::from_utf8_lossy(&name[..end]).into_owned();
    let seg = layout
        .segments
        .iter()
        .find(|s| s.name == seg_name)
        .ok_or_else(|| Error::malformed("load command segment has no matching placed segment"))?;
    let new_addr = seg.new_addr.ok_or_else(|| Error::malformed("segment has not been placed"))?;

    if is64 {
        endian.write_u64(&mut lc[24..32], new_addr);
        endian.write_u64(&mut lc[32..40], seg.size);
        endian.write_u64(&mut lc[40..48], seg.file_off);
        endian.write_u64(&mut lc[48..56], seg.file_size);
    } else {
        write_u32_at(lc, 24, endian, new_addr as u32);
        write_u32_at(lc, 28, endian, seg.size as u32);
        write_u32_at(lc, 32, endian, seg.file_off as u32);
        write_u32_at(lc, 36, endian, seg.file_size as u32);
    }

    let addr_slide = new_addr as i64 - seg.orig_addr as i64;
    let file_delta = seg.file_off as i64 - seg.orig_file_off as i64;

    let nsects_off = if is64 { 64 } else { 48 };
    let nsects = endian.read_u32(&lc[nsects_off..]);
    let (sect_header_size, sect_entry_size) = if is64 { (72usize, 80usize) } else { (56usize, 68usize) };
    for i in 0..nsects as usize {
        let base = sect_header_size + i * sect_entry_size;
        if base + sect_entry_size > lc.len() {
            return Err(Error::malformed("section table runs past end of segment command"));
        }
        if is64 {
            let addr = endian.read_u64(&lc[base + 32..]);
            endian.write_u64(&mut lc[base + 32..base + 40], (addr as i64 + addr_slide) as u64);
            let file_off = endian.read_u32(&lc[base + 48..]);
            if file_off != 0 {
                write_u32_at(lc, base + 48, endian, (file_off as i64 + file_delta) as u32);
            }
        } else {
            let addr = u64::from(endian.read_u32(&lc[base + 32..]));
            write_u32_at(lc, base + 32, endian, (addr as i64 + addr_slide) as u32);
            let file_off = endian.read_u32(&lc[base + 40..]);
            if file_off != 0 {
                write_u32_at(lc, base + 40, endian, (file_off as i64 + file_delta) as u32);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MapSource;
    use crate::test_support::build_cache_ready_dylib;
    use macho_view::macho_const::CPU_TYPE_X86_64;

    #[test]
    fn builds_minimal_two_dylib_cache() {
        let mut source = MapSource::new();
        source.insert("/usr/lib/libB.dylib", build_cache_ready_dylib("/usr/lib/libB.dylib", &[]));
        source.insert(
            "/usr/lib/libA.dylib",
            build_cache_ready_dylib("/usr/lib/libA.dylib", &["/usr/lib/libB.dylib"]),
        );

        let mut graph = DependencyGraph::new();
        let a = graph.add_root(&source, "/usr/lib/libA.dylib").unwrap();
        graph.load_all_dependencies(&source, a, "/usr/lib/libA.dylib").unwrap();

        let arch = Arch::from_cpu(CPU_TYPE_X86_64, 3).unwrap();
        let options = BuildOptions {
            shared_region_start: 0x9_0000_0000,
            dont_map_local_symbols: true,
        };
        let result = build_cache(&mut graph, &arch, &options).unwrap();

        assert_eq!(&result.data[0..7], b"dyld_v1");
        assert_eq!(&result.data[10..16], b"x86_64");
        assert!(result.data.len() > header::HEADER_SIZE);
    }

    #[test]
    fn rejects_when_no_dylib_is_shareable() {
        let mut source = MapSource::new();
        source.insert("/usr/lib/libA.dylib", build_cache_ready_dylib("/usr/lib/libA.dylib", &[]));
        let mut graph = DependencyGraph::new();
        let a = graph.add_root(&source, "/usr/lib/libA.dylib").unwrap();
        graph.load_all_dependencies(&source, a, "/usr/lib/libA.dylib").unwrap();

        let arch = Arch::from_cpu(CPU_TYPE_X86_64, 3).unwrap();
        let result = build_cache(&mut graph, &arch, &BuildOptions::default()).unwrap();
        // An empty shareable set still produces a structurally valid (if
        // pointless) cache image rather than failing the build.
        assert_eq!(&result.data[0..7], b"dyld_v1");
    }
}
