//! C6 — binder.
//!
//! Grounded on `MachOBinder<A>::bind`/`doBindExternalRelocations` and
//! `ImageProxy::resolveExportedSymbolName` in `launch-cache/MachOBinder.hpp`;
//! the cross-binder memoized export lookup is the run-time stand-in for
//! that header's `ImageProxy` graph walk.

use crate::error::{Error, Result};
use crate::rebaser::slide_for_original_va;
use macho_view::buffer::CacheBuffer;
use macho_view::layout::DylibLayout;
use macho_view::leb128::{read_sleb128, read_uleb128};
use macho_view::macho_const::*;
use macho_view::trie::{self, TrieEntry};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

/// A symbol resolved to a concrete defining dylib and address, in that
/// dylib's *original* (pre-slide) coordinate space.
#[derive(Debug, Clone)]
pub struct ResolvedExport {
    pub defining_node: usize,
    pub address: u64,
    pub flags: u32,
}

/// Resolves exports across the whole dependency graph, memoizing each
/// node's table and guarding against re-export cycles (invariant 7).
pub struct ExportCache<'a> {
    layouts: &'a [DylibLayout],
    sources: &'a [Vec<u8>],
    depends_on: &'a [Vec<usize>],
    tables: RefCell<HashMap<usize, HashMap<Vec<u8>, ResolvedExport>>>,
    resolving: RefCell<HashSet<usize>>,
}

impl<'a> ExportCache<'a> {
    pub fn new(layouts: &'a [DylibLayout], sources: &'a [Vec<u8>], depends_on: &'a [Vec<usize>]) -> Self {
        ExportCache {
            layouts,
            sources,
            depends_on,
            tables: RefCell::new(HashMap::new()),
            resolving: RefCell::new(HashSet::new()),
        }
    }

    fn own_trie(&self, node: usize) -> Result<Vec<TrieEntry>> {
        let Some(info) = self.layouts[node].dyld_info else { return Ok(Vec::new()) };
        if info.export_size == 0 {
            return Ok(Vec::new());
        }
        let blob = self.sources[node]
            .get(info.export_off as usize..(info.export_off + info.export_size) as usize)
            .ok_or_else(|| Error::malformed("export trie runs past end of file"))?;
        Ok(trie::parse(blob)?)
    }

    /// Looks up `name` as exported (directly or via re-export chain) from
    /// `node`. Marks `node` as "resolving" for the duration of the pass, per
    /// invariant 7: a re-export cycle surfaces as a `StateDivergence` error
    /// rather than recursing forever.
    pub fn find_exported(&self, node: usize, name: &[u8]) -> Result<Option<ResolvedExport>> {
        if let Some(table) = self.tables.borrow().get(&node) {
            return Ok(table.get(name).cloned());
        }

        if !self.resolving.borrow_mut().insert(node) {
            return Err(Error::state_divergence(format!(
                "re-export cycle detected while resolving exports of node {node}"
            )));
        }

        let entries = self.own_trie(node)?;
        let mut table = HashMap::new();
        for entry in &entries {
            if entry.is_reexport() {
                let Some(ordinal) = entry.other else { continue };
                if ordinal == 0 || ordinal as usize > self.depends_on[node].len() {
                    continue;
                }
                let target_node = self.depends_on[node][ordinal as usize - 1];
                let lookup_name = entry.import_name.as_deref().unwrap_or(&entry.name);
                if let Some(resolved) = self.find_exported(target_node, lookup_name)? {
                    table.insert(entry.name.clone(), resolved);
                }
            } else {
                table.insert(
                    entry.name.clone(),
                    ResolvedExport {
                        defining_node: node,
                        address: entry.address,
                        flags: entry.flags,
                    },
                );
            }
        }

        self.resolving.borrow_mut().remove(&node);
        let result = table.get(name).cloned();
        self.tables.borrow_mut().insert(node, table);
        Ok(result)
    }

    /// The final address (post-slide) of a resolved export, given its
    /// defining node's placed layout.
    pub fn final_address(&self, resolved: &ResolvedExport) -> Result<u64> {
        let layout = &self.layouts[resolved.defining_node];
        let slide = slide_for_original_va(layout, resolved.address)?;
        Ok((resolved.address as i64 + slide) as u64)
    }
}

/// Ordinal special values (§4.6): only `SELF` and positive 1-based
/// dependency indices are supported; flat/main-executable/dynamic-lookup
/// ordinals are rejected since a closed cache build has no symbol-search
/// order to fall back on.
fn resolve_ordinal(node: usize, depends_on: &[Vec<usize>], ordinal: i64) -> Result<usize> {
    if ordinal == i64::from(BIND_SPECIAL_DYLIB_SELF) {
        return Ok(node);
    }
    if ordinal == i64::from(BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE) {
        return Err(Error::unsupported("BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE ordinal is not supported by this builder"));
    }
    if ordinal == i64::from(BIND_SPECIAL_DYLIB_FLAT_LOOKUP) {
        return Err(Error::unsupported("flat-namespace (dynamic) lookup ordinal is not supported by this builder"));
    }
    if ordinal <= 0 {
        return Err(Error::unsupported("unrecognized special bind ordinal"));
    }
    depends_on[node]
        .get(ordinal as usize - 1)
        .copied()
        .ok_or_else(|| Error::malformed("bind ordinal out of range of this dylib's dependency list"))
}

struct BindState {
    kind: u8,
    seg_index: usize,
    offset: u64,
    ordinal: i64,
    addend: i64,
    name: Vec<u8>,
}

impl Default for BindState {
    fn default() -> Self {
        BindState {
            kind: BIND_TYPE_POINTER,
            seg_index: 0,
            offset: 0,
            ordinal: 0,
            addend: 0,
            name: Vec::new(),
        }
    }
}

fn segment_new_va(layout: &DylibLayout, seg_index: usize, offset_in_seg: u64) -> Result<u64> {
    let seg = layout
        .segments
        .get(seg_index)
        .ok_or_else(|| Error::malformed("bind opcode referenced an out-of-range segment index"))?;
    let new_addr = seg.new_addr.ok_or_else(|| Error::malformed("segment has not been placed yet"))?;
    Ok(new_addr + offset_in_seg)
}

/// Interprets one dyld-info bind (or lazy-bind) opcode stream, resolving
/// every named symbol through `cache` and writing the bound pointer.
fn run_bind_stream(
    stream: &[u8],
    node: usize,
    layout: &DylibLayout,
    buffer: &mut CacheBuffer,
    cache: &ExportCache,
    depends_on: &[Vec<usize>],
    pointers_in_data: &mut HashSet<u64>,
) -> Result<()> {
    let endian = layout.arch.endianness;
    let ptr_size = u64::from(layout.arch.pointer_size);
    let mut pos = 0usize;
    let mut st = BindState::default();

    let do_bind = |st: &BindState, buffer: &mut CacheBuffer, pointers_in_data: &mut HashSet<u64>| -> Result<()> {
        let site_va = segment_new_va(layout, st.seg_index, st.offset)?;
        let target_node = resolve_ordinal(node, depends_on, st.ordinal)?;
        let resolved = cache
            .find_exported(target_node, &st.name)?
            .ok_or_else(|| Error::resolution(format!("undefined symbol {}", String::from_utf8_lossy(&st.name))))?;
        let base = cache.final_address(&resolved)?;
        let value = (base as i64 + st.addend) as u64;
        match st.kind {
            BIND_TYPE_POINTER => {
                if layout.arch.is_64() {
                    buffer.write_u64(site_va, value, endian)?;
                } else {
                    buffer.write_u32(site_va, value as u32, endian)?;
                }
            }
            BIND_TYPE_TEXT_ABSOLUTE32 => buffer.write_u32(site_va, value as u32, endian)?,
            _ => return Err(Error::unsupported("BIND_TYPE_TEXT_PCREL32 is not supported by this builder")),
        }
        pointers_in_data.insert(site_va);
        Ok(())
    };

    loop {
        let byte = *stream.get(pos).ok_or_else(|| Error::malformed("truncated bind opcode"))?;
        pos += 1;
        let opcode = byte & BIND_OPCODE_MASK;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match opcode {
            BIND_OPCODE_DONE => {
                // A lazy-bind stream packs many independent "do one bind,
                // then done" records back to back; the caller re-enters at
                // the next record, so only a real end-of-stream exits here.
                if pos >= stream.len() {
                    break;
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => st.ordinal = i64::from(imm),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => st.ordinal = read_uleb(stream, &mut pos)? as i64,
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // Sign-extend the 4-bit immediate (0 or negative specials).
                st.ordinal = if imm == 0 { 0 } else { i64::from(imm as i8 | !0x0f_i8) };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let start = pos;
                let end = stream[start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| start + p)
                    .ok_or_else(|| Error::malformed("unterminated bind symbol name"))?;
                st.name = stream[start..end].to_vec();
                pos = end + 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => st.kind = imm,
            BIND_OPCODE_SET_ADDEND_SLEB => st.addend = read_sleb128(stream, &mut pos).map_err(Error::from)?,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                st.seg_index = imm as usize;
                st.offset = read_uleb(stream, &mut pos)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => st.offset += read_uleb(stream, &mut pos)?,
            BIND_OPCODE_DO_BIND => {
                do_bind(&st, buffer, pointers_in_data)?;
                st.offset += ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                do_bind(&st, buffer, pointers_in_data)?;
                st.offset += ptr_size + read_uleb(stream, &mut pos)?;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                do_bind(&st, buffer, pointers_in_data)?;
                st.offset += ptr_size + u64::from(imm) * ptr_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb(stream, &mut pos)?;
                let skip = read_uleb(stream, &mut pos)?;
                for _ in 0..count {
                    do_bind(&st, buffer, pointers_in_data)?;
                    st.offset += ptr_size + skip;
                }
            }
            _ => return Err(Error::malformed("unrecognized bind opcode")),
        }
    }
    Ok(())
}

fn read_uleb(data: &[u8], pos: &mut usize) -> Result<u64> {
    read_uleb128(data, pos).map_err(Error::from)
}

/// Runs both the standard and lazy bind streams of `node` against
/// `buffer`. Weak-bind is a symbol-coalescing pass over already-bound
/// definitions and carries no site rewrites of its own; out of scope here
/// (see DESIGN.md).
pub fn bind_dylib(
    source: &[u8],
    node: usize,
    layout: &DylibLayout,
    buffer: &mut CacheBuffer,
    cache: &ExportCache,
    depends_on: &[Vec<usize>],
    pointers_in_data: &mut HashSet<u64>,
) -> Result<()> {
    let Some(info) = layout.dyld_info else { return Ok(()) };
    if info.bind_size > 0 {
        let stream = source
            .get(info.bind_off as usize..(info.bind_off + info.bind_size) as usize)
            .ok_or_else(|| Error::malformed("bind stream runs past end of file"))?;
        run_bind_stream(stream, node, layout, buffer, cache, depends_on, pointers_in_data)?;
    }
    if info.lazy_bind_size > 0 {
        let stream = source
            .get(info.lazy_bind_off as usize..(info.lazy_bind_off + info.lazy_bind_size) as usize)
            .ok_or_else(|| Error::malformed("lazy bind stream runs past end of file"))?;
        run_bind_stream(stream, node, layout, buffer, cache, depends_on, pointers_in_data)?;
    }
    Ok(())
}

/// C6's "hoist private re-exports" pass plus address rebasing: builds the
/// final export trie a cache-included dylib should carry, resolving any
/// re-export that targets a dylib *outside* the shared set down to a
/// concrete, already-slid address (§4.6), while re-exports that target
/// another cache member are kept symbolic with their ordinal rewritten to
/// the member's position in `final_ordinal`.
pub fn finalize_export_trie(
    node: usize,
    layout: &DylibLayout,
    depends_on: &[Vec<usize>],
    shareable: &HashSet<usize>,
    final_ordinal: &HashMap<usize, u32>,
    cache: &ExportCache,
) -> Result<Vec<u8>> {
    let entries = cache_own_trie_for_finalize(node, cache)?;
    let mut out = Vec::new();
    for mut entry in entries {
        let name = String::from_utf8_lossy(&entry.name);
        if name.starts_with("$ld$") || name.starts_with(".objc_class_name") || name.starts_with(".objc_category_name") {
            continue;
        }

        if entry.is_reexport() {
            let Some(ordinal) = entry.other else { continue };
            if ordinal == 0 || ordinal as usize > depends_on[node].len() {
                continue;
            }
            let target_node = depends_on[node][ordinal as usize - 1];
            if shareable.contains(&target_node) {
                if let Some(&new_ordinal) = final_ordinal.get(&target_node) {
                    entry.other = Some(u64::from(new_ordinal));
                    out.push(entry);
                }
                continue;
            }
            let lookup_name = entry.import_name.clone().unwrap_or_else(|| entry.name.clone());
            if let Some(resolved) = cache.find_exported(target_node, &lookup_name)? {
                let address = cache.final_address(&resolved)?;
                out.push(TrieEntry {
                    name: entry.name,
                    address,
                    flags: resolved.flags & !EXPORT_SYMBOL_FLAGS_REEXPORT,
                    other: None,
                    import_name: None,
                });
            }
            continue;
        }

        let slide = slide_for_original_va(layout, entry.address)?;
        entry.address = (entry.address as i64 + slide) as u64;
        out.push(entry);
    }
    Ok(trie::build(&out))
}

fn cache_own_trie_for_finalize(node: usize, cache: &ExportCache) -> Result<Vec<TrieEntry>> {
    cache.own_trie(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_ordinal_resolves_to_own_node() {
        let depends_on = vec![vec![1, 2]];
        assert_eq!(resolve_ordinal(0, &depends_on, 0).unwrap(), 0);
        assert_eq!(resolve_ordinal(0, &depends_on, 1).unwrap(), 1);
        assert_eq!(resolve_ordinal(0, &depends_on, 2).unwrap(), 2);
        assert!(resolve_ordinal(0, &depends_on, -1).is_err());
        assert!(resolve_ordinal(0, &depends_on, -2).is_err());
        assert!(resolve_ordinal(0, &depends_on, 3).is_err());
    }
}
