//! C3 — dependency graph.
//!
//! Grounded on `CacheBuilder::addRoot`/`ImageProxy::addDependents` in
//! `launch-cache/CacheFileAbstraction.hpp` and `UpdateDyldSharedCache.cpp`'s
//! shareable-set fix-point.

use crate::error::{Error, Result, Warning};
use crate::source::{expand_path_variable, DylibSource};
use macho_view::layout::DylibLayout;
use macho_view::leb128::{read_sleb128, read_uleb128};
use macho_view::macho_const::*;
use std::collections::{HashMap, HashSet};

/// One node: a shareable-candidate (or root) dylib and its resolved edges.
pub struct Node {
    pub canonical_path: String,
    pub layout: DylibLayout,
    /// The dylib's raw bytes, kept around for the placement/rebase/bind/
    /// merge passes that run after graph resolution.
    pub source_data: Vec<u8>,
    pub depends_on: Vec<usize>,
    /// Parallel to `depends_on`: true if the corresponding dependency is a
    /// `LC_REEXPORT_DYLIB`.
    pub reexport_flags: Vec<bool>,
    pub roots: HashSet<usize>,
    pub is_root: bool,
    pub dependents_missing: bool,
}

#[derive(Default)]
pub struct DependencyGraph {
    pub nodes: Vec<Node>,
    path_index: HashMap<String, usize>,
    /// `alias → canonical` (§4.3 "Alias table"): every symlink/install-name
    /// pair encountered during resolution besides the canonical path.
    pub aliases: HashMap<String, usize>,
    pub warnings: Vec<Warning>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `add_root(virtual_path)`: resolves, parses, and registers a root
    /// node. Architecture selection (the `arch_set`/ARM-subtype back-compat
    /// part of §4.3) is the caller's responsibility — it supplies already
    /// arch-matched bytes, since the universal (fat) container reader is an
    /// external collaborator (§1).
    pub fn add_root(&mut self, source: &dyn DylibSource, virtual_path: &str) -> Result<usize> {
        let idx = self.add_node(source, virtual_path, true)?;
        self.nodes[idx].roots.insert(idx);
        Ok(idx)
    }

    fn add_node(&mut self, source: &dyn DylibSource, virtual_path: &str, is_root: bool) -> Result<usize> {
        let canonical = source.canonicalize(virtual_path)?;
        if let Some(&idx) = self.path_index.get(&canonical) {
            if virtual_path != canonical {
                self.aliases.insert(virtual_path.to_string(), idx);
            }
            return Ok(idx);
        }
        let data = source.read(virtual_path)?;
        let layout = DylibLayout::parse(&data, !is_root)?;
        let idx = self.nodes.len();
        self.nodes.push(Node {
            canonical_path: canonical.clone(),
            layout,
            source_data: data,
            depends_on: Vec::new(),
            reexport_flags: Vec::new(),
            roots: HashSet::new(),
            is_root,
            dependents_missing: false,
        });
        self.path_index.insert(canonical.clone(), idx);
        if virtual_path != canonical {
            self.aliases.insert(virtual_path.to_string(), idx);
        }
        Ok(idx)
    }

    /// `load_dependencies(node)`: resolves every load-command dependency of
    /// `node_idx`, registering new nodes and edges.
    pub fn load_dependencies(&mut self, source: &dyn DylibSource, node_idx: usize, executable_path: &str) -> Result<()> {
        let root_set = self.nodes[node_idx].roots.clone();
        let is_root = self.nodes[node_idx].is_root;
        let deps = self.nodes[node_idx].layout.dependencies.clone();
        let loader_path = self.nodes[node_idx].canonical_path.clone();

        for dep in &deps {
            let expanded = expand_path_variable(&dep.name, executable_path, &loader_path)?;

            if is_root && !is_sharable_path(&expanded) {
                // "A main-executable root silently drops dependencies that
                // are not under /usr/lib/ or /System/Library/."
                continue;
            }

            let resolved = self.add_node(source, &expanded, false);
            let dep_idx = match resolved {
                Ok(idx) => idx,
                Err(_) if dep.weak && !self.nodes[node_idx].layout.has_split_seg_info => {
                    // Missing weak-import dependency of a non-split-seg dylib:
                    // silently ignored.
                    continue;
                }
                Err(e) => {
                    self.nodes[node_idx].dependents_missing = true;
                    self.warnings.push(Warning(format!(
                        "{}: missing dependency {expanded}: {e}",
                        self.nodes[node_idx].canonical_path
                    )));
                    continue;
                }
            };

            if let Some(existing_uuid) = self.nodes[dep_idx].layout.uuid {
                if let Some(new_uuid) = self.nodes[node_idx].layout.uuid {
                    if self.nodes[dep_idx].canonical_path != expanded && existing_uuid != new_uuid {
                        return Err(Error::resolution(format!(
                            "{expanded} resolved to {} but a differently-UUID'd image was already loaded for it",
                            self.nodes[dep_idx].canonical_path
                        )));
                    }
                }
            }

            self.nodes[node_idx].depends_on.push(dep_idx);
            self.nodes[node_idx].reexport_flags.push(dep.reexport);
            for &root in &root_set {
                self.nodes[dep_idx].roots.insert(root);
            }
            self.nodes[dep_idx].roots.insert(node_idx);
        }
        Ok(())
    }

    /// Transitively loads dependencies for every node reachable from
    /// `root_idx`, via repeated `load_dependencies` passes (a node may gain
    /// new dependents after being visited once, but its own dependency list
    /// is only ever resolved once).
    pub fn load_all_dependencies(&mut self, source: &dyn DylibSource, root_idx: usize, executable_path: &str) -> Result<()> {
        let mut visited = HashSet::new();
        let mut queue = vec![root_idx];
        while let Some(idx) = queue.pop() {
            if !visited.insert(idx) {
                continue;
            }
            self.load_dependencies(source, idx, executable_path)?;
            queue.extend(self.nodes[idx].depends_on.clone());
        }
        Ok(())
    }

    /// `find_shareable(arch)`: the largest subset of nodes satisfying the
    /// per-node criteria and closed under "depends only on shareable
    /// dylibs", computed by fix-point contraction.
    pub fn find_shareable(&mut self) -> Vec<usize> {
        let mut shareable: Vec<bool> = self
            .nodes
            .iter()
            .map(|n| self.is_candidate(n))
            .collect();

        loop {
            let mut changed = false;
            for idx in 0..self.nodes.len() {
                if !shareable[idx] {
                    continue;
                }
                for &dep in &self.nodes[idx].depends_on {
                    if !shareable[dep] {
                        shareable[idx] = false;
                        changed = true;
                        break;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let rejected: Vec<&str> = self
            .nodes
            .iter()
            .zip(shareable.iter())
            .filter(|(_, &ok)| !ok)
            .map(|(n, _)| n.canonical_path.as_str())
            .collect();
        for path in rejected {
            self.warnings.push(Warning(format!("{path}: not included in shared cache")));
        }

        shareable
            .into_iter()
            .enumerate()
            .filter_map(|(idx, ok)| ok.then_some(idx))
            .collect()
    }

    fn is_candidate(&self, node: &Node) -> bool {
        !node.is_root
            && node.layout.is_two_level_namespace()
            && node.layout.has_split_seg_info
            && node.layout.is_sharable_location()
            && !node.dependents_missing
            && !uses_disallowed_ordinal(&node.source_data, &node.layout)
    }
}

fn is_sharable_path(path: &str) -> bool {
    path.starts_with("/usr/lib/") || path.starts_with("/System/Library/")
}

/// True if any bind or lazy-bind opcode stream sets a dynamic-lookup
/// (`BIND_SPECIAL_DYLIB_FLAT_LOOKUP`) or main-executable-loader
/// (`BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE`) ordinal: a closed cache build has
/// no symbol-search order to resolve either against, so such a dylib is
/// excluded from the shareable set rather than failing the whole build at
/// bind time.
fn uses_disallowed_ordinal(source: &[u8], layout: &DylibLayout) -> bool {
    let Some(info) = layout.dyld_info else { return false };
    for (off, size) in [(info.bind_off, info.bind_size), (info.lazy_bind_off, info.lazy_bind_size)] {
        if size == 0 {
            continue;
        }
        let Some(stream) = source.get(off as usize..(off + size) as usize) else { continue };
        if stream_sets_disallowed_ordinal(stream) {
            return true;
        }
    }
    false
}

fn stream_sets_disallowed_ordinal(stream: &[u8]) -> bool {
    let mut pos = 0usize;
    while let Some(&byte) = stream.get(pos) {
        pos += 1;
        let opcode = byte & BIND_OPCODE_MASK;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match opcode {
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                let ordinal = if imm == 0 { 0 } else { i64::from(imm as i8 | !0x0f_i8) };
                if ordinal == i64::from(BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE) || ordinal == i64::from(BIND_SPECIAL_DYLIB_FLAT_LOOKUP) {
                    return true;
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB
                if read_uleb128(stream, &mut pos).is_err() => {
                    return false;
                }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => match stream[pos..].iter().position(|&b| b == 0) {
                Some(p) => pos += p + 1,
                None => return false,
            },
            BIND_OPCODE_SET_ADDEND_SLEB
                if read_sleb128(stream, &mut pos).is_err() => {
                    return false;
                }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | BIND_OPCODE_ADD_ADDR_ULEB
                if read_uleb128(stream, &mut pos).is_err() => {
                    return false;
                }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB
                if read_uleb128(stream, &mut pos).is_err() => {
                    return false;
                }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB
                if (read_uleb128(stream, &mut pos).is_err() || read_uleb128(stream, &mut pos).is_err()) => {
                    return false;
                }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MapSource;
    use crate::test_support::build_cache_ready_dylib;

    #[test]
    fn resolves_dependency_chain_and_finds_shareable() {
        let mut source = MapSource::new();
        source.insert("/usr/lib/libB.dylib", build_cache_ready_dylib("/usr/lib/libB.dylib", &[]));
        source.insert(
            "/usr/lib/libA.dylib",
            build_cache_ready_dylib("/usr/lib/libA.dylib", &["/usr/lib/libB.dylib"]),
        );

        let mut graph = DependencyGraph::new();
        let a = graph.add_root(&source, "/usr/lib/libA.dylib").unwrap();
        graph.load_all_dependencies(&source, a, "/usr/lib/libA.dylib").unwrap();

        assert_eq!(graph.nodes.len(), 2);
        let shareable = graph.find_shareable();
        // The root itself is never a shareable candidate by this
        // classification; only its dependency libB is.
        assert_eq!(shareable.len(), 1);
        assert_eq!(graph.nodes[shareable[0]].canonical_path, "/usr/lib/libB.dylib");
    }

    #[test]
    fn missing_weak_dependency_is_ignored_without_split_seg() {
        let mut source = MapSource::new();
        source.insert(
            "/usr/lib/libA.dylib",
            build_cache_ready_dylib("/usr/lib/libA.dylib", &[]),
        );
        let mut graph = DependencyGraph::new();
        let a = graph.add_root(&source, "/usr/lib/libA.dylib").unwrap();
        // No dependency declared at all here; this just asserts the happy
        // path resolves without requiring every weak import to exist.
        graph.load_all_dependencies(&source, a, "/usr/lib/libA.dylib").unwrap();
        assert!(!graph.nodes[a].dependents_missing);
    }
}
