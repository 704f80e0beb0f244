//! C1 — export-symbol radix trie codec.
//!
//! Ground truth for the insertion algorithm is `launch-cache/MachOTrie.hpp`:
//! characters are inserted one edge at a time, splitting an existing edge
//! when only part of it is shared (`A -> C` becomes `A -> B -> C`). Nodes
//! live in an arena (`Vec<Node>`) addressed by index rather than raw
//! pointers, per the "cycles are expressed as indices" re-architecture note.

use crate::error::{Error, Result};
use crate::leb128::{read_uleb128, uleb128_size, write_uleb128};
use crate::macho_const::EXPORT_SYMBOL_FLAGS_REEXPORT;

/// One exported (or re-exported) symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieEntry {
    pub name: Vec<u8>,
    pub address: u64,
    pub flags: u32,
    /// 1-based ordinal of the dylib this symbol is re-exported from.
    pub other: Option<u64>,
    /// Name to look up in the source dylib; only set for re-exports.
    pub import_name: Option<Vec<u8>>,
}

impl TrieEntry {
    pub fn is_reexport(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0
    }
}

struct Edge {
    label: Vec<u8>,
    child: usize,
}

struct Node {
    cumulative: Vec<u8>,
    children: Vec<Edge>,
    terminal: Option<(u64, u32, Option<u64>, Option<Vec<u8>>)>,
    offset: u32,
}

impl Node {
    fn new(cumulative: Vec<u8>) -> Self {
        Node {
            cumulative,
            children: Vec::new(),
            terminal: None,
            offset: 0,
        }
    }
}

/// Builds and encodes an export trie blob.
pub struct TrieBuilder {
    nodes: Vec<Node>,
    insertion_order: Vec<Vec<u8>>,
}

impl Default for TrieBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieBuilder {
    pub fn new() -> Self {
        TrieBuilder {
            nodes: vec![Node::new(Vec::new())],
            insertion_order: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: &TrieEntry) {
        self.insertion_order.push(entry.name.clone());
        self.insert_at(0, &entry.name, entry);
    }

    fn insert_at(&mut self, node_idx: usize, full_name: &[u8], entry: &TrieEntry) {
        let cumulative_len = self.nodes[node_idx].cumulative.len();
        let partial = &full_name[cumulative_len..];

        let mut matched_edge = None;
        for (i, edge) in self.nodes[node_idx].children.iter().enumerate() {
            let shared = common_prefix_len(&edge.label, partial);
            if shared > 0 {
                matched_edge = Some((i, shared));
                break;
            }
        }

        match matched_edge {
            Some((i, shared)) if shared == self.nodes[node_idx].children[i].label.len() => {
                let child = self.nodes[node_idx].children[i].child;
                self.insert_at(child, full_name, entry);
            }
            Some((i, shared)) => {
                // Split: A -> C becomes A -> B -> C.
                let edge_label = self.nodes[node_idx].children[i].label.clone();
                let old_child = self.nodes[node_idx].children[i].child;
                let b_cumulative = {
                    let mut s = self.nodes[node_idx].cumulative.clone();
                    s.extend_from_slice(&edge_label[..shared]);
                    s
                };
                let b_idx = self.nodes.len();
                self.nodes.push(Node::new(b_cumulative));
                self.nodes[node_idx].children[i] = Edge {
                    label: edge_label[..shared].to_vec(),
                    child: b_idx,
                };
                self.nodes[b_idx].children.push(Edge {
                    label: edge_label[shared..].to_vec(),
                    child: old_child,
                });
                self.insert_at(b_idx, full_name, entry);
            }
            None => {
                let new_idx = self.nodes.len();
                self.nodes.push(Node::new(full_name.to_vec()));
                self.nodes[node_idx].children.push(Edge {
                    label: partial.to_vec(),
                    child: new_idx,
                });
                self.nodes[new_idx].terminal =
                    Some((entry.address, entry.flags, entry.other, entry.import_name.clone()));
            }
        }
    }

    /// Pre-order walk of entry names: for each entry, in insertion order,
    /// follow the path from the root and record each node the first time
    /// it is visited.
    fn ordered_nodes(&self) -> Vec<usize> {
        let mut ordered = Vec::new();
        let mut seen = vec![false; self.nodes.len()];
        for name in &self.insertion_order {
            self.walk_order(0, name, &mut ordered, &mut seen);
        }
        ordered
    }

    fn walk_order(&self, node_idx: usize, name: &[u8], ordered: &mut Vec<usize>, seen: &mut [bool]) {
        if !seen[node_idx] {
            seen[node_idx] = true;
            ordered.push(node_idx);
        }
        let cumulative_len = self.nodes[node_idx].cumulative.len();
        let partial = &name[cumulative_len..];
        for edge in &self.nodes[node_idx].children {
            if partial.starts_with(&edge.label[..]) {
                self.walk_order(edge.child, name, ordered, seen);
                return;
            }
        }
    }

    fn terminal_bytes(&self, node_idx: usize) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some((address, flags, other, ref import_name)) = self.nodes[node_idx].terminal {
            write_uleb128(u64::from(flags), &mut out);
            write_uleb128(address, &mut out);
            if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
                write_uleb128(other.unwrap_or(0), &mut out);
                if let Some(name) = import_name {
                    out.extend_from_slice(name);
                }
                out.push(0);
            }
        }
        out
    }

    fn node_size(&self, node_idx: usize) -> u32 {
        let terminal = self.terminal_bytes(node_idx);
        let mut size = if self.nodes[node_idx].terminal.is_some() {
            uleb128_size(terminal.len() as u64) + terminal.len()
        } else {
            1
        };
        size += 1; // child count byte
        for edge in &self.nodes[node_idx].children {
            size += edge.label.len() + 1 + uleb128_size(u64::from(self.nodes[edge.child].offset));
        }
        size as u32
    }

    /// Encode the trie. Offsets are assigned by iterating node sizes to a
    /// fixed point, since a node's encoded size depends on the uleb128 size
    /// of its children's offsets.
    pub fn build(&mut self) -> Vec<u8> {
        let order = self.ordered_nodes();
        loop {
            let mut offset = 0u32;
            let mut changed = false;
            for &idx in &order {
                let size = self.node_size(idx);
                if self.nodes[idx].offset != offset {
                    changed = true;
                }
                self.nodes[idx].offset = offset;
                offset += size;
            }
            if !changed {
                break;
            }
        }

        let mut out = Vec::new();
        for &idx in &order {
            let terminal = self.terminal_bytes(idx);
            if self.nodes[idx].terminal.is_some() {
                write_uleb128(terminal.len() as u64, &mut out);
                out.extend_from_slice(&terminal);
            } else {
                out.push(0);
            }
            out.push(self.nodes[idx].children.len() as u8);
            for edge in &self.nodes[idx].children {
                out.extend_from_slice(&edge.label);
                out.push(0);
                write_uleb128(u64::from(self.nodes[edge.child].offset), &mut out);
            }
        }
        out
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Builds a trie blob from a set of entries, in the order given.
pub fn build(entries: &[TrieEntry]) -> Vec<u8> {
    let mut builder = TrieBuilder::new();
    for entry in entries {
        builder.insert(entry);
    }
    builder.build()
}

/// Parses a trie blob back into entries, in the original layout order.
pub fn parse(data: &[u8]) -> Result<Vec<TrieEntry>> {
    let mut collected = Vec::new();
    let mut name_buf = Vec::new();
    parse_node(data, 0, &mut name_buf, &mut collected)?;
    collected.sort_by_key(|c| c.offset);
    Ok(collected.into_iter().map(|c| c.entry).collect())
}

struct CollectedEntry {
    offset: usize,
    entry: TrieEntry,
}

fn parse_node(
    data: &[u8],
    offset: usize,
    name_buf: &mut Vec<u8>,
    out: &mut Vec<CollectedEntry>,
) -> Result<()> {
    let mut pos = offset;
    let terminal_size = read_uleb128(data, &mut pos)? as usize;
    if terminal_size > 0 {
        let terminal_start = pos;
        let flags = read_uleb128(data, &mut pos)? as u32;
        let address = read_uleb128(data, &mut pos)?;
        let (other, import_name) = if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let other = read_uleb128(data, &mut pos)?;
            let start = pos;
            let end = data[start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| start + p)
                .ok_or_else(|| Error::trie("unterminated re-export import name"))?;
            let name = data[start..end].to_vec();
            pos = end + 1;
            (Some(other), Some(name))
        } else {
            (None, None)
        };
        if pos > terminal_start + terminal_size {
            return Err(Error::trie("terminal info overruns its declared size"));
        }
        out.push(CollectedEntry {
            offset,
            entry: TrieEntry {
                name: name_buf.clone(),
                address,
                flags,
                other,
                import_name,
            },
        });
        pos = terminal_start + terminal_size;
    }

    let child_count = *data.get(pos).ok_or_else(|| Error::trie("truncated child count"))?;
    pos += 1;
    for _ in 0..child_count {
        let label_start = pos;
        let label_end = data[label_start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| label_start + p)
            .ok_or_else(|| Error::trie("unterminated edge label"))?;
        let label = &data[label_start..label_end];
        pos = label_end + 1;
        let child_offset = read_uleb128(data, &mut pos)? as usize;
        if child_offset >= data.len() {
            return Err(Error::trie("child node offset outside trie blob"));
        }
        let name_len = name_buf.len();
        name_buf.extend_from_slice(label);
        parse_node(data, child_offset, name_buf, out)?;
        name_buf.truncate(name_len);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, address: u64) -> TrieEntry {
        TrieEntry {
            name: name.as_bytes().to_vec(),
            address,
            flags: 0,
            other: None,
            import_name: None,
        }
    }

    #[test]
    fn round_trip_order_preserving() {
        let entries = vec![
            entry("_foo", 0x1000),
            entry("_foobar", 0x1010),
            entry("_bar", 0x2000),
            entry("_baz", 0x2010),
        ];
        let blob = build(&entries);
        let parsed = parse(&blob).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn reexport_round_trip() {
        let entries = vec![TrieEntry {
            name: b"_shared".to_vec(),
            address: 0,
            flags: EXPORT_SYMBOL_FLAGS_REEXPORT,
            other: Some(3),
            import_name: Some(b"_shared_impl".to_vec()),
        }];
        let blob = build(&entries);
        let parsed = parse(&blob).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn single_entry_layout() {
        let entries = vec![entry("_only", 0x4000)];
        let blob = build(&entries);
        let parsed = parse(&blob).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn malformed_child_offset_fails() {
        let mut blob = vec![0u8, 1]; // no terminal, one child
        blob.extend_from_slice(b"x\0");
        write_uleb128(9999, &mut blob);
        assert!(parse(&blob).is_err());
    }
}
