//! Per-slot quad-tree index inside a feature pack.
//!
//! The tree maps quad keys (paths of child positions below the pack's index
//! tile) to feature-span offsets in the pack body. Nodes are byte ranges, not
//! a pointer graph: each node is serialized pre-order as
//!
//! ```text
//! varint(span_offset + 1, or 0 when the node has no span)
//! varint(child presence mask, bits 0..3 in quad-position order)
//! per present child: varint(subtree byte length), subtree
//! ```
//!
//! Traversal descends along the request tile's quad key, yielding spans on
//! the path (features whose best tile is an ancestor of the request overlap
//! it by construction) and every span in the subtree below the final node.

use prost::encoding::{decode_varint, encode_varint};

use crate::tile::{quad_key, TileCoord};
use crate::{Error, Result};

/// One quad-tree input: the best-fitting tile of a feature run and the pack
/// offset of its span.
#[derive(Debug, Clone, Copy)]
pub struct QuadTreeEntry {
    pub tile: TileCoord,
    pub span_offset: u32,
}

#[derive(Default)]
struct Node {
    span: Option<u32>,
    children: [Option<Box<Node>>; 4],
}

/// Build the serialized quad tree for `entries` below `root`. Empty input
/// serializes to an empty string.
pub fn make_quad_tree(root: TileCoord, entries: &[QuadTreeEntry]) -> Vec<u8> {
    if entries.is_empty() {
        return Vec::new();
    }

    let mut tree = Node::default();
    for entry in entries {
        let mut node = &mut tree;
        for pos in quad_key(root, entry.tile) {
            node = node.children[pos as usize].get_or_insert_with(Default::default);
        }
        debug_assert!(node.span.is_none(), "one span per quad key");
        node.span = Some(entry.span_offset);
    }

    serialize(&tree)
}

fn serialize(node: &Node) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_varint(node.span.map_or(0, |offset| offset as u64 + 1), &mut buf);

    let mask = node
        .children
        .iter()
        .enumerate()
        .fold(0u64, |mask, (i, child)| {
            mask | ((child.is_some() as u64) << i)
        });
    encode_varint(mask, &mut buf);

    for child in node.children.iter().flatten() {
        let bytes = serialize(child);
        encode_varint(bytes.len() as u64, &mut buf);
        buf.extend_from_slice(&bytes);
    }
    buf
}

/// Walk the tree along `path`, invoking `on_span` for every reachable span:
/// spans on the descent path plus the entire subtree under its last node.
pub fn walk_quad_tree(tree: &[u8], path: &[u8], on_span: &mut impl FnMut(u32)) -> Result<()> {
    if tree.is_empty() {
        return Ok(());
    }
    walk_node(tree, path, on_span)
}

fn walk_node(mut bytes: &[u8], path: &[u8], on_span: &mut impl FnMut(u32)) -> Result<()> {
    let span = decode_varint(&mut bytes)?;
    if span > 0 {
        on_span((span - 1) as u32);
    }
    let mask = decode_varint(&mut bytes)?;

    for pos in 0..4u8 {
        if mask & (1 << pos) == 0 {
            continue;
        }
        let len = decode_varint(&mut bytes)? as usize;
        if len > bytes.len() {
            return Err(Error::Invariant("quad tree node exceeds buffer".into()));
        }
        let (child, rest) = bytes.split_at(len);
        bytes = rest;

        match path.split_first() {
            // Past the request tile: emit the whole subtree.
            None => walk_node(child, &[], on_span)?,
            Some((&next, remainder)) if next == pos => walk_node(child, remainder, on_span)?,
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(tree: &[u8], path: &[u8]) -> Vec<u32> {
        let mut spans = Vec::new();
        walk_quad_tree(tree, path, &mut |offset| spans.push(offset)).unwrap();
        spans.sort_unstable();
        spans
    }

    #[test]
    fn test_empty_tree() {
        let tree = make_quad_tree(TileCoord::new(0, 0, 0), &[]);
        assert!(tree.is_empty());
        assert_eq!(collect(&tree, &[0, 1]), Vec::<u32>::new());
    }

    #[test]
    fn test_root_span_reached_from_every_path() {
        let root = TileCoord::new(0, 0, 0);
        let tree = make_quad_tree(root, &[QuadTreeEntry { tile: root, span_offset: 8 }]);
        assert_eq!(collect(&tree, &[]), vec![8]);
        assert_eq!(collect(&tree, &[3, 1, 0]), vec![8]);
    }

    #[test]
    fn test_subtree_and_path_yields() {
        let root = TileCoord::new(0, 0, 0);
        // Root span, one span in the NW child, one deep in the SE corner.
        let entries = [
            QuadTreeEntry { tile: root, span_offset: 10 },
            QuadTreeEntry { tile: TileCoord::new(0, 0, 1), span_offset: 20 },
            QuadTreeEntry { tile: TileCoord::new(3, 3, 2), span_offset: 30 },
        ];
        let tree = make_quad_tree(root, &entries);

        // Request at the root: everything.
        assert_eq!(collect(&tree, &[]), vec![10, 20, 30]);
        // Request the NW child: root (ancestor) + its own span.
        assert_eq!(collect(&tree, &[0]), vec![10, 20]);
        // Request the SE corner at z2: root span + the deep span.
        assert_eq!(collect(&tree, &[3, 3]), vec![10, 30]);
        // Request below the deep span: still reachable as an ancestor.
        assert_eq!(collect(&tree, &[3, 3, 1]), vec![10, 30]);
        // A sibling quadrant sees only the root span.
        assert_eq!(collect(&tree, &[1]), vec![10]);
    }

    #[test]
    fn test_non_root_index_tile() {
        let root = TileCoord::new(5, 9, 4);
        let child = root.children()[2];
        let grandchild = child.children()[1];
        let entries = [
            QuadTreeEntry { tile: child, span_offset: 4 },
            QuadTreeEntry { tile: grandchild, span_offset: 12 },
        ];
        let tree = make_quad_tree(root, &entries);
        assert_eq!(collect(&tree, &[]), vec![4, 12]);
        assert_eq!(collect(&tree, &[2]), vec![4, 12]);
        assert_eq!(collect(&tree, &[2, 1]), vec![4, 12]);
        assert_eq!(collect(&tree, &[2, 0]), vec![4]);
        assert_eq!(collect(&tree, &[0]), Vec::<u32>::new());
    }

    #[test]
    fn test_truncated_tree_fails() {
        let root = TileCoord::new(0, 0, 0);
        let entries = [QuadTreeEntry { tile: TileCoord::new(1, 1, 2), span_offset: 7 }];
        let mut tree = make_quad_tree(root, &entries);
        tree.truncate(tree.len() - 1);
        let result = walk_quad_tree(&tree, &[], &mut |_| {});
        assert!(result.is_err());
    }
}
