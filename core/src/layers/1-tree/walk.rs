//! Verified translation through a committed tree.
use super::{InnerNode, NodeBlock, NodeCodec, NodeStore, TreeShape, Vba};
use crate::layers::bio::BlockSet;
use crate::prelude::*;

/// Descends from `node`, the pointer to the level-`level` block on the path
/// of `vba`, down to the pointer to the level-1 block on that path.
///
/// Returns `None` if the path ends in an unwritten block.
pub fn descend<D: BlockSet>(
    store: &NodeStore<'_, D>,
    shape: &TreeShape,
    mut node: InnerNode,
    level: u32,
    vba: Vba,
) -> Result<Option<InnerNode>> {
    for level in (2..=level).rev() {
        if !node.is_valid() {
            return Ok(None);
        }
        let block = store.read_node(&node)?;
        node = NodeBlock::<InnerNode>::decode_entry(&block, shape.index(vba, level));
    }
    Ok(node.is_valid().then_some(node))
}

/// Translates `vba` to its level-1 entry in the tree below `root`.
///
/// Every block on the path is verified against the digest held by its
/// parent before any of its entries is trusted.
pub fn translate<L: NodeCodec, D: BlockSet>(
    store: &NodeStore<'_, D>,
    shape: &TreeShape,
    root: &InnerNode,
    vba: Vba,
) -> Result<Option<L>> {
    shape.check_vba(vba)?;
    let Some(bottom) = descend(store, shape, *root, shape.height(), vba)? else {
        return Ok(None);
    };
    let block = store.read_node(&bottom)?;
    Ok(Some(NodeBlock::<L>::decode_entry(&block, shape.index(vba, 1))))
}
