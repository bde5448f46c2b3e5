//! Structure shared by the shadow and the host tree: an arena of nodes keyed by id, with ordered child
//! id lists on parents and a weak parent id on children.

use crate::{
	id::IdError,
	node::{NodeId, SlotIndex, TemplateRef},
};
use hashbrown::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
	#[error("unknown node {0}")]
	UnknownNode(NodeId),
	#[error("unknown template {0}")]
	UnknownTemplate(TemplateRef),
	#[error("node {0} already exists")]
	DuplicateId(NodeId),
	#[error("node {child} is not a child of {parent}")]
	NotAChild { parent: NodeId, child: NodeId },
	#[error("node {parent} has no slot {slot_index}")]
	InvalidSlot { parent: NodeId, slot_index: SlotIndex },
	#[error("cannot insert {child} (slot {slot_index}) before {before} (slot {before_slot})")]
	SlotMismatch { child: NodeId, slot_index: SlotIndex, before: NodeId, before_slot: SlotIndex },
	#[error("cannot insert {child} into its own subtree at {parent}")]
	Cycle { parent: NodeId, child: NodeId },
	#[error("cannot insert {0} before itself")]
	BeforeSelf(NodeId),
	#[error("the root {0} cannot be moved or removed")]
	Root(NodeId),
	#[error("the tree is attached, so new nodes only arrive through patches")]
	Attached,
	#[error("part {part} is out of range for node {id} with {hole_count} hole(s)")]
	PartOutOfRange { id: NodeId, part: usize, hole_count: usize },
	#[error(transparent)]
	Id(#[from] IdError),
}

/// The structural view of a node both trees provide.
pub(crate) trait TreeNode {
	fn parent(&self) -> Option<NodeId>;
	fn set_parent(&mut self, parent: Option<NodeId>);
	fn children(&self) -> &[NodeId];
	fn children_mut(&mut self) -> &mut Vec<NodeId>;
	fn slot_index(&self) -> SlotIndex;
}

pub(crate) fn get<N>(nodes: &HashMap<NodeId, N>, id: NodeId) -> Result<&N, TreeError> {
	nodes.get(&id).ok_or(TreeError::UnknownNode(id))
}

pub(crate) fn get_mut<N>(nodes: &mut HashMap<NodeId, N>, id: NodeId) -> Result<&mut N, TreeError> {
	nodes.get_mut(&id).ok_or(TreeError::UnknownNode(id))
}

/// Whether `ancestor` is `id` or one of its ancestors.
pub(crate) fn is_ancestor_or_self<N: TreeNode>(nodes: &HashMap<NodeId, N>, ancestor: NodeId, id: NodeId) -> bool {
	let mut current = Some(id);
	while let Some(id) = current {
		if id == ancestor {
			return true;
		}
		current = nodes.get(&id).and_then(TreeNode::parent);
	}
	false
}

/// Checks an insertion without changing anything and returns the index `child` will land at
/// in `parent`'s children *after* it has been detached from its current position.
///
/// Siblings are grouped by ascending slot index. Without `before`, `child` goes to the end of its slot group.
pub(crate) fn check_insert<N: TreeNode>(nodes: &HashMap<NodeId, N>, root: NodeId, parent: NodeId, child: NodeId, before: Option<NodeId>) -> Result<usize, TreeError> {
	let parent_node = get(nodes, parent)?;
	let child_node = get(nodes, child)?;
	if child == root {
		return Err(TreeError::Root(child));
	}
	if is_ancestor_or_self(nodes, child, parent) {
		return Err(TreeError::Cycle { parent, child });
	}
	let slot_index = child_node.slot_index();
	let siblings = parent_node.children().iter().copied().filter(|&sibling| sibling != child);

	match before {
		Some(before) if before == child => Err(TreeError::BeforeSelf(child)),
		Some(before) => {
			let index = siblings.clone().position(|sibling| sibling == before).ok_or(TreeError::NotAChild { parent, child: before })?;
			let before_slot = get(nodes, before)?.slot_index();
			if before_slot == slot_index {
				Ok(index)
			} else {
				Err(TreeError::SlotMismatch {
					child,
					slot_index,
					before,
					before_slot,
				})
			}
		}
		None => {
			let mut index = 0;
			for sibling in siblings {
				if get(nodes, sibling)?.slot_index() > slot_index {
					break;
				}
				index += 1;
			}
			Ok(index)
		}
	}
}

/// Removes `child` from its parent's children, if it has a parent. Returns the former parent.
pub(crate) fn detach<N: TreeNode>(nodes: &mut HashMap<NodeId, N>, child: NodeId) -> Option<NodeId> {
	let parent = nodes.get_mut(&child)?.parent()?;
	if let Some(parent_node) = nodes.get_mut(&parent) {
		parent_node.children_mut().retain(|&sibling| sibling != child);
	}
	if let Some(child_node) = nodes.get_mut(&child) {
		child_node.set_parent(None);
	}
	Some(parent)
}

/// Detaches `child` and reinserts it under `parent` at an index obtained from [`check_insert`].
pub(crate) fn attach<N: TreeNode>(nodes: &mut HashMap<NodeId, N>, parent: NodeId, child: NodeId, index: usize) {
	detach(nodes, child);
	if let Some(parent_node) = nodes.get_mut(&parent) {
		let children = parent_node.children_mut();
		let index = index.min(children.len());
		children.insert(index, child);
	}
	if let Some(child_node) = nodes.get_mut(&child) {
		child_node.set_parent(Some(parent));
	}
}

/// `id` and all its descendants, parents before children.
pub(crate) fn subtree<N: TreeNode>(nodes: &HashMap<NodeId, N>, id: NodeId) -> Vec<NodeId> {
	let mut ids = vec![id];
	let mut i = 0;
	while i < ids.len() {
		if let Some(node) = nodes.get(&ids[i]) {
			ids.extend_from_slice(node.children());
		}
		i += 1;
	}
	ids
}

/// The sibling right after `id` under its parent, if any.
pub(crate) fn next_sibling<N: TreeNode>(nodes: &HashMap<NodeId, N>, id: NodeId) -> Option<NodeId> {
	let parent = nodes.get(&id)?.parent()?;
	let siblings = nodes.get(&parent)?.children();
	let index = siblings.iter().position(|&sibling| sibling == id)?;
	siblings.get(index + 1).copied()
}
