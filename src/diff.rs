//! The incremental diff engine.
//!
//! There is no tree-to-tree diff here. Every [`ShadowTree`](`crate::shadow::ShadowTree`) mutation made
//! after attachment is recorded as the matching [`Operation`] as it happens, so the patch is exactly the
//! sequence of edits that was applied.
//!
//! Flushing rewrites the recording in one forward pass:
//!
//! - Nodes created and destroyed within the same window ("doomed" nodes) vanish from the patch entirely.
//!   Anchors pointing at them are replaced by an append, and the affected parent's order is restated at the end.
//! - Nodes created within the window ship their final values once, right after their `CreateElement`.
//!
//! A doomed node that ever held a node which isn't doomed itself can't be skipped like that, since the host
//! never learns where the held node went in the meantime. Such windows are rebuilt from the final tree
//! instead: the structure of every node that moved is restated top-down, and committed nodes that didn't
//! survive are removed from where the host still has them.

use crate::{
	node::{NodeId, PartValue, SlotIndex, TemplateRef},
	patch::{Operation, Patch},
	shadow::ShadowNode,
};
use core::mem;
use hashbrown::{HashMap, HashSet};
use tracing::{instrument, trace};

#[derive(Debug, Default)]
pub(crate) struct EditRecorder {
	operations: Vec<Operation>,
	/// Nodes created in the current window.
	fresh: HashSet<NodeId>,
	/// Committed nodes moved or removed in the current window, with their parent at the start of it.
	origins: HashMap<NodeId, Option<NodeId>>,
}
impl EditRecorder {
	pub fn is_empty(&self) -> bool {
		self.operations.is_empty()
	}

	pub fn created(&mut self, template: TemplateRef, id: NodeId, slot_index: SlotIndex) {
		self.fresh.insert(id);
		self.operations.push(Operation::CreateElement { template, id, slot_index });
	}

	pub fn inserted(&mut self, parent: NodeId, child: NodeId, before: Option<NodeId>, previous_parent: Option<NodeId>) {
		self.note_origin(child, previous_parent);
		self.operations.push(Operation::InsertBefore { parent, child, before });
	}

	pub fn removed(&mut self, parent: NodeId, child: NodeId) {
		self.note_origin(child, Some(parent));
		self.operations.push(Operation::RemoveChild { parent, child });
	}

	/// Values of fresh nodes are shipped in full on flush, so only committed nodes record part updates.
	pub fn set_attribute(&mut self, id: NodeId, part: usize, value: PartValue) {
		if !self.fresh.contains(&id) {
			self.operations.push(Operation::SetAttribute { id, part, value });
		}
	}

	pub fn set_attributes(&mut self, id: NodeId, values: Vec<PartValue>) {
		if !self.fresh.contains(&id) {
			self.operations.push(Operation::SetAttributes { id, values });
		}
	}

	fn note_origin(&mut self, id: NodeId, parent: Option<NodeId>) {
		if !self.fresh.contains(&id) {
			self.origins.entry(id).or_insert(parent);
		}
	}

	/// Turns the recording into one patch and starts a new window.
	/// `root` and `nodes` are the shadow tree's root and live node set.
	#[instrument(skip(self, nodes), fields(recorded = self.operations.len()))]
	pub fn flush(&mut self, root: NodeId, nodes: &HashMap<NodeId, ShadowNode>) -> Patch {
		let operations = mem::take(&mut self.operations);
		let fresh = mem::take(&mut self.fresh);
		let origins = mem::take(&mut self.origins);

		let doomed: HashSet<NodeId> = fresh.iter().copied().filter(|&id| !nodes.contains_key(&id)).collect();
		if !doomed.is_empty() {
			trace!(doomed = doomed.len(), "Eliding nodes created and destroyed within one commit.");
		}

		let held = operations.iter().any(|operation| match *operation {
			Operation::InsertBefore { parent, child, .. } => doomed.contains(&parent) && !doomed.contains(&child),
			_ => false,
		});
		if held {
			trace!("A surviving or committed node passed through an elided one. Rebuilding the structure.");
			rebuild(operations, &fresh, origins, root, nodes)
		} else {
			replay(operations, &doomed, nodes)
		}
	}
}

/// Pushes `CreateElement` for `id`, followed by its final values unless they are all null.
fn create(patch: &mut Patch, template: TemplateRef, id: NodeId, slot_index: SlotIndex, nodes: &HashMap<NodeId, ShadowNode>) {
	patch.push(Operation::CreateElement { template, id, slot_index });
	if let Some(node) = nodes.get(&id) {
		if node.values().iter().any(|value| !value.is_null()) {
			patch.push(Operation::SetAttributes { id, values: node.values().to_vec() });
		}
	}
}

/// Reinserts all children of `parent` back to front, so the host ends up with the shadow's order.
fn restate(patch: &mut Patch, parent: NodeId, nodes: &HashMap<NodeId, ShadowNode>) {
	let children = match nodes.get(&parent) {
		Some(node) => node.children(),
		None => return,
	};
	trace!(%parent, children = children.len(), "Restating child order.");
	for (i, &child) in children.iter().enumerate().rev() {
		let before = children.get(i + 1).copied().filter(|&next| nodes.get(&next).map(ShadowNode::slot_index) == nodes.get(&child).map(ShadowNode::slot_index));
		patch.push(Operation::InsertBefore { parent, child, before });
	}
}

/// The recording as is, minus everything touching `doomed`.
///
/// Doomed nodes only ever held other doomed nodes here, so the host's tree is the shadow's minus doomed subtrees
/// at every step and each remaining operation applies cleanly.
fn replay(operations: Vec<Operation>, doomed: &HashSet<NodeId>, nodes: &HashMap<NodeId, ShadowNode>) -> Patch {
	let mut patch = Patch::new();
	let mut restated = Vec::<NodeId>::new();

	for operation in operations {
		match operation {
			Operation::CreateElement { template, id, slot_index } => {
				if !doomed.contains(&id) {
					create(&mut patch, template, id, slot_index, nodes);
				}
			}
			Operation::InsertBefore { parent, child, before } => {
				if doomed.contains(&parent) || doomed.contains(&child) {
					continue;
				}
				let before = match before {
					Some(before) if doomed.contains(&before) => {
						if !restated.contains(&parent) {
							restated.push(parent);
						}
						None
					}
					before => before,
				};
				patch.push(Operation::InsertBefore { parent, child, before });
			}
			Operation::RemoveChild { parent, child } => {
				if !doomed.contains(&parent) && !doomed.contains(&child) {
					patch.push(Operation::RemoveChild { parent, child });
				}
			}
			operation @ (Operation::SetAttribute { .. } | Operation::SetAttributes { .. }) => patch.push(operation),
		}
	}

	for parent in restated {
		restate(&mut patch, parent, nodes);
	}
	patch
}

/// Creation and value operations for surviving nodes in recorded order, then the final structure.
///
/// Every parent that gained, lost or reordered a surviving child is restated, parents before children, so
/// no insertion can find its new parent below the moved node on the host. Dead committed nodes whose
/// parent at the start of the window survived are removed last, together with whatever the host still
/// keeps below them.
fn rebuild(operations: Vec<Operation>, fresh: &HashSet<NodeId>, origins: HashMap<NodeId, Option<NodeId>>, root: NodeId, nodes: &HashMap<NodeId, ShadowNode>) -> Patch {
	let live = |id: NodeId| nodes.contains_key(&id);
	let mut patch = Patch::new();

	for operation in operations {
		match operation {
			Operation::CreateElement { template, id, slot_index } if live(id) => create(&mut patch, template, id, slot_index, nodes),
			Operation::SetAttribute { id, part, value } if live(id) => patch.push(Operation::SetAttribute { id, part, value }),
			Operation::SetAttributes { id, values } if live(id) => patch.push(Operation::SetAttributes { id, values }),
			_ => (),
		}
	}

	let parents: HashSet<NodeId> = fresh
		.iter()
		.chain(origins.keys())
		.filter_map(|id| nodes.get(id)?.parent())
		.collect();
	let mut stack = vec![root];
	while let Some(id) = stack.pop() {
		if parents.contains(&id) {
			restate(&mut patch, id, nodes);
		}
		if let Some(node) = nodes.get(&id) {
			stack.extend_from_slice(node.children());
		}
	}

	let mut removed: Vec<(NodeId, NodeId)> = origins
		.into_iter()
		.filter(|&(id, _)| !live(id))
		.filter_map(|(id, origin)| Some((id, origin.filter(|&parent| live(parent))?)))
		.collect();
	removed.sort_unstable();
	for (child, parent) in removed {
		trace!(%child, %parent, "Removing committed node that didn't survive.");
		patch.push(Operation::RemoveChild { parent, child });
	}
	patch
}
