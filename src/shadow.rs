//! The application-side tree.
//!
//! Application logic edits it imperatively. Until hydration, it is built with pre-commit ids and nothing is
//! recorded; afterwards, every edit is recorded and [`ShadowTree::commit`] hands out the resulting patch.

use crate::{
	commit::CommitEnvelope,
	diff::EditRecorder,
	hydrate::{self, HydrateError},
	id::IdAllocator,
	node::{NodeId, PartValue, SerializedNode, SlotIndex, TemplateRef},
	patch::Patch,
	template::{TemplateDef, TemplateRegistry},
	tree::{self, TreeError, TreeNode},
};
use hashbrown::HashMap;
use std::sync::Arc;
use tracing::{instrument, trace};

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowNode {
	id: NodeId,
	template: TemplateRef,
	values: Vec<PartValue>,
	children: Vec<NodeId>,
	parent: Option<NodeId>,
	slot_index: SlotIndex,
}
impl ShadowNode {
	#[must_use]
	pub const fn id(&self) -> NodeId {
		self.id
	}

	#[must_use]
	pub const fn template(&self) -> &TemplateRef {
		&self.template
	}

	#[must_use]
	pub fn values(&self) -> &[PartValue] {
		&self.values
	}

	#[must_use]
	pub fn children(&self) -> &[NodeId] {
		&self.children
	}

	#[must_use]
	pub const fn parent(&self) -> Option<NodeId> {
		self.parent
	}

	#[must_use]
	pub const fn slot_index(&self) -> SlotIndex {
		self.slot_index
	}
}
impl TreeNode for ShadowNode {
	fn parent(&self) -> Option<NodeId> {
		self.parent
	}
	fn set_parent(&mut self, parent: Option<NodeId>) {
		self.parent = parent
	}
	fn children(&self) -> &[NodeId] {
		&self.children
	}
	fn children_mut(&mut self) -> &mut Vec<NodeId> {
		&mut self.children
	}
	fn slot_index(&self) -> SlotIndex {
		self.slot_index
	}
}

/// Pads `values` to the template's hole count.
///
/// # Errors
///
/// Iff there are more values than holes.
pub(crate) fn fit_values(def: &TemplateDef, id: NodeId, mut values: Vec<PartValue>) -> Result<Vec<PartValue>, TreeError> {
	let hole_count = def.hole_count();
	if values.len() > hole_count {
		return Err(TreeError::PartOutOfRange { id, part: hole_count, hole_count });
	}
	values.resize(hole_count, PartValue::Null);
	Ok(values)
}

#[derive(Debug)]
pub struct ShadowTree {
	templates: Arc<TemplateRegistry>,
	ids: IdAllocator,
	nodes: HashMap<NodeId, ShadowNode>,
	root: NodeId,
	recorder: EditRecorder,
	generation: u64,
	reload_version: u32,
}
impl ShadowTree {
	/// Creates a tree consisting of just a root node of the given template.
	///
	/// # Errors
	///
	/// Iff `root_template` isn't registered.
	pub fn new(templates: Arc<TemplateRegistry>, root_template: TemplateRef) -> Result<Self, TreeError> {
		let mut ids = IdAllocator::new();
		let root = ids.next_id()?;
		let def = templates.get(&root_template).ok_or_else(|| TreeError::UnknownTemplate(root_template.clone()))?;
		let root_node = ShadowNode {
			id: root,
			template: root_template,
			values: def.empty_values(),
			children: Vec::new(),
			parent: None,
			slot_index: 0,
		};
		let mut nodes = HashMap::new();
		nodes.insert(root, root_node);
		Ok(Self {
			templates,
			ids,
			nodes,
			root,
			recorder: EditRecorder::default(),
			generation: 0,
			reload_version: 0,
		})
	}

	#[must_use]
	pub fn templates(&self) -> &Arc<TemplateRegistry> {
		&self.templates
	}

	#[must_use]
	pub const fn root(&self) -> NodeId {
		self.root
	}

	#[must_use]
	pub fn node(&self, id: NodeId) -> Option<&ShadowNode> {
		self.nodes.get(&id)
	}

	#[must_use]
	pub fn contains(&self, id: NodeId) -> bool {
		self.nodes.contains_key(&id)
	}

	/// Number of live nodes, attached or not.
	#[must_use]
	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// Whether hydration has happened, i.e. edits are being recorded.
	#[must_use]
	pub const fn is_attached(&self) -> bool {
		self.ids.is_attached()
	}

	/// The generation of the last commit. `0` before the first one.
	#[must_use]
	pub const fn generation(&self) -> u64 {
		self.generation
	}

	#[must_use]
	pub const fn reload_version(&self) -> u32 {
		self.reload_version
	}

	/// Stamps subsequent commits with `reload_version`. Hosts drop envelopes older than their own reload version.
	pub fn set_reload_version(&mut self, reload_version: u32) {
		self.reload_version = reload_version
	}

	#[must_use]
	pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
		tree::next_sibling(&self.nodes, id)
	}

	pub(crate) const fn nodes(&self) -> &HashMap<NodeId, ShadowNode> {
		&self.nodes
	}

	pub(crate) fn ids_mut(&mut self) -> &mut IdAllocator {
		&mut self.ids
	}

	/// Creates a detached node with empty values.
	///
	/// # Errors
	///
	/// Iff `template` isn't registered or ids are exhausted.
	pub fn create_node(&mut self, template: TemplateRef, slot_index: SlotIndex) -> Result<NodeId, TreeError> {
		self.create_node_with_values(template, slot_index, Vec::new())
	}

	/// Creates a detached node with initial `values`, padded with nulls to the template's hole count.
	///
	/// # Errors
	///
	/// Iff `template` isn't registered, there are more values than holes, or ids are exhausted.
	pub fn create_node_with_values(&mut self, template: TemplateRef, slot_index: SlotIndex, values: Vec<PartValue>) -> Result<NodeId, TreeError> {
		let def = self.templates.get(&template).ok_or_else(|| TreeError::UnknownTemplate(template.clone()))?;
		let id = self.ids.next_id()?;
		let values = fit_values(def, id, values)?;
		trace!(%id, %template, slot_index, "Creating node.");
		if self.ids.is_attached() {
			self.recorder.created(template.clone(), id, slot_index);
		}
		self.nodes.insert(
			id,
			ShadowNode {
				id,
				template,
				values,
				children: Vec::new(),
				parent: None,
				slot_index,
			},
		);
		Ok(id)
	}

	/// Attaches or moves `child` under `parent`, right before `before` or at the end of its slot.
	///
	/// # Errors
	///
	/// On unknown ids, slots the parent's template doesn't have, a `before` that isn't a child of `parent`
	/// in the same slot, or an insertion that would create a cycle.
	pub fn insert_before(&mut self, parent: NodeId, child: NodeId, before: Option<NodeId>) -> Result<(), TreeError> {
		let slot_index = tree::get(&self.nodes, child)?.slot_index;
		let parent_template = &tree::get(&self.nodes, parent)?.template;
		let parent_def = self.templates.get(parent_template).ok_or_else(|| TreeError::UnknownTemplate(parent_template.clone()))?;
		if parent_def.slot(slot_index).is_none() {
			return Err(TreeError::InvalidSlot { parent, slot_index });
		}

		let index = tree::check_insert(&self.nodes, self.root, parent, child, before)?;
		let previous_parent = tree::get(&self.nodes, child)?.parent;
		trace!(%parent, %child, ?before, "Inserting node.");
		tree::attach(&mut self.nodes, parent, child, index);
		if self.ids.is_attached() {
			self.recorder.inserted(parent, child, before, previous_parent);
		}
		Ok(())
	}

	/// Detaches `child` from `parent` and destroys it along with its subtree.
	///
	/// # Errors
	///
	/// Iff `child` isn't a child of `parent`.
	pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
		tree::get(&self.nodes, parent)?;
		if tree::get(&self.nodes, child)?.parent != Some(parent) {
			return Err(TreeError::NotAChild { parent, child });
		}
		trace!(%parent, %child, "Removing node.");
		tree::detach(&mut self.nodes, child);
		for id in tree::subtree(&self.nodes, child) {
			self.nodes.remove(&id);
		}
		if self.ids.is_attached() {
			self.recorder.removed(parent, child);
		}
		Ok(())
	}

	/// Updates the value in one hole. Setting an equal value records nothing.
	///
	/// # Errors
	///
	/// Iff `id` is unknown or `part` is out of range for its template.
	pub fn set_value(&mut self, id: NodeId, part: usize, value: PartValue) -> Result<(), TreeError> {
		let node = tree::get_mut(&mut self.nodes, id)?;
		let hole_count = node.values.len();
		let slot = node.values.get_mut(part).ok_or(TreeError::PartOutOfRange { id, part, hole_count })?;
		if *slot == value {
			return Ok(());
		}
		if cfg!(feature = "dangerous-logging") {
			trace!(%id, part, ?value, "Setting part.");
		} else {
			trace!(%id, part, "Setting part.");
		}
		*slot = value.clone();
		if self.ids.is_attached() {
			self.recorder.set_attribute(id, part, value);
		}
		Ok(())
	}

	/// Replaces all values at once, padded with nulls to the template's hole count.
	///
	/// # Errors
	///
	/// Iff `id` is unknown or there are more values than holes.
	pub fn set_values(&mut self, id: NodeId, values: Vec<PartValue>) -> Result<(), TreeError> {
		let template = &tree::get(&self.nodes, id)?.template;
		let def = self.templates.get(template).ok_or_else(|| TreeError::UnknownTemplate(template.clone()))?;
		let values = fit_values(def, id, values)?;
		let node = tree::get_mut(&mut self.nodes, id)?;
		if node.values == values {
			return Ok(());
		}
		trace!(%id, "Setting all parts.");
		node.values = values.clone();
		if self.ids.is_attached() {
			self.recorder.set_attributes(id, values);
		}
		Ok(())
	}

	/// Replaces `old` with a new node instead of updating it in place, e.g. when a keyed child's key changed.
	///
	/// The new node takes `old`'s slot and position. Returns its id.
	///
	/// # Errors
	///
	/// As [`create_node_with_values`](`ShadowTree::create_node_with_values`), [`insert_before`](`ShadowTree::insert_before`) and [`remove_child`](`ShadowTree::remove_child`).
	pub fn replace_child(&mut self, parent: NodeId, old: NodeId, template: TemplateRef, values: Vec<PartValue>) -> Result<NodeId, TreeError> {
		let old_node = tree::get(&self.nodes, old)?;
		if old_node.parent != Some(parent) {
			return Err(TreeError::NotAChild { parent, child: old });
		}
		let slot_index = old_node.slot_index;
		let new = self.create_node_with_values(template, slot_index, values)?;
		self.insert_before(parent, new, Some(old))?;
		self.remove_child(parent, old)?;
		Ok(new)
	}

	/// Flushes all edits since the last commit as one patch.
	///
	/// Before hydration, nothing is recorded and the patch is empty.
	#[instrument(skip(self), fields(generation = self.generation + 1))]
	pub fn commit(&mut self) -> CommitEnvelope {
		let patch = if self.recorder.is_empty() { Patch::new() } else { self.recorder.flush(self.root, &self.nodes) };
		trace!(operations = patch.len(), "Committing.");
		self.seal(patch, false)
	}

	/// Reconciles this tree with the host's first-paint snapshot and attaches it. See [`hydrate::hydrate`].
	///
	/// # Errors
	///
	/// As [`hydrate::hydrate`].
	pub fn hydrate(&mut self, before: &SerializedNode) -> Result<CommitEnvelope, HydrateError> {
		let patch = hydrate::hydrate(before, self)?;
		Ok(self.seal(patch, true))
	}

	fn seal(&mut self, patch: Patch, is_hydration: bool) -> CommitEnvelope {
		self.generation += 1;
		CommitEnvelope {
			generation: self.generation,
			reload_version: self.reload_version,
			is_hydration,
			patches: vec![patch],
		}
	}

	/// The plain form of the tree below the root.
	#[must_use]
	pub fn serialize(&self) -> SerializedNode {
		self.serialize_node(self.root).unwrap_or_else(|| SerializedNode::new(self.root, TemplateRef::RawValue))
	}

	/// The plain form of the subtree at `id`, values included.
	#[must_use]
	pub fn serialize_node(&self, id: NodeId) -> Option<SerializedNode> {
		let node = self.nodes.get(&id)?;
		Some(SerializedNode {
			id,
			template: node.template.clone(),
			children: node.children.iter().filter_map(|&child| self.serialize_node(child)).collect(),
			values: Some(node.values.clone()),
			slot_index: node.slot_index,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		patch::Operation,
		template::{SlotKind, StaticShape},
	};
	use serde_json::json;

	fn templates() -> Arc<TemplateRegistry> {
		Arc::new(
			TemplateRegistry::new()
				.with(TemplateDef::new("root", StaticShape::new("page")).with_slot(SlotKind::Children))
				.with(TemplateDef::new("view", StaticShape::new("view")).with_hole("id").with_slot(SlotKind::Children).with_slot(SlotKind::Children)),
		)
	}

	fn attached() -> ShadowTree {
		let mut tree = ShadowTree::new(templates(), TemplateRef::template("root")).unwrap();
		tree.ids_mut().attach();
		tree
	}

	#[test]
	fn nothing_is_recorded_before_attachment() {
		let mut tree = ShadowTree::new(templates(), TemplateRef::template("root")).unwrap();
		let a = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(tree.root(), a, None).unwrap();
		assert_eq!(a, NodeId(-2));
		assert!(tree.commit().patches[0].is_empty());
	}

	#[test]
	fn records_edits_in_order() {
		let mut tree = attached();
		let root = tree.root();
		let a = tree.create_node_with_values(TemplateRef::template("view"), 0, vec![json!("a")]).unwrap();
		tree.insert_before(root, a, None).unwrap();
		tree.commit();

		tree.set_value(a, 0, json!("b")).unwrap();
		tree.set_value(a, 0, json!("b")).unwrap();
		let b = tree.create_node(TemplateRef::RawValue, 1).unwrap();
		tree.set_value(b, 0, json!("text")).unwrap();
		tree.insert_before(a, b, None).unwrap();
		let envelope = tree.commit();
		assert_eq!(envelope.generation, 2);
		assert_eq!(
			envelope.patches[0].operations(),
			&[
				Operation::SetAttribute { id: a, part: 0, value: json!("b") },
				Operation::CreateElement {
					template: TemplateRef::RawValue,
					id: b,
					slot_index: 1
				},
				Operation::SetAttributes { id: b, values: vec![json!("text")] },
				Operation::InsertBefore { parent: a, child: b, before: None },
			]
		);
		assert!(tree.commit().patches[0].is_empty());
	}

	#[test]
	fn created_then_removed_is_elided() {
		let mut tree = attached();
		let root = tree.root();
		let keep = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, keep, None).unwrap();
		let doomed = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, doomed, Some(keep)).unwrap();
		let inner = tree.create_node(TemplateRef::RawValue, 0).unwrap();
		tree.insert_before(doomed, inner, None).unwrap();
		tree.remove_child(root, doomed).unwrap();

		let patch = tree.commit().patches.remove(0);
		assert!(patch.iter().all(|operation| !operation.references(doomed) && !operation.references(inner)));
		assert_eq!(
			patch.operations(),
			&[
				Operation::CreateElement {
					template: TemplateRef::template("view"),
					id: keep,
					slot_index: 0
				},
				Operation::InsertBefore { parent: root, child: keep, before: None },
			]
		);
	}

	#[test]
	fn anchor_on_elided_node_restates_order() {
		let mut tree = attached();
		let root = tree.root();
		let doomed = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, doomed, None).unwrap();
		let x = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, x, Some(doomed)).unwrap();
		let y = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, y, None).unwrap();
		tree.remove_child(root, doomed).unwrap();

		let patch = tree.commit().patches.remove(0);
		assert!(patch.iter().all(|operation| !operation.references(doomed)));
		let tail = &patch.operations()[patch.len() - 2..];
		assert_eq!(
			tail,
			&[
				Operation::InsertBefore { parent: root, child: y, before: None },
				Operation::InsertBefore { parent: root, child: x, before: Some(y) },
			]
		);
	}

	#[test]
	fn committed_node_moved_into_elided_parent_is_removed() {
		let mut tree = attached();
		let root = tree.root();
		let c = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, c, None).unwrap();
		tree.commit();

		let doomed = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, doomed, None).unwrap();
		tree.insert_before(doomed, c, None).unwrap();
		tree.remove_child(root, doomed).unwrap();
		assert!(!tree.contains(c));

		let patch = tree.commit().patches.remove(0);
		assert_eq!(patch.operations(), &[Operation::RemoveChild { parent: root, child: c }]);
	}

	#[test]
	fn nesting_through_an_elided_parent_removes_the_old_top() {
		let mut tree = attached();
		let root = tree.root();
		let y = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, y, None).unwrap();
		let x = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(y, x, None).unwrap();
		tree.commit();

		let doomed = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, doomed, None).unwrap();
		tree.insert_before(doomed, x, None).unwrap();
		tree.insert_before(x, y, None).unwrap();
		tree.remove_child(root, doomed).unwrap();
		assert!(tree.node(root).unwrap().children().is_empty());

		let patch = tree.commit().patches.remove(0);
		assert_eq!(patch.operations(), &[Operation::RemoveChild { parent: root, child: y }]);
	}

	#[test]
	fn survivors_of_an_elided_parent_are_restated_top_down() {
		let mut tree = attached();
		let root = tree.root();
		let a = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, a, None).unwrap();
		let b = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(a, b, None).unwrap();
		tree.commit();

		let doomed = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, doomed, None).unwrap();
		tree.insert_before(doomed, b, None).unwrap();
		tree.insert_before(b, a, None).unwrap();
		tree.insert_before(root, b, None).unwrap();
		tree.set_value(a, 0, json!("moved")).unwrap();
		tree.remove_child(root, doomed).unwrap();

		let patch = tree.commit().patches.remove(0);
		assert!(patch.iter().all(|operation| !operation.references(doomed)));
		assert_eq!(
			patch.operations(),
			&[
				Operation::SetAttribute { id: a, part: 0, value: json!("moved") },
				Operation::InsertBefore { parent: root, child: b, before: None },
				Operation::InsertBefore { parent: b, child: a, before: None },
			]
		);
	}

	#[test]
	fn replace_child_takes_the_old_position() {
		let mut tree = attached();
		let root = tree.root();
		let a = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		let b = tree.create_node(TemplateRef::template("view"), 0).unwrap();
		tree.insert_before(root, a, None).unwrap();
		tree.insert_before(root, b, None).unwrap();
		tree.commit();

		let c = tree.replace_child(root, a, TemplateRef::template("view"), vec![json!("k2")]).unwrap();
		assert_eq!(tree.node(root).unwrap().children(), &[c, b]);
		assert_eq!(
			tree.commit().patches[0].operations(),
			&[
				Operation::CreateElement {
					template: TemplateRef::template("view"),
					id: c,
					slot_index: 0
				},
				Operation::SetAttributes { id: c, values: vec![json!("k2")] },
				Operation::InsertBefore { parent: root, child: c, before: Some(a) },
				Operation::RemoveChild { parent: root, child: a },
			]
		);
	}

	#[test]
	fn structural_errors() {
		let mut tree = attached();
		let root = tree.root();
		let a = tree.create_node(TemplateRef::template("view"), 2).unwrap();
		assert_eq!(tree.insert_before(root, a, None), Err(TreeError::InvalidSlot { parent: root, slot_index: 2 }));
		assert_eq!(tree.remove_child(root, a), Err(TreeError::NotAChild { parent: root, child: a }));
		assert_eq!(tree.set_value(a, 3, json!(1)), Err(TreeError::PartOutOfRange { id: a, part: 3, hole_count: 1 }));
		assert_eq!(
			tree.create_node_with_values(TemplateRef::RawValue, 0, vec![json!(1), json!(2)]).map(|_| ()),
			Err(TreeError::PartOutOfRange { id: NodeId(3), part: 1, hole_count: 1 })
		);
		assert!(matches!(tree.create_node(TemplateRef::template("nope"), 0), Err(TreeError::UnknownTemplate(_))));
	}
}
