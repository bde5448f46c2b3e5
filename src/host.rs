//! The render-side tree, mirroring platform elements.
//!
//! Nodes get an element once they are attached below the root, through [`HostPrimitives`]. Children of
//! virtualized lists are the exception: they are rendered on demand via [`HostTree::component_at_index`]
//! and their structural edits reach the platform as [`ListOperations`] after each patch.

use crate::{
	commit::CommitEnvelope,
	id::IdAllocator,
	list::{self, ListChild, ListError, ListOperations, ListRecycler, ListUpdateRecording, RuntimeVersion, Sign},
	node::{ListItemInfo, NodeId, PartValue, SerializedNode, SlotIndex, TemplateRef},
	patch::{Decoder, Opcode, Operation, Patch, PatchError},
	shadow::fit_values,
	template::{SlotKind, TemplateDef, TemplateRegistry},
	tree::{self, TreeError, TreeNode},
};
use core::fmt::{self, Debug, Formatter};
use hashbrown::HashMap;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, instrument, level_filters::STATIC_MAX_LEVEL, trace, trace_span, warn, Level};

/// The platform's element operations. They are only ever called while a patch is applied
/// or a list item is rendered.
pub trait HostPrimitives {
	type Element: Clone;

	/// Creates the element of a node of `def`, without parts or children.
	fn create_element(&mut self, def: &TemplateDef, id: NodeId) -> Self::Element;

	/// Plugs `value` into hole `part`. [`PartValue::Null`] clears it.
	fn set_part(&mut self, element: &Self::Element, def: &TemplateDef, part: usize, value: &PartValue);

	/// Inserts or moves `child` into `parent`, before `before` or at the end.
	fn insert_element(&mut self, parent: &Self::Element, child: &Self::Element, before: Option<&Self::Element>);

	fn remove_element(&mut self, parent: &Self::Element, child: &Self::Element);

	/// Called once for each element that is no longer used, after it was removed from its parent.
	fn release_element(&mut self, element: Self::Element) {
		drop(element)
	}

	/// Hands a list its actions for the last patch.
	fn update_list_info(&mut self, list: &Self::Element, operations: &ListOperations);

	/// Tells the platform that `list_id` serves [`HostTree::component_at_index`] and [`HostTree::enqueue_component`] for `list`.
	fn update_list_callbacks(&mut self, list: &Self::Element, list_id: NodeId);

	/// Receives synchronization failures that the application side can't act on.
	fn report_error(&mut self, error: &PatchError) {
		error!("{}", error)
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostOptions {
	/// Decides whether lists get full update lists. See [`list::needs_full_update`].
	pub runtime_version: Option<RuntimeVersion>,
	/// Envelopes stamped with an older reload version are dropped.
	pub reload_version: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostNode<E> {
	id: NodeId,
	template: TemplateRef,
	values: Vec<PartValue>,
	children: Vec<NodeId>,
	parent: Option<NodeId>,
	slot_index: SlotIndex,
	element: Option<E>,
}
impl<E> HostNode<E> {
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

	#[must_use]
	pub const fn element(&self) -> Option<&E> {
		self.element.as_ref()
	}

	#[must_use]
	pub const fn is_realized(&self) -> bool {
		self.element.is_some()
	}
}
impl<E> TreeNode for HostNode<E> {
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

fn list_child_ids<E>(nodes: &HashMap<NodeId, HostNode<E>>, def: &TemplateDef, list: NodeId) -> Vec<NodeId> {
	nodes.get(&list).map_or_else(Vec::new, |node| {
		node.children
			.iter()
			.copied()
			.filter(|child| nodes.get(child).map_or(false, |child| def.slot(child.slot_index) == Some(SlotKind::ListChildren)))
			.collect()
	})
}

pub struct HostTree<P: HostPrimitives> {
	templates: Arc<TemplateRegistry>,
	primitives: P,
	options: HostOptions,
	ids: IdAllocator,
	nodes: HashMap<NodeId, HostNode<P::Element>>,
	root: NodeId,
	generation: u64,
	/// List edits of the patch being applied.
	lists: BTreeMap<NodeId, ListUpdateRecording>,
	recyclers: HashMap<NodeId, ListRecycler>,
}
impl<P: HostPrimitives> Debug for HostTree<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("HostTree")
			.field("options", &self.options)
			.field("ids", &self.ids)
			.field("root", &self.root)
			.field("nodes", &self.nodes.len())
			.field("generation", &self.generation)
			.finish_non_exhaustive()
	}
}
impl<P: HostPrimitives> HostTree<P> {
	/// Creates a tree with just a realized root, whose id is the first pre-commit id.
	///
	/// # Errors
	///
	/// Iff `root_template` isn't registered.
	pub fn new(templates: Arc<TemplateRegistry>, primitives: P, options: HostOptions, root_template: TemplateRef) -> Result<Self, TreeError> {
		let mut ids = IdAllocator::new();
		let root = ids.next_id()?;
		Self::with_allocator(templates, primitives, options, ids, root, root_template)
	}

	/// Creates a tree with just a realized root with the given id.
	///
	/// # Errors
	///
	/// Iff `root_template` isn't registered.
	pub fn with_root(templates: Arc<TemplateRegistry>, primitives: P, options: HostOptions, root: NodeId, root_template: TemplateRef) -> Result<Self, TreeError> {
		let mut ids = IdAllocator::new();
		ids.observe(root);
		Self::with_allocator(templates, primitives, options, ids, root, root_template)
	}

	fn with_allocator(templates: Arc<TemplateRegistry>, primitives: P, options: HostOptions, ids: IdAllocator, root: NodeId, root_template: TemplateRef) -> Result<Self, TreeError> {
		let values = templates.get(&root_template).ok_or_else(|| TreeError::UnknownTemplate(root_template.clone()))?.empty_values();
		let mut nodes = HashMap::new();
		nodes.insert(
			root,
			HostNode {
				id: root,
				template: root_template,
				values,
				children: Vec::new(),
				parent: None,
				slot_index: 0,
				element: None,
			},
		);
		let mut tree = Self {
			templates,
			primitives,
			options,
			ids,
			nodes,
			root,
			generation: 0,
			lists: BTreeMap::new(),
			recyclers: HashMap::new(),
		};
		tree.realize(root);
		Ok(tree)
	}

	#[must_use]
	pub const fn root(&self) -> NodeId {
		self.root
	}

	#[must_use]
	pub fn root_element(&self) -> Option<&P::Element> {
		self.nodes.get(&self.root).and_then(HostNode::element)
	}

	#[must_use]
	pub fn node(&self, id: NodeId) -> Option<&HostNode<P::Element>> {
		self.nodes.get(&id)
	}

	#[must_use]
	pub fn contains(&self, id: NodeId) -> bool {
		self.nodes.contains_key(&id)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	#[must_use]
	pub const fn primitives(&self) -> &P {
		&self.primitives
	}

	pub fn primitives_mut(&mut self) -> &mut P {
		&mut self.primitives
	}

	#[must_use]
	pub const fn options(&self) -> &HostOptions {
		&self.options
	}

	/// Drops envelopes from before a reload.
	pub fn set_reload_version(&mut self, reload_version: u32) {
		self.options.reload_version = reload_version
	}

	/// The last generation applied through [`update`](`HostTree::update`).
	#[must_use]
	pub const fn generation(&self) -> u64 {
		self.generation
	}

	#[must_use]
	pub fn recycler(&self, list: NodeId) -> Option<&ListRecycler> {
		self.recyclers.get(&list)
	}

	#[must_use]
	pub const fn is_attached(&self) -> bool {
		self.ids.is_attached()
	}

	/// Switches this tree's own id allocation to the commit counter. Happens automatically on a hydration envelope.
	pub fn attach(&mut self) {
		self.ids.attach()
	}

	/// The snapshot the application side hydrates against.
	#[must_use]
	pub fn serialize(&self) -> SerializedNode {
		self.serialize_node(self.root).unwrap_or_else(|| SerializedNode::new(self.root, TemplateRef::RawValue))
	}

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

	/// Applies one commit envelope.
	///
	/// Protocol failures go to [`HostPrimitives::report_error`]. Returns the generation now confirmed,
	/// or [`None`] if the envelope was dropped or failed.
	#[instrument(skip(self, envelope), fields(generation = envelope.generation, patches = envelope.patches.len()))]
	pub fn update(&mut self, envelope: &CommitEnvelope) -> Option<u64> {
		if envelope.reload_version < self.options.reload_version {
			warn!(
				"Expected reload version {} or later but found {}. Dropping the envelope.",
				self.options.reload_version, envelope.reload_version
			);
			return None;
		}
		for patch in &envelope.patches {
			if let Err(error) = self.apply(patch) {
				self.primitives.report_error(&error);
				return None;
			}
		}
		if envelope.is_hydration {
			self.attach();
		}
		self.generation = self.generation.max(envelope.generation);
		Some(self.generation)
	}

	/// Applies a decoded patch. See [`apply_patch`](`HostTree::apply_patch`).
	///
	/// # Errors
	///
	/// As [`apply_patch`](`HostTree::apply_patch`).
	#[instrument(skip(self, patch), fields(operations = patch.len()))]
	pub fn apply(&mut self, patch: &Patch) -> Result<(), PatchError> {
		self.run(patch.iter().cloned().map(Ok))
	}

	/// Decodes and applies a flat wire patch, strictly in order, then flushes list updates.
	///
	/// # Errors
	///
	/// On the first malformed operation or the first one the tree rejects, e.g. one referencing an unknown node.
	/// Operations before it stay applied and pending list updates are discarded.
	#[instrument(skip(self, wire), fields(len = wire.len()))]
	pub fn apply_patch(&mut self, wire: &[PartValue]) -> Result<(), PatchError> {
		self.run(Decoder::new(wire))
	}

	fn run(&mut self, operations: impl IntoIterator<Item = Result<Operation, PatchError>>) -> Result<(), PatchError> {
		self.lists.clear();
		for operation in operations {
			let result = operation.and_then(|operation| {
				let span = trace_span!("Applying", opcode = %operation.opcode());
				let _enter = span.enter();
				self.apply_operation(operation)
			});
			if let Err(error) = result {
				trace!("Halting: {}", error);
				self.lists.clear();
				return Err(error);
			}
		}
		self.flush_lists();
		Ok(())
	}

	/// Creates a detached node with this tree's own allocator, i.e. while building a first paint.
	///
	/// # Errors
	///
	/// Iff the tree is already attached, `template` isn't registered, there are more values than holes, or ids are exhausted.
	/// After attachment, ids belong to the shadow tree's commit counter.
	pub fn create_node(&mut self, template: TemplateRef, slot_index: SlotIndex, values: Vec<PartValue>) -> Result<NodeId, PatchError> {
		let opcode = Opcode::CreateElement;
		if self.ids.is_attached() {
			return Err(PatchError::Tree { opcode, source: TreeError::Attached });
		}
		let id = self.ids.next_id().map_err(|error| PatchError::Tree { opcode, source: error.into() })?;
		let mut operations = vec![Ok(Operation::CreateElement { template, id, slot_index })];
		if !values.is_empty() {
			operations.push(Ok(Operation::SetAttributes { id, values }));
		}
		self.run(operations)?;
		Ok(id)
	}

	/// # Errors
	///
	/// As [`apply_patch`](`HostTree::apply_patch`).
	pub fn insert_before(&mut self, parent: NodeId, child: NodeId, before: Option<NodeId>) -> Result<(), PatchError> {
		self.run(Some(Ok(Operation::InsertBefore { parent, child, before })))
	}

	/// # Errors
	///
	/// As [`apply_patch`](`HostTree::apply_patch`).
	pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), PatchError> {
		self.run(Some(Ok(Operation::RemoveChild { parent, child })))
	}

	fn apply_operation(&mut self, operation: Operation) -> Result<(), PatchError> {
		match operation {
			Operation::CreateElement { template, id, slot_index } => self.create(template, id, slot_index),
			Operation::InsertBefore { parent, child, before } => self.insert(parent, child, before),
			Operation::RemoveChild { parent, child } => self.remove(parent, child),
			Operation::SetAttribute { id, part, value } => self.set_part(Opcode::SetAttribute, id, part, value),
			Operation::SetAttributes { id, values } => self.set_parts(id, values),
		}
	}

	fn create(&mut self, template: TemplateRef, id: NodeId, slot_index: SlotIndex) -> Result<(), PatchError> {
		let opcode = Opcode::CreateElement;
		if self.nodes.contains_key(&id) {
			return Err(PatchError::Tree {
				opcode,
				source: TreeError::DuplicateId(id),
			});
		}
		let values = match self.templates.get(&template) {
			Some(def) => def.empty_values(),
			None => return Err(PatchError::UnknownTemplate { opcode, template }),
		};
		trace!(%id, %template, slot_index, "Creating node.");
		self.ids.observe(id);
		self.nodes.insert(
			id,
			HostNode {
				id,
				template,
				values,
				children: Vec::new(),
				parent: None,
				slot_index,
				element: None,
			},
		);
		Ok(())
	}

	fn insert(&mut self, parent: NodeId, child: NodeId, before: Option<NodeId>) -> Result<(), PatchError> {
		let opcode = Opcode::InsertBefore;
		let unknown = |id| PatchError::UnknownNode { opcode, id };
		let failed = |source| PatchError::Tree { opcode, source };

		let child_node = self.nodes.get(&child).ok_or_else(|| unknown(child))?;
		let (slot_index, old_parent, was_realized) = (child_node.slot_index, child_node.parent, child_node.is_realized());
		let parent_element = self.nodes.get(&parent).ok_or_else(|| unknown(parent))?.element.clone();
		if let Some(before) = before.filter(|before| !self.nodes.contains_key(before)) {
			return Err(unknown(before));
		}
		let kind = self.slot_kind(parent, slot_index).ok_or_else(|| failed(TreeError::InvalidSlot { parent, slot_index }))?;
		let index = tree::check_insert(&self.nodes, self.root, parent, child, before).map_err(failed)?;
		let old_kind = old_parent.and_then(|old_parent| self.slot_kind(old_parent, slot_index));

		let stays_in_list = kind == SlotKind::ListChildren && old_parent == Some(parent);
		if stays_in_list {
			if let Some(recording) = self.list_recording(parent) {
				recording.on_insert_before(child, true);
			}
		} else {
			if let (Some(old_parent), Some(SlotKind::ListChildren)) = (old_parent, old_kind) {
				if let Some(recording) = self.list_recording(old_parent) {
					recording.on_remove_child(child);
				}
			}
			if kind == SlotKind::ListChildren {
				if let Some(recording) = self.list_recording(parent) {
					recording.on_insert_before(child, false);
				}
			}
		}

		let moves_element = old_kind == Some(SlotKind::Children) && kind == SlotKind::Children && parent_element.is_some();
		if was_realized && !moves_element && !stays_in_list {
			self.unrealize(child);
		}
		tree::attach(&mut self.nodes, parent, child, index);

		if kind == SlotKind::Children {
			if let Some(parent_element) = parent_element {
				if let Some(element) = self.realize(child) {
					let before_element = self.next_element(child);
					self.primitives.insert_element(&parent_element, &element, before_element.as_ref());
				}
			}
		}
		Ok(())
	}

	fn remove(&mut self, parent: NodeId, child: NodeId) -> Result<(), PatchError> {
		let opcode = Opcode::RemoveChild;
		let child_node = self.nodes.get(&child).ok_or(PatchError::UnknownNode { opcode, id: child })?;
		let (slot_index, actual_parent) = (child_node.slot_index, child_node.parent);
		if !self.nodes.contains_key(&parent) {
			return Err(PatchError::UnknownNode { opcode, id: parent });
		}
		if actual_parent != Some(parent) {
			return Err(PatchError::Tree {
				opcode,
				source: TreeError::NotAChild { parent, child },
			});
		}

		if self.slot_kind(parent, slot_index) == Some(SlotKind::ListChildren) {
			if let Some(recording) = self.list_recording(parent) {
				recording.on_remove_child(child);
			}
		}
		self.unrealize(child);
		tree::detach(&mut self.nodes, child);
		for id in tree::subtree(&self.nodes, child) {
			self.nodes.remove(&id);
		}
		Ok(())
	}

	fn set_part(&mut self, opcode: Opcode, id: NodeId, part: usize, value: PartValue) -> Result<(), PatchError> {
		let node = self.nodes.get(&id).ok_or(PatchError::UnknownNode { opcode, id })?;
		let hole_count = node.values.len();
		let current = node.values.get(part).ok_or(PatchError::Tree {
			opcode,
			source: TreeError::PartOutOfRange { id, part, hole_count },
		})?;
		if *current == value {
			return Ok(());
		}
		let def = match self.templates.get(&node.template) {
			Some(def) => Arc::clone(def),
			None => {
				return Err(PatchError::UnknownTemplate {
					opcode,
					template: node.template.clone(),
				})
			}
		};

		let list = node
			.parent
			.filter(|&parent| def.item_info_part == Some(part) && self.slot_kind(parent, node.slot_index) == Some(SlotKind::ListChildren));
		let old_info = ListItemInfo::from_part(current);
		if let Some(list) = list {
			let new_info = ListItemInfo::from_part(&value);
			if let Some(recording) = self.list_recording(list) {
				recording.on_set_info(id, &old_info, &new_info);
			}
		}

		if cfg!(feature = "dangerous-logging") {
			trace!(%id, part, ?value, "Setting part.");
		} else {
			trace!(%id, part, "Setting part.");
		}
		if let Some(node) = self.nodes.get_mut(&id) {
			if let Some(element) = &node.element {
				self.primitives.set_part(element, &def, part, &value);
			}
			if let Some(slot) = node.values.get_mut(part) {
				*slot = value;
			}
		}
		Ok(())
	}

	fn set_parts(&mut self, id: NodeId, values: Vec<PartValue>) -> Result<(), PatchError> {
		let opcode = Opcode::SetAttributes;
		let node = self.nodes.get(&id).ok_or(PatchError::UnknownNode { opcode, id })?;
		let def = self.templates.get(&node.template).ok_or_else(|| PatchError::UnknownTemplate {
			opcode,
			template: node.template.clone(),
		})?;
		let values = fit_values(def, id, values).map_err(|source| PatchError::Tree { opcode, source })?;
		for (part, value) in values.into_iter().enumerate() {
			self.set_part(opcode, id, part, value)?;
		}
		Ok(())
	}

	fn slot_kind(&self, parent: NodeId, slot_index: SlotIndex) -> Option<SlotKind> {
		let parent = self.nodes.get(&parent)?;
		self.templates.get(&parent.template)?.slot(slot_index)
	}

	/// The element of the first realized regular sibling after `id`.
	fn next_element(&self, id: NodeId) -> Option<P::Element> {
		let parent = self.nodes.get(&id)?.parent?;
		let siblings = &self.nodes.get(&parent)?.children;
		let index = siblings.iter().position(|&sibling| sibling == id)?;
		siblings[index + 1..]
			.iter()
			.filter_map(|sibling| self.nodes.get(sibling))
			.filter(|sibling| self.slot_kind(parent, sibling.slot_index) == Some(SlotKind::Children))
			.find_map(|sibling| sibling.element.clone())
	}

	/// Creates elements for `id` and its regular descendants. Returns `id`'s element.
	fn realize(&mut self, id: NodeId) -> Option<P::Element> {
		let node = self.nodes.get(&id)?;
		if let Some(element) = &node.element {
			return Some(element.clone());
		}
		let def = Arc::clone(self.templates.get(&node.template)?);
		let values = node.values.clone();
		let children = node.children.clone();

		trace!(%id, template = %def.template, "Realizing.");
		let element = self.primitives.create_element(&def, id);
		for (part, value) in values.iter().enumerate().filter(|(_, value)| !value.is_null()) {
			self.primitives.set_part(&element, &def, part, value);
		}
		if let Some(node) = self.nodes.get_mut(&id) {
			node.element = Some(element.clone());
		}

		for child in children {
			if self.nodes.get(&child).map_or(true, |child| def.slot(child.slot_index) == Some(SlotKind::ListChildren)) {
				continue;
			}
			if let Some(child_element) = self.realize(child) {
				self.primitives.insert_element(&element, &child_element, None);
			}
		}
		if def.is_list() {
			self.start_list(id, &def, &element);
		}
		Some(element)
	}

	/// Removes the element of `id` from its parent's and releases the elements of the whole subtree.
	fn unrealize(&mut self, id: NodeId) {
		if let Some(node) = self.nodes.get(&id) {
			let parent_element = node.parent.and_then(|parent| self.nodes.get(&parent)).and_then(|parent| parent.element.as_ref());
			if let (Some(parent_element), Some(element)) = (parent_element, &node.element) {
				self.primitives.remove_element(parent_element, element);
			}
		}
		for id in tree::subtree(&self.nodes, id) {
			if let Some(parent) = self.nodes.get(&id).and_then(|node| node.parent) {
				if let Some(recycler) = self.recyclers.get_mut(&parent) {
					recycler.forget(id);
				}
			}
			self.recyclers.remove(&id);
			self.lists.remove(&id);
			if let Some(element) = self.nodes.get_mut(&id).and_then(|node| node.element.take()) {
				self.primitives.release_element(element);
			}
		}
	}

	fn item_info(&self, node: &HostNode<P::Element>) -> ListItemInfo {
		self.templates
			.get(&node.template)
			.and_then(|def| def.item_info_part)
			.and_then(|part| node.values.get(part))
			.map(ListItemInfo::from_part)
			.unwrap_or_default()
	}

	fn list_items(&self, list: NodeId, def: &TemplateDef) -> Vec<ListChild> {
		list_child_ids(&self.nodes, def, list)
			.into_iter()
			.filter_map(|child| self.nodes.get(&child))
			.map(|child| ListChild {
				id: child.id,
				template: child.template.clone(),
				info: self.item_info(child),
			})
			.collect()
	}

	/// The recording of `list` for the current patch, opened on first use. [`None`] while the list isn't realized.
	fn list_recording(&mut self, list: NodeId) -> Option<&mut ListUpdateRecording> {
		let node = self.nodes.get(&list)?;
		node.element.as_ref()?;
		let def = self.templates.get(&node.template)?;
		if !self.lists.contains_key(&list) {
			let children = list_child_ids(&self.nodes, def, list);
			self.lists.insert(list, ListUpdateRecording::new(list, children));
		}
		self.lists.get_mut(&list)
	}

	/// Hands a freshly realized list all its children at once.
	fn start_list(&mut self, list: NodeId, def: &TemplateDef, element: &P::Element) {
		self.lists.remove(&list);
		let items = self.list_items(list, def);
		let operations = ListUpdateRecording::new(list, Vec::new()).finish(&items, list::needs_full_update(self.options.runtime_version, &def.shape));
		trace!(%list, items = items.len(), "Starting list.");
		if !operations.is_empty() {
			self.primitives.update_list_info(element, &operations);
		}
		self.primitives.update_list_callbacks(element, list);
	}

	fn flush_lists(&mut self) {
		for (list, recording) in core::mem::take(&mut self.lists) {
			let (def, element) = match self.nodes.get(&list).and_then(|node| Some((Arc::clone(self.templates.get(&node.template)?), node.element.clone()?))) {
				Some(found) => found,
				None => continue,
			};
			let items = self.list_items(list, &def);
			let operations = recording.finish(&items, list::needs_full_update(self.options.runtime_version, &def.shape));
			trace!(
				%list,
				removals = operations.remove_action.len(),
				insertions = operations.insert_action.len(),
				updates = operations.update_action.len(),
				"Flushing list updates."
			);
			self.primitives.update_list_info(&element, &operations);
			self.primitives.update_list_callbacks(&element, list);
		}
	}

	/// Renders the list child at `index` and returns its sign.
	///
	/// An already rendered child keeps its elements. Otherwise, a pooled element set of the same reuse id and
	/// shape is taken over and patched, and only if there is none, the child is rendered from scratch.
	///
	/// # Errors
	///
	/// Iff `list` is unknown, isn't a realized list container, or has no child at `index`.
	#[instrument(skip(self))]
	pub fn component_at_index(&mut self, list: NodeId, index: usize) -> Result<Sign, ListError> {
		let list_node = self.nodes.get(&list).ok_or(ListError::UnknownList(list))?;
		let def = self.templates.get(&list_node.template).filter(|def| def.is_list()).ok_or(ListError::NotAList(list))?;
		let list_element = list_node.element.clone().ok_or(ListError::Unrealized(list))?;
		let child = list_child_ids(&self.nodes, def, list).get(index).copied().ok_or(ListError::IndexOutOfRange { list, index })?;
		let child_node = self.nodes.get(&child).ok_or(ListError::IndexOutOfRange { list, index })?;

		if child_node.is_realized() {
			let recycler = self.recyclers.entry(list).or_default();
			return Ok(match recycler.sign_of(child) {
				Some(sign) => {
					if recycler.unpool(sign) {
						trace!(%child, sign, "Reusing own elements.");
					}
					sign
				}
				None => recycler.assign(child),
			});
		}

		let reuse_id = list::reuse_id(&child_node.template, &self.item_info(child_node));
		let candidate = self.recyclers.get(&list).and_then(|recycler| {
			recycler
				.pooled(&reuse_id)
				.filter_map(|sign| Some((sign, recycler.node_of(sign)?)))
				.find(|&(_, pooled)| self.same_shape(pooled, child))
		});
		if let Some((sign, pooled)) = candidate {
			trace!(%child, %pooled, sign, "Recycling.");
			self.transfer_elements(pooled, child);
			self.recyclers.entry(list).or_default().transfer(sign, child);
			return Ok(sign);
		}

		let element = self.realize(child).ok_or(ListError::IndexOutOfRange { list, index })?;
		self.primitives.insert_element(&list_element, &element, None);
		let sign = self.recyclers.entry(list).or_default().assign(child);
		trace!(%child, sign, "Rendered.");
		Ok(sign)
	}

	/// Renders the list children at `indexes` in order. See [`component_at_index`](`HostTree::component_at_index`).
	///
	/// # Errors
	///
	/// On the first index that fails. Children rendered before it stay rendered.
	#[instrument(skip(self))]
	pub fn components_at_indexes(&mut self, list: NodeId, indexes: &[usize]) -> Result<Vec<Sign>, ListError> {
		indexes.iter().map(|&index| self.component_at_index(list, index)).collect()
	}

	/// Returns the elements shown under `sign` to `list`'s pool. Unknown signs are ignored.
	#[instrument(skip(self))]
	pub fn enqueue_component(&mut self, list: NodeId, sign: Sign) {
		let recycler = match self.recyclers.get(&list) {
			Some(recycler) => recycler,
			None => return warn!("Expected list {} to have rendered items but found none. Ignoring sign {}.", list, sign),
		};
		let reuse_id = recycler
			.node_of(sign)
			.and_then(|child| self.nodes.get(&child))
			.map(|child| list::reuse_id(&child.template, &self.item_info(child)))
			.unwrap_or_default();
		if let Some(recycler) = self.recyclers.get_mut(&list) {
			if recycler.enqueue(sign, reuse_id) && STATIC_MAX_LEVEL >= Level::WARN && recycler.pool_len() >= 100 {
				warn!(
					"The recycling pool of list {} is large ({}).\n\
					This may point to items that are enqueued but never rendered again.",
					list,
					recycler.pool_len()
				);
			}
		}
	}

	/// Whether the rendered subtree at `pooled` can be taken over by the unrendered one at `fresh`.
	/// Nested lists are never taken over.
	fn same_shape(&self, pooled: NodeId, fresh: NodeId) -> bool {
		let (pooled, fresh) = match (self.nodes.get(&pooled), self.nodes.get(&fresh)) {
			(Some(pooled), Some(fresh)) => (pooled, fresh),
			_ => return false,
		};
		let def = match self.templates.get(&fresh.template) {
			Some(def) => def,
			None => return false,
		};
		if pooled.template != fresh.template || pooled.slot_index != fresh.slot_index || !pooled.is_realized() || fresh.is_realized() || def.is_list() {
			return false;
		}
		pooled.children.len() == fresh.children.len() && pooled.children.iter().zip(&fresh.children).all(|(&a, &b)| self.same_shape(a, b))
	}

	/// Moves the elements of `from`'s subtree over to `to`'s, patching parts that differ.
	fn transfer_elements(&mut self, from: NodeId, to: NodeId) {
		let element = match self.nodes.get_mut(&from).and_then(|node| node.element.take()) {
			Some(element) => element,
			None => return,
		};
		let old_values = self.nodes.get(&from).map(|node| node.values.clone()).unwrap_or_default();
		let (def, new_values, pairs) = match self.nodes.get(&to) {
			Some(node) => match self.templates.get(&node.template) {
				Some(def) => (Arc::clone(def), node.values.clone(), node.children.clone()),
				None => return,
			},
			None => return,
		};
		for (part, value) in new_values.iter().enumerate() {
			if old_values.get(part) != Some(value) {
				self.primitives.set_part(&element, &def, part, value);
			}
		}
		if let Some(node) = self.nodes.get_mut(&to) {
			node.element = Some(element);
		}

		let from_children = self.nodes.get(&from).map(|node| node.children.clone()).unwrap_or_default();
		for (from_child, to_child) in from_children.into_iter().zip(pairs) {
			self.transfer_elements(from_child, to_child);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::template::StaticShape;
	use serde_json::json;

	/// Elements are ids, calls are logged.
	#[derive(Debug, Default)]
	struct Log {
		next: usize,
		calls: Vec<String>,
	}
	impl HostPrimitives for Log {
		type Element = usize;

		fn create_element(&mut self, def: &TemplateDef, _: NodeId) -> usize {
			self.next += 1;
			self.calls.push(format!("create {} {}", self.next, def.shape.tag));
			self.next
		}
		fn set_part(&mut self, element: &usize, _: &TemplateDef, part: usize, value: &PartValue) {
			self.calls.push(format!("set {} {} {}", element, part, value));
		}
		fn insert_element(&mut self, parent: &usize, child: &usize, before: Option<&usize>) {
			self.calls.push(format!("insert {} {} {:?}", parent, child, before));
		}
		fn remove_element(&mut self, parent: &usize, child: &usize) {
			self.calls.push(format!("remove {} {}", parent, child));
		}
		fn update_list_info(&mut self, list: &usize, operations: &ListOperations) {
			self.calls.push(format!("list {} {}", list, serde_json::to_string(operations).unwrap()));
		}
		fn update_list_callbacks(&mut self, list: &usize, list_id: NodeId) {
			self.calls.push(format!("callbacks {} {}", list, list_id));
		}
	}

	fn templates() -> Arc<TemplateRegistry> {
		Arc::new(
			TemplateRegistry::new()
				.with(TemplateDef::new("root", StaticShape::new("page")).with_slot(SlotKind::Children))
				.with(TemplateDef::new("view", StaticShape::new("view")).with_hole("class").with_slot(SlotKind::Children))
				.with(TemplateDef::new("list", StaticShape::new("list")).with_slot(SlotKind::ListChildren))
				.with(TemplateDef::new("item", StaticShape::new("list-item")).with_hole("text").with_item_info_hole("info")),
		)
	}

	fn host() -> HostTree<Log> {
		HostTree::new(templates(), Log::default(), HostOptions::default(), TemplateRef::template("root")).unwrap()
	}

	fn take_calls(host: &mut HostTree<Log>) -> Vec<String> {
		core::mem::take(&mut host.primitives_mut().calls)
	}

	#[test]
	fn realizes_on_attachment() {
		let mut host = host();
		let root = host.root();
		assert_eq!(take_calls(&mut host), vec!["create 1 page"]);

		let a = host.create_node(TemplateRef::template("view"), 0, vec![json!("x")]).unwrap();
		let text = host.create_node(TemplateRef::RawValue, 0, vec![json!("hi")]).unwrap();
		host.insert_before(a, text, None).unwrap();
		assert!(take_calls(&mut host).is_empty());

		host.insert_before(root, a, None).unwrap();
		assert_eq!(
			take_calls(&mut host),
			vec!["create 2 view", "set 2 0 \"x\"", "create 3 #text", "set 3 0 \"hi\"", "insert 2 3 None", "insert 1 2 None"]
		);

		let b = host.create_node(TemplateRef::template("view"), 0, Vec::new()).unwrap();
		host.insert_before(root, b, Some(a)).unwrap();
		assert_eq!(take_calls(&mut host), vec!["create 4 view", "insert 1 4 Some(2)"]);

		host.remove_child(root, a).unwrap();
		assert_eq!(take_calls(&mut host), vec!["remove 1 2"]);
		assert!(!host.contains(a) && !host.contains(text));
	}

	#[test]
	fn attached_trees_only_grow_through_patches() {
		let mut host = host();
		host.attach();
		assert_eq!(
			host.create_node(TemplateRef::template("view"), 0, Vec::new()),
			Err(PatchError::Tree {
				opcode: Opcode::CreateElement,
				source: TreeError::Attached
			})
		);
		assert_eq!(host.len(), 1);

		host.apply(&Patch::from(vec![Operation::CreateElement {
			template: TemplateRef::template("view"),
			id: NodeId(2),
			slot_index: 0,
		}]))
		.unwrap();
		assert!(host.contains(NodeId(2)));
	}

	#[test]
	fn unknown_ids_halt_without_rollback() {
		let mut host = host();
		let wire = Patch::from(vec![
			Operation::CreateElement {
				template: TemplateRef::template("view"),
				id: NodeId(2),
				slot_index: 0,
			},
			Operation::InsertBefore {
				parent: NodeId(-1),
				child: NodeId(2),
				before: None,
			},
			Operation::InsertBefore {
				parent: NodeId(42),
				child: NodeId(2),
				before: None,
			},
			Operation::RemoveChild {
				parent: NodeId(-1),
				child: NodeId(2),
			},
		])
		.encode();
		assert_eq!(
			host.apply_patch(&wire),
			Err(PatchError::UnknownNode {
				opcode: Opcode::InsertBefore,
				id: NodeId(42)
			})
		);
		assert_eq!(host.node(NodeId(-1)).unwrap().children(), &[NodeId(2)]);
	}

	#[test]
	fn stale_reload_versions_are_dropped() {
		let mut host = host();
		host.set_reload_version(3);
		let mut envelope = CommitEnvelope {
			generation: 1,
			reload_version: 2,
			is_hydration: true,
			patches: Vec::new(),
		};
		assert_eq!(host.update(&envelope), None);
		assert!(!host.is_attached());
		envelope.reload_version = 3;
		assert_eq!(host.update(&envelope), Some(1));
		assert!(host.is_attached());
	}

	fn list_host() -> (HostTree<Log>, NodeId, Vec<NodeId>) {
		let mut host = host();
		let root = host.root();
		let list = host.create_node(TemplateRef::template("list"), 0, Vec::new()).unwrap();
		let mut items = Vec::new();
		for (key, text) in [("a", "A"), ("b", "B")] {
			let item = host
				.create_node(TemplateRef::template("item"), 0, vec![json!(text), json!({ "item-key": key, "reuse-identifier": "row" })])
				.unwrap();
			host.insert_before(list, item, None).unwrap();
			items.push(item);
		}
		host.insert_before(root, list, None).unwrap();
		take_calls(&mut host);
		(host, list, items)
	}

	#[test]
	fn list_children_render_on_demand() {
		let mut host = host();
		let root = host.root();
		let list = host.create_node(TemplateRef::template("list"), 0, Vec::new()).unwrap();
		let item = host.create_node(TemplateRef::template("item"), 0, vec![json!("A"), json!({ "item-key": "a" })]).unwrap();
		host.insert_before(list, item, None).unwrap();
		take_calls(&mut host);

		host.insert_before(root, list, None).unwrap();
		assert_eq!(
			take_calls(&mut host),
			vec![
				"create 2 list".to_owned(),
				format!("list 2 {}", r#"{"insertAction":[{"position":0,"type":"item","item-key":"a"}],"removeAction":[],"updateAction":[]}"#),
				format!("callbacks 2 {}", list),
				"insert 1 2 None".to_owned(),
			]
		);
		assert!(!host.node(item).unwrap().is_realized());

		let sign = host.component_at_index(list, 0).unwrap();
		assert!(host.node(item).unwrap().is_realized());
		assert_eq!(host.component_at_index(list, 0), Ok(sign));
		assert_eq!(host.component_at_index(list, 1), Err(ListError::IndexOutOfRange { list, index: 1 }));
		assert_eq!(host.component_at_index(root, 0), Err(ListError::NotAList(root)));
	}

	#[test]
	fn batches_render_in_order() {
		let (mut host, list, items) = list_host();
		let signs = host.components_at_indexes(list, &[1, 0]).unwrap();
		assert_eq!(signs.len(), 2);
		assert_eq!(host.component_at_index(list, 1), Ok(signs[0]));
		assert_eq!(host.component_at_index(list, 0), Ok(signs[1]));
		assert!(items.iter().all(|&item| host.node(item).unwrap().is_realized()));

		host.enqueue_component(list, signs[1]);
		assert_eq!(host.components_at_indexes(list, &[0, 2]), Err(ListError::IndexOutOfRange { list, index: 2 }));
		assert_eq!(host.recycler(list).unwrap().pool_len(), 0);
		assert_eq!(host.components_at_indexes(list, &[]), Ok(Vec::new()));
	}

	#[test]
	fn pooled_elements_are_recycled() {
		let (mut host, list, items) = list_host();
		let first = host.component_at_index(list, 0).unwrap();
		take_calls(&mut host);

		host.enqueue_component(list, first);
		host.enqueue_component(list, 99);
		assert_eq!(host.recycler(list).unwrap().pool_len(), 1);

		let second = host.component_at_index(list, 1).unwrap();
		assert_eq!(second, first);
		assert!(!host.node(items[0]).unwrap().is_realized());
		assert!(host.node(items[1]).unwrap().is_realized());
		let calls = take_calls(&mut host);
		assert_eq!(calls[0], "set 3 0 \"B\"");
		assert!(calls.iter().all(|call| !call.starts_with("create")));
	}

	#[test]
	fn list_edits_become_actions() {
		let (mut host, list, items) = list_host();
		let wire = Patch::from(vec![
			Operation::SetAttribute {
				id: items[0],
				part: 1,
				value: json!({ "item-key": "a2", "reuse-identifier": "row" }),
			},
			Operation::RemoveChild { parent: list, child: items[1] },
		])
		.encode();
		host.apply_patch(&wire).unwrap();
		let calls = take_calls(&mut host);
		assert_eq!(
			calls[0],
			format!(
				"list 2 {}",
				r#"{"insertAction":[{"position":0,"type":"item","item-key":"a2","reuse-identifier":"row"}],"removeAction":[0,1],"updateAction":[]}"#
			)
		);
		assert_eq!(calls[1], format!("callbacks 2 {}", list));
	}

	#[test]
	fn legacy_runtimes_get_full_updates() {
		let templates = Arc::new(
			TemplateRegistry::new()
				.with(TemplateDef::new("root", StaticShape::new("page")).with_slot(SlotKind::Children))
				.with(TemplateDef::new("list", StaticShape::new("list").with_attribute(list::CUSTOM_LIST_NAME, list::LEGACY_LIST_CONTAINER)).with_slot(SlotKind::ListChildren))
				.with(TemplateDef::new("item", StaticShape::new("list-item")).with_item_info_hole("info")),
		);
		let options = HostOptions {
			runtime_version: Some(RuntimeVersion::new(2, 16)),
			reload_version: 0,
		};
		let mut host = HostTree::new(templates, Log::default(), options, TemplateRef::template("root")).unwrap();
		let root = host.root();
		let list = host.create_node(TemplateRef::template("list"), 0, Vec::new()).unwrap();
		host.insert_before(root, list, None).unwrap();
		let a = host.create_node(TemplateRef::template("item"), 0, vec![json!({ "item-key": "a" })]).unwrap();
		host.insert_before(list, a, None).unwrap();
		let b = host.create_node(TemplateRef::template("item"), 0, vec![json!({ "item-key": "b" })]).unwrap();
		take_calls(&mut host);
		host.insert_before(list, b, None).unwrap();
		assert_eq!(
			take_calls(&mut host)[0],
			format!(
				"list 2 {}",
				r#"{"insertAction":[{"position":1,"type":"item","item-key":"b"}],"removeAction":[],"updateAction":[{"from":0,"to":0,"flush":false,"type":"item","item-key":"a"},{"from":1,"to":1,"flush":false,"type":"item","item-key":"b"}]}"#
			)
		);
	}
}
