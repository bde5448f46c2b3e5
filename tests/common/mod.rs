#![allow(dead_code)]

use snapshot_sync::{
	list::{self, ListOperations},
	HostOptions, HostPrimitives, HostTree, NodeId, PartValue, PatchError, ShadowTree, SlotKind, StaticShape, TemplateDef, TemplateRef,
	TemplateRegistry,
};
use std::sync::Arc;

/// A host without platform: elements are plain numbers, list updates and errors are kept for inspection.
#[derive(Debug, Default)]
pub struct Recorder {
	next: usize,
	pub live: usize,
	/// List element and the operations it received, in order.
	pub list_updates: Vec<(usize, ListOperations)>,
	pub list_callbacks: Vec<(usize, NodeId)>,
	pub errors: Vec<PatchError>,
}
impl HostPrimitives for Recorder {
	type Element = usize;

	fn create_element(&mut self, _: &TemplateDef, _: NodeId) -> usize {
		self.next += 1;
		self.live += 1;
		self.next
	}
	fn set_part(&mut self, _: &usize, _: &TemplateDef, _: usize, _: &PartValue) {}
	fn insert_element(&mut self, _: &usize, _: &usize, _: Option<&usize>) {}
	fn remove_element(&mut self, _: &usize, _: &usize) {}
	fn release_element(&mut self, _: usize) {
		self.live -= 1;
	}
	fn update_list_info(&mut self, list: &usize, operations: &ListOperations) {
		self.list_updates.push((*list, operations.clone()));
	}
	fn update_list_callbacks(&mut self, list: &usize, list_id: NodeId) {
		self.list_callbacks.push((*list, list_id));
	}
	fn report_error(&mut self, error: &PatchError) {
		self.errors.push(error.clone());
	}
}

pub fn templates() -> Arc<TemplateRegistry> {
	Arc::new(
		TemplateRegistry::new()
			.with(TemplateDef::new("root", StaticShape::new("page")).with_slot(SlotKind::Children))
			.with(TemplateDef::new("T1", StaticShape::new("view")))
			.with(TemplateDef::new("T2", StaticShape::new("image")).with_hole("src"))
			.with(
				TemplateDef::new("box", StaticShape::new("view"))
					.with_hole("class")
					.with_slot(SlotKind::Children)
					.with_slot(SlotKind::Children),
			)
			.with(TemplateDef::new("leaf", StaticShape::new("text")).with_hole("a").with_hole("b"))
			.with(TemplateDef::new("list", StaticShape::new("list")).with_slot(SlotKind::ListChildren))
			.with(
				TemplateDef::new("legacy", StaticShape::new("list").with_attribute(list::CUSTOM_LIST_NAME, list::LEGACY_LIST_CONTAINER))
					.with_slot(SlotKind::ListChildren),
			)
			.with(TemplateDef::new("item", StaticShape::new("list-item")).with_hole("title").with_item_info_hole("info")),
	)
}

pub fn root() -> TemplateRef {
	TemplateRef::template("root")
}

pub fn shadow() -> ShadowTree {
	ShadowTree::new(templates(), root()).unwrap()
}

pub fn host() -> HostTree<Recorder> {
	HostTree::new(templates(), Recorder::default(), HostOptions::default(), root()).unwrap()
}

/// Hydrates `shadow` against `host` and applies the result, so both are attached and equal.
pub fn hydrate(shadow: &mut ShadowTree, host: &mut HostTree<Recorder>) {
	let envelope = shadow.hydrate(&host.serialize()).unwrap();
	assert_eq!(host.update(&envelope), Some(envelope.generation));
	assert_eq!(host.serialize(), shadow.serialize());
}

/// Commits `shadow`, ships the patch over the wire form and applies it to `host`.
pub fn sync(shadow: &mut ShadowTree, host: &mut HostTree<Recorder>) -> PartValue {
	let envelope = shadow.commit();
	let wire = serde_json::to_value(&envelope).unwrap();
	let received = serde_json::from_value(wire.clone()).unwrap();
	assert_eq!(host.update(&received), Some(envelope.generation), "{:?}", host.primitives().errors);
	wire
}
