//! [`HostPrimitives`] over the browser DOM.
//!
//! Each node is one DOM node: raw values become [***Text***](https://developer.mozilla.org/en-US/docs/Web/API/Text) nodes,
//! everything else an [***Element***](https://developer.mozilla.org/en-US/docs/Web/API/element) named after the template's tag,
//! with one attribute per hole.

use crate::{
	host::HostPrimitives,
	list::ListOperations,
	node::{NodeId, PartValue, TemplateRef},
	template::TemplateDef,
};
use tracing::{error, level_filters::STATIC_MAX_LEVEL, trace, warn, Level};
use wasm_bindgen::{JsCast, UnwrapThrowExt};
use web_sys::{CharacterData, Document, Element, Node};

/// Attribute carrying the serialized [`ListOperations`] of a list's last update.
pub const UPDATE_LIST_INFO: &str = "update-list-info";
/// Attribute carrying a list's node id, which the list's item callbacks are keyed by.
pub const LIST_ID: &str = "list-id";

#[derive(Debug, Clone)]
pub struct DomHost {
	document: Document,
}
impl DomHost {
	#[must_use]
	pub fn new(document: Document) -> Self {
		Self { document }
	}

	#[must_use]
	pub fn document(&self) -> &Document {
		&self.document
	}
}

fn part_text(value: &PartValue) -> String {
	match value {
		PartValue::String(text) => text.clone(),
		PartValue::Null => String::new(),
		value => value.to_string(),
	}
}

impl HostPrimitives for DomHost {
	type Element = Node;

	fn create_element(&mut self, def: &TemplateDef, id: NodeId) -> Node {
		if def.template == TemplateRef::RawValue {
			return self.document.create_text_node("").into();
		}
		let element = self
			.document
			.create_element(&def.shape.tag)
			.expect_throw("snapshot-sync: Failed to create element. Is the template tag valid?");
		for (name, value) in &def.shape.attributes {
			if let Err(error) = element.set_attribute(name, value) {
				warn!("Expected to set static attribute {:?} on {} but failed: {:?}", name, id, error);
			}
		}
		element.into()
	}

	fn set_part(&mut self, element: &Node, def: &TemplateDef, part: usize, value: &PartValue) {
		if let Some(text) = element.dyn_ref::<CharacterData>() {
			return text.set_data(&part_text(value));
		}
		let (element, name) = match (element.dyn_ref::<Element>(), def.holes.get(part)) {
			(Some(element), Some(name)) => (element, name),
			(None, _) => return error!("Expected Element or CharacterData but found {:?}", element),
			(_, None) => return error!("Expected a hole {} on {} but found none", part, def.template),
		};
		let result = if value.is_null() {
			element.remove_attribute(name)
		} else {
			element.set_attribute(name, &part_text(value))
		};
		if let Err(error) = result {
			warn!("Failed to update attribute {:?}: {:?}", name, error);
		}
	}

	fn insert_element(&mut self, parent: &Node, child: &Node, before: Option<&Node>) {
		if STATIC_MAX_LEVEL >= Level::ERROR {
			if let Some(before) = before.filter(|before| before.parent_node().as_ref() != Some(parent)) {
				return error!("Expected the reference node {:?} under {:?} but found it elsewhere", before, parent);
			}
		}
		parent.insert_before(child, before).unwrap_throw();
	}

	fn remove_element(&mut self, parent: &Node, child: &Node) {
		parent.remove_child(child).unwrap_throw();
	}

	fn update_list_info(&mut self, list: &Node, operations: &ListOperations) {
		let element = match list.dyn_ref::<Element>() {
			Some(element) => element,
			None => return error!("Expected list Element but found {:?}", list),
		};
		match serde_json::to_string(operations) {
			Ok(info) => {
				trace!(%info, "Updating list info.");
				if let Err(error) = element.set_attribute(UPDATE_LIST_INFO, &info) {
					warn!("Failed to set {:?}: {:?}", UPDATE_LIST_INFO, error);
				}
			}
			Err(error) => error!("Failed to serialize list operations: {}", error),
		}
	}

	fn update_list_callbacks(&mut self, list: &Node, list_id: NodeId) {
		if let Some(element) = list.dyn_ref::<Element>() {
			if let Err(error) = element.set_attribute(LIST_ID, &list_id.to_string()) {
				warn!("Failed to set {:?}: {:?}", LIST_ID, error);
			}
		}
	}
}
