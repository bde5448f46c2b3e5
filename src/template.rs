//! Static templates: parameterized tree fragments with holes for dynamic values and slots for children.
//!
//! The registry is a collaborator owned by the component layer; both trees only read from it.

use crate::node::{PartValue, SlotIndex, TemplateKey, TemplateRef};
use hashbrown::HashMap;
use std::sync::Arc;

/// What a slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
	Children,
	/// Children of a virtualized list. They are tracked as list actions instead of being realized eagerly.
	ListChildren,
}

/// The static part of a template, as the host realizes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticShape {
	pub tag: String,
	pub attributes: Vec<(String, String)>,
}
impl StaticShape {
	#[must_use]
	pub fn new(tag: &str) -> Self {
		Self {
			tag: tag.to_owned(),
			attributes: Vec::new(),
		}
	}

	#[must_use]
	pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
		self.attributes.push((name.to_owned(), value.to_owned()));
		self
	}

	#[must_use]
	pub fn attribute(&self, name: &str) -> Option<&str> {
		self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDef {
	pub template: TemplateRef,
	pub shape: StaticShape,
	/// Hole names, in declaration order. The hole count is `holes.len()`.
	pub holes: Vec<String>,
	pub slots: Vec<SlotKind>,
	/// The hole carrying [`ListItemInfo`](`crate::node::ListItemInfo`) when instances are list children.
	pub item_info_part: Option<usize>,
}
impl TemplateDef {
	#[must_use]
	pub fn new(key: &str, shape: StaticShape) -> Self {
		Self {
			template: TemplateRef::template(key),
			shape,
			holes: Vec::new(),
			slots: Vec::new(),
			item_info_part: None,
		}
	}

	/// The definition every [`TemplateRef::RawValue`] node shares: one hole named `"text"`, no slots.
	#[must_use]
	pub fn raw_value() -> Self {
		Self {
			template: TemplateRef::RawValue,
			shape: StaticShape::new("#text"),
			holes: vec!["text".to_owned()],
			slots: Vec::new(),
			item_info_part: None,
		}
	}

	#[must_use]
	pub fn with_hole(mut self, name: &str) -> Self {
		self.holes.push(name.to_owned());
		self
	}

	#[must_use]
	pub fn with_slot(mut self, kind: SlotKind) -> Self {
		self.slots.push(kind);
		self
	}

	/// Adds a hole and marks it as the list item info part.
	#[must_use]
	pub fn with_item_info_hole(mut self, name: &str) -> Self {
		self.item_info_part = Some(self.holes.len());
		self.with_hole(name)
	}

	#[must_use]
	pub fn hole_count(&self) -> usize {
		self.holes.len()
	}

	#[must_use]
	pub fn slot(&self, slot_index: SlotIndex) -> Option<SlotKind> {
		self.slots.get(slot_index as usize).copied()
	}

	/// Whether this template is a virtualization container, i.e. its first slot holds list children.
	#[must_use]
	pub fn is_list(&self) -> bool {
		self.slots.first() == Some(&SlotKind::ListChildren)
	}

	/// Initial values: one [`PartValue::Null`] per hole.
	#[must_use]
	pub fn empty_values(&self) -> Vec<PartValue> {
		vec![PartValue::Null; self.hole_count()]
	}
}

#[derive(Debug, Clone)]
pub struct TemplateRegistry {
	templates: HashMap<TemplateKey, Arc<TemplateDef>>,
	raw_value: Arc<TemplateDef>,
}
impl Default for TemplateRegistry {
	fn default() -> Self {
		Self::new()
	}
}
impl TemplateRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self {
			templates: HashMap::new(),
			raw_value: Arc::new(TemplateDef::raw_value()),
		}
	}

	/// Registers `def`, replacing any previous definition under the same key.
	///
	/// Definitions for [`TemplateRef::RawValue`] are ignored; that one is built in.
	pub fn register(&mut self, def: TemplateDef) -> &mut Self {
		if let TemplateRef::Template(key) = def.template.clone() {
			self.templates.insert(key, Arc::new(def));
		}
		self
	}

	#[must_use]
	pub fn with(mut self, def: TemplateDef) -> Self {
		self.register(def);
		self
	}

	#[must_use]
	pub fn get(&self, template: &TemplateRef) -> Option<&Arc<TemplateDef>> {
		match template {
			TemplateRef::Template(key) => self.templates.get(key),
			TemplateRef::RawValue => Some(&self.raw_value),
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.templates.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.templates.is_empty()
	}
}
