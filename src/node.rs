//! The node model shared by both trees and by the wire format.

use core::fmt::{self, Display, Formatter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A dynamic part value, plugged into one hole of a template.
///
/// [`PartValue::Null`] clears the hole.
pub type PartValue = serde_json::Value;

/// Which of a parent's insertion points a child occupies.
pub type SlotIndex = u32;

/// Identifies a node within one synchronization session.
///
/// Negative ids are handed out before the tree is attached to its host counterpart,
/// non-negative ones afterwards. See [`IdAllocator`](`crate::id::IdAllocator`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i32);
impl NodeId {
	#[must_use]
	pub const fn get(self) -> i32 {
		self.0
	}

	/// Whether this id was assigned by the pre-commit counter, i.e. while building the first tree.
	#[must_use]
	pub const fn is_pre_commit(self) -> bool {
		self.0 < 0
	}
}
impl Display for NodeId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}
impl From<i32> for NodeId {
	fn from(id: i32) -> Self {
		Self(id)
	}
}

/// Key into a [`TemplateRegistry`](`crate::template::TemplateRegistry`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateKey(Arc<str>);
impl TemplateKey {
	#[must_use]
	pub fn new(key: &str) -> Self {
		Self(key.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl Display for TemplateKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
impl From<&str> for TemplateKey {
	fn from(key: &str) -> Self {
		Self::new(key)
	}
}

/// What a node instantiates: either a registered template or a bare value holder.
///
/// On the wire, this is the template key as string, or `null` for [`TemplateRef::RawValue`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<TemplateKey>", into = "Option<TemplateKey>")]
pub enum TemplateRef {
	Template(TemplateKey),
	/// A dynamic value without surrounding markup, i.e. raw text. Has exactly one hole and no slots.
	RawValue,
}
impl TemplateRef {
	#[must_use]
	pub fn template(key: &str) -> Self {
		Self::Template(TemplateKey::new(key))
	}

	#[must_use]
	pub fn key(&self) -> Option<&TemplateKey> {
		match self {
			TemplateRef::Template(key) => Some(key),
			TemplateRef::RawValue => None,
		}
	}

	/// The key as used in reuse identifiers and logs. Raw value nodes are `"#raw"`.
	#[must_use]
	pub fn name(&self) -> &str {
		match self {
			TemplateRef::Template(key) => key.as_str(),
			TemplateRef::RawValue => "#raw",
		}
	}
}
impl From<Option<TemplateKey>> for TemplateRef {
	fn from(key: Option<TemplateKey>) -> Self {
		key.map_or(Self::RawValue, Self::Template)
	}
}
impl From<TemplateRef> for Option<TemplateKey> {
	fn from(template: TemplateRef) -> Self {
		match template {
			TemplateRef::Template(key) => Some(key),
			TemplateRef::RawValue => None,
		}
	}
}
impl Display for TemplateRef {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Platform info of a child of a virtualized list, read from the template's list item info hole.
///
/// Serializes as the plain JSON object so it can be flattened into list actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListItemInfo(pub serde_json::Map<String, PartValue>);
impl ListItemInfo {
	pub const ITEM_KEY: &'static str = "item-key";
	pub const REUSE_IDENTIFIER: &'static str = "reuse-identifier";

	/// Reads the info from a part value. Anything but an object is treated as empty.
	#[must_use]
	pub fn from_part(value: &PartValue) -> Self {
		match value {
			PartValue::Object(map) => Self(map.clone()),
			_ => Self::default(),
		}
	}

	#[must_use]
	pub fn item_key(&self) -> Option<&PartValue> {
		self.0.get(Self::ITEM_KEY)
	}

	#[must_use]
	pub fn reuse_identifier(&self) -> Option<&str> {
		self.0.get(Self::REUSE_IDENTIFIER).and_then(PartValue::as_str)
	}
}

/// The plain, method-less form of a node, as sent for hydration and used for structural comparison.
///
/// Missing `children` and `values` are read as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNode {
	pub id: NodeId,
	#[serde(rename = "type")]
	pub template: TemplateRef,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub children: Vec<SerializedNode>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub values: Option<Vec<PartValue>>,
	#[serde(default, skip_serializing_if = "is_default_slot")]
	pub slot_index: SlotIndex,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // serde signature
fn is_default_slot(slot_index: &SlotIndex) -> bool {
	*slot_index == 0
}

impl SerializedNode {
	#[must_use]
	pub fn new(id: impl Into<NodeId>, template: TemplateRef) -> Self {
		Self {
			id: id.into(),
			template,
			children: Vec::new(),
			values: None,
			slot_index: 0,
		}
	}

	#[must_use]
	pub fn with_children(mut self, children: Vec<SerializedNode>) -> Self {
		self.children = children;
		self
	}

	#[must_use]
	pub fn with_values(mut self, values: Vec<PartValue>) -> Self {
		self.values = Some(values);
		self
	}

	#[must_use]
	pub fn with_slot(mut self, slot_index: SlotIndex) -> Self {
		self.slot_index = slot_index;
		self
	}

	/// The values, with a missing field read as empty.
	#[must_use]
	pub fn values(&self) -> &[PartValue] {
		self.values.as_deref().unwrap_or(&[])
	}

	/// Structural equality ignoring ids: templates, values (missing = empty), slots and child order.
	#[must_use]
	pub fn is_isomorphic(&self, other: &Self) -> bool {
		self.template == other.template
			&& self.values() == other.values()
			&& self.slot_index == other.slot_index
			&& self.children.len() == other.children.len()
			&& self.children.iter().zip(&other.children).all(|(a, b)| a.is_isomorphic(b))
	}

	fn fmt_level(&self, f: &mut Formatter<'_>, level: usize) -> fmt::Result {
		for _ in 0..level {
			f.write_str("  ")?;
		}
		write!(f, "| {}({}): ", self.id, self.template)?;
		match serde_json::to_string(self.values()) {
			Ok(values) => writeln!(f, "{}", values)?,
			Err(_) => writeln!(f, "<unprintable>")?,
		}
		for child in &self.children {
			child.fmt_level(f, level + 1)?;
		}
		Ok(())
	}
}

/// Prints one `| id(type): values` line per node, indented by depth.
impl Display for SerializedNode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		self.fmt_level(f, 0)
	}
}
