//! The patch format: an ordered list of [`Operation`]s, sent as one flat array.
//!
//! Each operation is written as `[opcode, ...arguments]` with a fixed arity per opcode, back to back
//! and without delimiters:
//!
//! | opcode | operation | arguments |
//! |---|---|---|
//! | `0` | [`Operation::CreateElement`] | `template` (string or `null`), `id`, `slotIndex` |
//! | `1` | [`Operation::InsertBefore`] | `parentId`, `childId`, `beforeId` (or `null`) |
//! | `2` | [`Operation::RemoveChild`] | `parentId`, `childId` |
//! | `3` | [`Operation::SetAttribute`] | `id`, `partIndex`, `value` |
//! | `4` | [`Operation::SetAttributes`] | `id`, `values` (array) |
//!
//! Decoding is a single forward pass. The first malformed entry ends it.

use crate::{
	node::{NodeId, PartValue, SlotIndex, TemplateKey, TemplateRef},
	tree::TreeError,
};
use core::{
	convert::TryFrom,
	fmt::{self, Display, Formatter},
	iter::FusedIterator,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
	CreateElement = 0,
	InsertBefore = 1,
	RemoveChild = 2,
	SetAttribute = 3,
	SetAttributes = 4,
}
impl Opcode {
	/// Number of arguments following the opcode on the wire.
	#[must_use]
	pub const fn arity(self) -> usize {
		match self {
			Opcode::CreateElement | Opcode::InsertBefore | Opcode::SetAttribute => 3,
			Opcode::RemoveChild | Opcode::SetAttributes => 2,
		}
	}
}
impl TryFrom<u64> for Opcode {
	type Error = u64;

	fn try_from(value: u64) -> Result<Self, Self::Error> {
		Ok(match value {
			0 => Opcode::CreateElement,
			1 => Opcode::InsertBefore,
			2 => Opcode::RemoveChild,
			3 => Opcode::SetAttribute,
			4 => Opcode::SetAttributes,
			other => return Err(other),
		})
	}
}
impl Display for Opcode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
	/// Instantiates `template` under `id`, detached.
	CreateElement { template: TemplateRef, id: NodeId, slot_index: SlotIndex },
	/// Attaches or moves `child` under `parent`, right before `before`, or appends it to its slot.
	InsertBefore { parent: NodeId, child: NodeId, before: Option<NodeId> },
	/// Detaches and destroys `child`.
	RemoveChild { parent: NodeId, child: NodeId },
	SetAttribute { id: NodeId, part: usize, value: PartValue },
	SetAttributes { id: NodeId, values: Vec<PartValue> },
}
impl Operation {
	#[must_use]
	pub const fn opcode(&self) -> Opcode {
		match self {
			Operation::CreateElement { .. } => Opcode::CreateElement,
			Operation::InsertBefore { .. } => Opcode::InsertBefore,
			Operation::RemoveChild { .. } => Opcode::RemoveChild,
			Operation::SetAttribute { .. } => Opcode::SetAttribute,
			Operation::SetAttributes { .. } => Opcode::SetAttributes,
		}
	}

	/// Whether `id` appears anywhere in this operation's arguments.
	#[must_use]
	pub fn references(&self, id: NodeId) -> bool {
		match *self {
			Operation::CreateElement { id: target, .. } | Operation::SetAttribute { id: target, .. } | Operation::SetAttributes { id: target, .. } => target == id,
			Operation::InsertBefore { parent, child, before } => parent == id || child == id || before == Some(id),
			Operation::RemoveChild { parent, child } => parent == id || child == id,
		}
	}

	pub fn encode_into(&self, wire: &mut Vec<PartValue>) {
		wire.push((self.opcode() as u8).into());
		match self {
			Operation::CreateElement { template, id, slot_index } => {
				wire.push(template.key().map_or(PartValue::Null, |key| key.as_str().into()));
				wire.push(id.get().into());
				wire.push((*slot_index).into());
			}
			Operation::InsertBefore { parent, child, before } => {
				wire.push(parent.get().into());
				wire.push(child.get().into());
				wire.push(before.map_or(PartValue::Null, |before| before.get().into()));
			}
			Operation::RemoveChild { parent, child } => {
				wire.push(parent.get().into());
				wire.push(child.get().into());
			}
			Operation::SetAttribute { id, part, value } => {
				wire.push(id.get().into());
				wire.push((*part).into());
				wire.push(value.clone());
			}
			Operation::SetAttributes { id, values } => {
				wire.push(id.get().into());
				wire.push(PartValue::Array(values.clone()));
			}
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
	#[error("unknown opcode {opcode} at offset {offset}")]
	UnknownOpcode { offset: usize, opcode: PartValue },
	#[error("{opcode} at offset {offset} is missing arguments")]
	Truncated { offset: usize, opcode: Opcode },
	#[error("{opcode} at offset {offset} has an invalid {argument}")]
	InvalidArgument { offset: usize, opcode: Opcode, argument: &'static str },
	#[error("{opcode} references unknown node {id}")]
	UnknownNode { opcode: Opcode, id: NodeId },
	#[error("{opcode} references unknown template {template}")]
	UnknownTemplate { opcode: Opcode, template: TemplateRef },
	#[error("{opcode} failed: {source}")]
	Tree {
		opcode: Opcode,
		#[source]
		source: TreeError,
	},
}

/// An ordered sequence of operations, applied strictly in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Vec<Operation>);
impl Patch {
	#[must_use]
	pub const fn new() -> Self {
		Self(Vec::new())
	}

	pub fn push(&mut self, operation: Operation) {
		self.0.push(operation)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> core::slice::Iter<'_, Operation> {
		self.0.iter()
	}

	#[must_use]
	pub fn operations(&self) -> &[Operation] {
		&self.0
	}

	#[must_use]
	pub fn into_operations(self) -> Vec<Operation> {
		self.0
	}

	/// The flat wire form.
	#[must_use]
	pub fn encode(&self) -> Vec<PartValue> {
		let mut wire = Vec::new();
		for operation in &self.0 {
			operation.encode_into(&mut wire)
		}
		wire
	}

	/// Decodes a whole patch.
	///
	/// To apply a patch while decoding it, use [`Decoder`] instead.
	///
	/// # Errors
	///
	/// With the first decoding error.
	pub fn decode(wire: &[PartValue]) -> Result<Self, PatchError> {
		Decoder::new(wire).collect::<Result<Vec<_>, _>>().map(Self)
	}
}
impl From<Vec<Operation>> for Patch {
	fn from(operations: Vec<Operation>) -> Self {
		Self(operations)
	}
}
impl IntoIterator for Patch {
	type Item = Operation;
	type IntoIter = std::vec::IntoIter<Operation>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}
impl<'a> IntoIterator for &'a Patch {
	type Item = &'a Operation;
	type IntoIter = core::slice::Iter<'a, Operation>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}
impl Serialize for Patch {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.encode().serialize(serializer)
	}
}
impl<'de> Deserialize<'de> for Patch {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let wire = Vec::<PartValue>::deserialize(deserializer)?;
		Self::decode(&wire).map_err(de::Error::custom)
	}
}

/// Reads operations off a flat wire array, left to right.
///
/// Yields at most one error, after which it is exhausted.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
	wire: &'a [PartValue],
	offset: usize,
	failed: bool,
}
impl<'a> Decoder<'a> {
	#[must_use]
	pub const fn new(wire: &'a [PartValue]) -> Self {
		Self { wire, offset: 0, failed: false }
	}

	/// The wire offset of the next opcode.
	#[must_use]
	pub const fn offset(&self) -> usize {
		self.offset
	}

	fn decode_one(&mut self) -> Result<Operation, PatchError> {
		let offset = self.offset;
		let raw_opcode = &self.wire[offset];
		let opcode = raw_opcode
			.as_u64()
			.and_then(|opcode| Opcode::try_from(opcode).ok())
			.ok_or_else(|| PatchError::UnknownOpcode { offset, opcode: raw_opcode.clone() })?;

		let arguments = self.wire.get(offset + 1..offset + 1 + opcode.arity()).ok_or(PatchError::Truncated { offset, opcode })?;
		let invalid = |argument: &'static str| PatchError::InvalidArgument { offset, opcode, argument };
		let id = |value: &PartValue, argument: &'static str| value.as_i64().and_then(|id| i32::try_from(id).ok()).map(NodeId).ok_or_else(|| invalid(argument));
		let optional_id = |value: &PartValue, argument: &'static str| match value {
			PartValue::Null => Ok(None),
			value => id(value, argument).map(Some),
		};

		let operation = match opcode {
			Opcode::CreateElement => Operation::CreateElement {
				template: match &arguments[0] {
					PartValue::Null => TemplateRef::RawValue,
					PartValue::String(key) => TemplateRef::Template(TemplateKey::new(key)),
					_ => return Err(invalid("template")),
				},
				id: id(&arguments[1], "id")?,
				slot_index: match &arguments[2] {
					PartValue::Null => 0,
					value => value.as_u64().and_then(|slot| SlotIndex::try_from(slot).ok()).ok_or_else(|| invalid("slot index"))?,
				},
			},
			Opcode::InsertBefore => Operation::InsertBefore {
				parent: id(&arguments[0], "parent id")?,
				child: id(&arguments[1], "child id")?,
				before: optional_id(&arguments[2], "before id")?,
			},
			Opcode::RemoveChild => Operation::RemoveChild {
				parent: id(&arguments[0], "parent id")?,
				child: id(&arguments[1], "child id")?,
			},
			Opcode::SetAttribute => Operation::SetAttribute {
				id: id(&arguments[0], "id")?,
				part: arguments[1].as_u64().and_then(|part| usize::try_from(part).ok()).ok_or_else(|| invalid("part index"))?,
				value: arguments[2].clone(),
			},
			Opcode::SetAttributes => Operation::SetAttributes {
				id: id(&arguments[0], "id")?,
				values: match &arguments[1] {
					PartValue::Array(values) => values.clone(),
					// A missing value list degrades to empty.
					PartValue::Null => Vec::new(),
					_ => return Err(invalid("values")),
				},
			},
		};
		self.offset += 1 + opcode.arity();
		Ok(operation)
	}
}
impl<'a> Iterator for Decoder<'a> {
	type Item = Result<Operation, PatchError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed || self.offset >= self.wire.len() {
			return None;
		}
		let result = self.decode_one();
		self.failed = result.is_err();
		Some(result)
	}
}
impl<'a> FusedIterator for Decoder<'a> {}
