//! Position-addressed tracking of virtualized list children.
//!
//! Children of a list container are not realized eagerly. Instead, each patch's edits to them are summarized
//! as [`ListOperations`] against the child order at the start of the patch, and the host renders children
//! on demand through [`component_at_index`](`crate::host::HostTree::component_at_index`), recycling
//! elements that scrolled out of view.

use crate::{
	node::{ListItemInfo, NodeId, TemplateRef},
	template::StaticShape,
};
use core::{
	fmt::{self, Display, Formatter},
	str::FromStr,
};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{trace, warn};

/// Static attribute naming the platform's list implementation.
pub const CUSTOM_LIST_NAME: &str = "custom-list-name";
/// The [`CUSTOM_LIST_NAME`] value of lists that need full update lists on legacy runtimes.
pub const LEGACY_LIST_CONTAINER: &str = "list-container";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListError {
	#[error("unknown list {0}")]
	UnknownList(NodeId),
	#[error("node {0} is not a list container")]
	NotAList(NodeId),
	#[error("list {list} has no child at index {index}")]
	IndexOutOfRange { list: NodeId, index: usize },
	#[error("list {0} is not realized")]
	Unrealized(NodeId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertAction {
	/// Index in the final child order.
	pub position: usize,
	#[serde(rename = "type")]
	pub template: TemplateRef,
	#[serde(flatten)]
	pub info: ListItemInfo,
}
impl InsertAction {
	fn new(position: usize, child: &ListChild) -> Self {
		Self {
			position,
			template: child.template.clone(),
			info: child.info.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAction {
	pub from: usize,
	pub to: usize,
	/// Whether the host must re-render the child right away instead of on its next pass. Never set by this crate.
	pub flush: bool,
	#[serde(rename = "type")]
	pub template: TemplateRef,
	#[serde(flatten)]
	pub info: ListItemInfo,
}
impl UpdateAction {
	fn new(position: usize, child: &ListChild) -> Self {
		Self {
			from: position,
			to: position,
			flush: false,
			template: child.template.clone(),
			info: child.info.clone(),
		}
	}
}

/// The list metadata handed to the host's list primitive after each patch.
///
/// Replaying `remove_action` (against the previous order), then `insert_action`, then `update_action`
/// yields the current order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOperations {
	pub insert_action: Vec<InsertAction>,
	/// Ascending indices into the previous child order.
	pub remove_action: Vec<usize>,
	pub update_action: Vec<UpdateAction>,
}
impl ListOperations {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.insert_action.is_empty() && self.remove_action.is_empty() && self.update_action.is_empty()
	}
}

/// A host runtime version, as `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion {
	pub major: u32,
	pub minor: u32,
}
impl RuntimeVersion {
	#[must_use]
	pub const fn new(major: u32, minor: u32) -> Self {
		Self { major, minor }
	}

	/// Runtimes 2.14 through 2.18 can't apply incremental updates to `list-container` lists.
	#[must_use]
	pub const fn lacks_incremental_list_updates(self) -> bool {
		self.major == 2 && self.minor >= 14 && self.minor <= 18
	}
}
impl Display for RuntimeVersion {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.major, self.minor)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected a runtime version like `2.14` but found {0:?}")]
pub struct ParseRuntimeVersionError(String);

impl FromStr for RuntimeVersion {
	type Err = ParseRuntimeVersionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let error = || ParseRuntimeVersionError(s.to_owned());
		let mut parts = s.trim().split('.');
		let major = parts.next().and_then(|major| major.parse().ok()).ok_or_else(error)?;
		let minor = parts.next().map_or(Ok(0), |minor| minor.parse().map_err(|_| error()))?;
		Ok(Self { major, minor })
	}
}

/// Whether a list with the given static shape needs its full update list on `runtime_version`.
#[must_use]
pub fn needs_full_update(runtime_version: Option<RuntimeVersion>, shape: &StaticShape) -> bool {
	runtime_version.map_or(false, RuntimeVersion::lacks_incremental_list_updates) && shape.attribute(CUSTOM_LIST_NAME) == Some(LEGACY_LIST_CONTAINER)
}

/// The recycling pool key of a list child: its template plus its reuse identifier.
#[must_use]
pub fn reuse_id(template: &TemplateRef, info: &ListItemInfo) -> String {
	format!("{}{}", template.name(), info.reuse_identifier().unwrap_or_default())
}

/// What [`ListUpdateRecording::finish`] needs to know about a current child.
#[derive(Debug, Clone)]
pub struct ListChild {
	pub id: NodeId,
	pub template: TemplateRef,
	pub info: ListItemInfo,
}

/// Edits to one list's children within one patch.
///
/// A child that is moved, removed, or whose item key changes loses its identity in the list:
/// it counts as removed from its old position and, if still present, inserted at its new one.
#[derive(Debug, Clone)]
pub struct ListUpdateRecording {
	list: NodeId,
	old_children: Vec<NodeId>,
	removed: HashSet<NodeId>,
	updated: HashSet<NodeId>,
}
impl ListUpdateRecording {
	/// Starts tracking `list`, whose children are currently `old_children`.
	#[must_use]
	pub fn new(list: NodeId, old_children: Vec<NodeId>) -> Self {
		Self {
			list,
			old_children,
			removed: HashSet::new(),
			updated: HashSet::new(),
		}
	}

	#[must_use]
	pub const fn list(&self) -> NodeId {
		self.list
	}

	/// Call before `child` is inserted. `was_attached` tells whether this is a move.
	pub fn on_insert_before(&mut self, child: NodeId, was_attached: bool) {
		if was_attached {
			self.removed.insert(child);
		}
	}

	pub fn on_remove_child(&mut self, child: NodeId) {
		self.removed.insert(child);
	}

	/// Call when a child's list item info changes from `old` to `new`.
	pub fn on_set_info(&mut self, child: NodeId, old: &ListItemInfo, new: &ListItemInfo) {
		if old.item_key() == new.item_key() {
			self.updated.insert(child);
		} else {
			trace!(list = %self.list, %child, "Item key changed. Recording removal and insertion.");
			self.removed.insert(child);
		}
	}

	/// Computes the actions turning the old child order into `current`.
	///
	/// Walks the old children once, with `j` as the position reached in `current`. Current children passed
	/// over on the way to the next kept one are insertions, and whatever follows the last kept one is appended.
	/// With `full_update`, the updates list every current child instead of just the changed ones.
	#[must_use]
	pub fn finish(&self, current: &[ListChild], full_update: bool) -> ListOperations {
		let present: HashSet<NodeId> = current.iter().map(|child| child.id).collect();
		let mut operations = ListOperations::default();

		let mut j = 0;
		for (i, &id) in self.old_children.iter().enumerate() {
			if self.removed.contains(&id) || !present.contains(&id) {
				operations.remove_action.push(i);
				continue;
			}
			while let Some(inserted) = current.get(j).filter(|child| child.id != id) {
				operations.insert_action.push(InsertAction::new(j, inserted));
				j += 1;
			}
			if let Some(child) = current.get(j).filter(|_| self.updated.contains(&id)) {
				operations.update_action.push(UpdateAction::new(j, child));
			}
			j += 1;
		}
		for (position, inserted) in current.iter().enumerate().skip(j) {
			operations.insert_action.push(InsertAction::new(position, inserted));
		}

		if full_update {
			operations.update_action = current.iter().enumerate().map(|(i, child)| UpdateAction::new(i, child)).collect();
		}

		debug_assert_eq!(self.old_children.len() - operations.remove_action.len() + operations.insert_action.len(), current.len());
		operations
	}
}

/// Element identity handed to the platform list, stable while an element set is rendered.
pub type Sign = u64;

/// Tracks which child each rendered element set currently shows, and the element sets waiting for reuse.
#[derive(Debug, Default)]
pub struct ListRecycler {
	next_sign: Sign,
	signs: HashMap<Sign, NodeId>,
	by_node: HashMap<NodeId, Sign>,
	/// Reuse id by pooled sign.
	pooled: HashMap<Sign, String>,
	pool: HashMap<String, BTreeSet<Sign>>,
}
impl ListRecycler {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn sign_of(&self, child: NodeId) -> Option<Sign> {
		self.by_node.get(&child).copied()
	}

	#[must_use]
	pub fn node_of(&self, sign: Sign) -> Option<NodeId> {
		self.signs.get(&sign).copied()
	}

	#[must_use]
	pub fn is_pooled(&self, sign: Sign) -> bool {
		self.pooled.contains_key(&sign)
	}

	/// Number of pooled element sets.
	#[must_use]
	pub fn pool_len(&self) -> usize {
		self.pooled.len()
	}

	/// Registers a freshly rendered `child` under a new sign.
	pub fn assign(&mut self, child: NodeId) -> Sign {
		self.next_sign += 1;
		let sign = self.next_sign;
		self.signs.insert(sign, child);
		self.by_node.insert(child, sign);
		sign
	}

	/// Moves a pooled element set over to `child`, which now shows it.
	pub fn transfer(&mut self, sign: Sign, child: NodeId) {
		self.unpool(sign);
		if let Some(previous) = self.signs.insert(sign, child) {
			self.by_node.remove(&previous);
		}
		self.by_node.insert(child, sign);
	}

	/// Returns an element set to the pool under `reuse_id`.
	///
	/// Returns `false` for unknown signs.
	pub fn enqueue(&mut self, sign: Sign, reuse_id: String) -> bool {
		if !self.signs.contains_key(&sign) {
			warn!("Expected a rendered list item with sign {} but found none. Ignoring it.", sign);
			return false;
		}
		self.unpool(sign);
		self.pool.entry(reuse_id.clone()).or_default().insert(sign);
		self.pooled.insert(sign, reuse_id);
		true
	}

	/// Takes `sign` out of the pool, if it is pooled.
	pub fn unpool(&mut self, sign: Sign) -> bool {
		match self.pooled.remove(&sign) {
			Some(reuse_id) => {
				if let Some(signs) = self.pool.get_mut(&reuse_id) {
					signs.remove(&sign);
					if signs.is_empty() {
						self.pool.remove(&reuse_id);
					}
				}
				true
			}
			None => false,
		}
	}

	/// Pooled signs under `reuse_id`, oldest first.
	pub fn pooled(&self, reuse_id: &str) -> impl Iterator<Item = Sign> + '_ {
		self.pool.get(reuse_id).into_iter().flatten().copied()
	}

	/// Drops everything known about `child`. Returns its sign, if it had one.
	pub fn forget(&mut self, child: NodeId) -> Option<Sign> {
		let sign = self.by_node.remove(&child)?;
		self.unpool(sign);
		self.signs.remove(&sign);
		Some(sign)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn info(key: &str) -> ListItemInfo {
		ListItemInfo::from_part(&json!({ "item-key": key }))
	}

	fn child(id: i32, key: &str) -> ListChild {
		ListChild {
			id: NodeId(id),
			template: TemplateRef::template("item"),
			info: info(key),
		}
	}

	fn ids(ids: &[i32]) -> Vec<NodeId> {
		ids.iter().copied().map(NodeId).collect()
	}

	/// Replays `operations` on `old`, with inserted positions standing in for new children.
	fn replay(old: &[i32], operations: &ListOperations, current: &[ListChild]) -> Vec<i32> {
		let mut order: Vec<i32> = old.to_vec();
		for &i in operations.remove_action.iter().rev() {
			order.remove(i);
		}
		for insert in &operations.insert_action {
			order.insert(insert.position, current[insert.position].id.0);
		}
		order
	}

	#[test]
	fn key_change_is_remove_and_insert() {
		let mut recording = ListUpdateRecording::new(NodeId(1), ids(&[2, 3]));
		recording.on_set_info(NodeId(2), &info("k1"), &info("k2"));
		let current = [child(2, "k2"), child(3, "b")];
		let operations = recording.finish(&current, false);
		assert_eq!(operations.remove_action, vec![0]);
		assert_eq!(
			operations.insert_action,
			vec![InsertAction {
				position: 0,
				template: TemplateRef::template("item"),
				info: info("k2")
			}]
		);
		assert!(operations.update_action.is_empty());
	}

	#[test]
	fn same_key_is_update() {
		let mut recording = ListUpdateRecording::new(NodeId(1), ids(&[2, 3]));
		let mut changed = info("b");
		changed.0.insert("estimated-height".to_owned(), json!(40));
		recording.on_set_info(NodeId(3), &info("b"), &changed);
		let mut current = [child(2, "a"), child(3, "b")];
		current[1].info = changed.clone();
		let operations = recording.finish(&current, false);
		assert!(operations.remove_action.is_empty() && operations.insert_action.is_empty());
		assert_eq!(
			operations.update_action,
			vec![UpdateAction {
				from: 1,
				to: 1,
				flush: false,
				template: TemplateRef::template("item"),
				info: changed
			}]
		);
	}

	#[test]
	fn mixed_edits_replay_to_the_final_order() {
		// old: 2 3 4 5 6; remove 3, move 6 to the front, insert 7 before 5, append 8.
		let mut recording = ListUpdateRecording::new(NodeId(1), ids(&[2, 3, 4, 5, 6]));
		recording.on_remove_child(NodeId(3));
		recording.on_insert_before(NodeId(6), true);
		recording.on_insert_before(NodeId(7), false);
		recording.on_insert_before(NodeId(8), false);
		let current = [child(6, "f"), child(2, "a"), child(4, "c"), child(7, "g"), child(5, "d"), child(8, "h")];
		let operations = recording.finish(&current, false);
		assert_eq!(operations.remove_action, vec![1, 4]);
		assert_eq!(operations.insert_action.iter().map(|insert| insert.position).collect::<Vec<_>>(), vec![0, 3, 5]);
		assert_eq!(replay(&[2, 3, 4, 5, 6], &operations, &current), vec![6, 2, 4, 7, 5, 8]);
	}

	#[test]
	fn created_and_removed_child_is_absent() {
		let mut recording = ListUpdateRecording::new(NodeId(1), ids(&[2]));
		recording.on_insert_before(NodeId(9), false);
		recording.on_remove_child(NodeId(9));
		assert!(recording.finish(&[child(2, "a")], false).is_empty());
	}

	#[test]
	fn full_update_lists_every_child() {
		let mut recording = ListUpdateRecording::new(NodeId(1), ids(&[2]));
		recording.on_insert_before(NodeId(3), false);
		let operations = recording.finish(&[child(2, "a"), child(3, "b")], true);
		assert_eq!(operations.update_action.iter().map(|update| (update.from, update.to)).collect::<Vec<_>>(), vec![(0, 0), (1, 1)]);
		assert_eq!(operations.insert_action.len(), 1);
	}

	#[test]
	fn wire_form() {
		let operations = ListOperations {
			insert_action: vec![InsertAction {
				position: 0,
				template: TemplateRef::template("item"),
				info: info("k2"),
			}],
			remove_action: vec![0],
			update_action: Vec::new(),
		};
		assert_eq!(
			serde_json::to_value(&operations).unwrap(),
			json!({
				"insertAction": [{ "position": 0, "type": "item", "item-key": "k2" }],
				"removeAction": [0],
				"updateAction": [],
			})
		);
	}

	#[test]
	fn legacy_detection() {
		let legacy = StaticShape::new("list").with_attribute(CUSTOM_LIST_NAME, LEGACY_LIST_CONTAINER);
		assert!(needs_full_update(Some("2.14".parse().unwrap()), &legacy));
		assert!(needs_full_update(Some(RuntimeVersion::new(2, 18)), &legacy));
		assert!(!needs_full_update(Some(RuntimeVersion::new(2, 19)), &legacy));
		assert!(!needs_full_update(Some(RuntimeVersion::new(2, 13)), &legacy));
		assert!(!needs_full_update(None, &legacy));
		assert!(!needs_full_update(Some(RuntimeVersion::new(2, 16)), &StaticShape::new("list")));
		assert!("x.1".parse::<RuntimeVersion>().is_err());
		assert_eq!("3".parse::<RuntimeVersion>(), Ok(RuntimeVersion::new(3, 0)));
	}

	#[test]
	fn recycler_pool() {
		let mut recycler = ListRecycler::new();
		let a = recycler.assign(NodeId(2));
		let b = recycler.assign(NodeId(3));
		assert!(recycler.enqueue(a, "item".to_owned()));
		assert!(recycler.enqueue(b, "item".to_owned()));
		assert!(!recycler.enqueue(99, "item".to_owned()));
		assert_eq!(recycler.pooled("item").collect::<Vec<_>>(), vec![a, b]);

		recycler.transfer(a, NodeId(4));
		assert_eq!(recycler.node_of(a), Some(NodeId(4)));
		assert_eq!(recycler.sign_of(NodeId(2)), None);
		assert_eq!(recycler.pooled("item").collect::<Vec<_>>(), vec![b]);

		assert_eq!(recycler.forget(NodeId(3)), Some(b));
		assert_eq!(recycler.pool_len(), 0);
	}
}
