//! One-time reconciliation of the host's first-paint snapshot with the first shadow tree.
//!
//! Both sides build their first tree with the pre-commit counter, so the walk matches nodes by id.
//! A host child is kept iff the shadow tree has a node with the same id under the same parent, with the same
//! template and slot. Everything else on the host side is removed, and shadow nodes without a kept counterpart
//! are created along with their whole subtree.
//!
//! All removals are emitted before any creation, so a recreated node may safely reuse the id of a removed one.

use crate::{
	node::{NodeId, PartValue, SerializedNode, TemplateRef},
	patch::{Operation, Patch},
	shadow::{ShadowNode, ShadowTree},
};
use hashbrown::{HashMap, HashSet};
use thiserror::Error;
use tracing::{instrument, trace, trace_span};

/// How deep [`hydrate`] walks before giving up with [`HydrateError::DepthLimit`].
pub const DEFAULT_DEPTH_LIMIT: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HydrateError {
	#[error("expected root {expected}({expected_template}) but found {found}({found_template})")]
	RootMismatch {
		expected: NodeId,
		expected_template: TemplateRef,
		found: NodeId,
		found_template: TemplateRef,
	},
	#[error("node {0} appears more than once in the host snapshot")]
	DuplicateId(NodeId),
	#[error("the shadow tree is already hydrated")]
	AlreadyAttached,
	#[error("tree depth exceeds the limit of {0}")]
	DepthLimit(usize),
}

/// Produces the patch that makes the host tree described by `before` match `after`, then attaches `after`
/// so that further edits are recorded and get commit ids.
///
/// Returns an empty patch iff the trees already match.
///
/// # Errors
///
/// Iff the roots differ, `before` contains an id twice, `after` was hydrated before,
/// or either tree is deeper than [`DEFAULT_DEPTH_LIMIT`]. Nothing changes in that case.
pub fn hydrate(before: &SerializedNode, after: &mut ShadowTree) -> Result<Patch, HydrateError> {
	hydrate_with_depth_limit(before, after, DEFAULT_DEPTH_LIMIT)
}

/// [`hydrate`] with an explicit depth limit.
///
/// # Errors
///
/// As [`hydrate`].
#[instrument(skip(before, after))]
pub fn hydrate_with_depth_limit(before: &SerializedNode, after: &mut ShadowTree, depth_limit: usize) -> Result<Patch, HydrateError> {
	if after.is_attached() {
		return Err(HydrateError::AlreadyAttached);
	}

	let mut seen = HashSet::new();
	collect_ids(before, 0, depth_limit, &mut seen)?;

	let patch = {
		let root = after.node(after.root()).ok_or(HydrateError::AlreadyAttached)?;
		if root.id() != before.id || root.template() != &before.template {
			return Err(HydrateError::RootMismatch {
				expected: root.id(),
				expected_template: root.template().clone(),
				found: before.id,
				found_template: before.template.clone(),
			});
		}

		let mut reconciler = Reconciler {
			shadow: after.nodes(),
			depth_limit,
			patch: Patch::new(),
		};
		reconciler.remove_unmatched(before, root, 0)?;
		reconciler.align(before, root, 0)?;
		reconciler.patch
	};

	for id in seen {
		after.ids_mut().observe(id);
	}
	after.ids_mut().attach();
	trace!(operations = patch.len(), "Hydrated.");
	Ok(patch)
}

fn collect_ids(node: &SerializedNode, depth: usize, depth_limit: usize, seen: &mut HashSet<NodeId>) -> Result<(), HydrateError> {
	if depth > depth_limit {
		return Err(HydrateError::DepthLimit(depth_limit));
	}
	if !seen.insert(node.id) {
		return Err(HydrateError::DuplicateId(node.id));
	}
	for child in &node.children {
		collect_ids(child, depth + 1, depth_limit, seen)?;
	}
	Ok(())
}

/// Compares value lists with missing trailing values read as null.
fn values_match(host: &[PartValue], shadow: &[PartValue]) -> bool {
	(0..host.len().max(shadow.len())).all(|i| host.get(i).unwrap_or(&PartValue::Null) == shadow.get(i).unwrap_or(&PartValue::Null))
}

struct Reconciler<'a> {
	shadow: &'a HashMap<NodeId, ShadowNode>,
	depth_limit: usize,
	patch: Patch,
}
impl<'a> Reconciler<'a> {
	fn check_depth(&self, depth: usize) -> Result<(), HydrateError> {
		if depth > self.depth_limit {
			Err(HydrateError::DepthLimit(self.depth_limit))
		} else {
			Ok(())
		}
	}

	/// The shadow node a host child under `parent` is kept as, if any.
	fn counterpart(&self, parent: NodeId, host: &SerializedNode) -> Option<&'a ShadowNode> {
		self.shadow
			.get(&host.id)
			.filter(|shadow| shadow.parent() == Some(parent) && shadow.template() == &host.template && shadow.slot_index() == host.slot_index)
	}

	fn remove_unmatched(&mut self, host: &SerializedNode, shadow: &'a ShadowNode, depth: usize) -> Result<(), HydrateError> {
		self.check_depth(depth)?;
		for child in &host.children {
			if let Some(counterpart) = self.counterpart(shadow.id(), child) {
				self.remove_unmatched(child, counterpart, depth + 1)?;
			} else {
				trace!("Expected no host node {}({}) under {} but found one. Removing it.", child.id, child.template, host.id);
				self.patch.push(Operation::RemoveChild { parent: host.id, child: child.id });
			}
		}
		Ok(())
	}

	/// Brings the kept node `host` in line with `shadow`: values, then child order, then each kept child.
	fn align(&mut self, host: &SerializedNode, shadow: &'a ShadowNode, depth: usize) -> Result<(), HydrateError> {
		self.check_depth(depth)?;
		let span = trace_span!("Aligning", id = %shadow.id());
		let _enter = span.enter();

		if !values_match(host.values(), shadow.values()) {
			trace!("Values differ. Resetting them.");
			self.patch.push(Operation::SetAttributes {
				id: shadow.id(),
				values: shadow.values().to_vec(),
			});
		}

		let kept: Vec<(&SerializedNode, &'a ShadowNode)> = host.children.iter().filter_map(|child| self.counterpart(shadow.id(), child).map(|counterpart| (child, counterpart))).collect();
		let desired = shadow.children();
		let positions: HashMap<NodeId, usize> = desired.iter().enumerate().map(|(i, &id)| (id, i)).collect();
		let sequence: Vec<usize> = kept.iter().filter_map(|(_, counterpart)| positions.get(&counterpart.id()).copied()).collect();
		let stay: HashSet<usize> = longest_increasing_subsequence(&sequence).into_iter().collect();
		let kept_ids: HashSet<NodeId> = kept.iter().map(|(_, counterpart)| counterpart.id()).collect();

		// Right to left, so that each `before` is already in its final place.
		for (i, &child) in desired.iter().enumerate().rev() {
			if stay.contains(&i) {
				continue;
			}
			let node = match self.shadow.get(&child) {
				Some(node) => node,
				None => continue,
			};
			let before = desired
				.get(i + 1)
				.copied()
				.filter(|next| self.shadow.get(next).map(ShadowNode::slot_index) == Some(node.slot_index()));
			if kept_ids.contains(&child) {
				trace!(%child, ?before, "Moving.");
			} else {
				self.create(node, depth + 1)?;
			}
			self.patch.push(Operation::InsertBefore { parent: shadow.id(), child, before });
		}

		for (host_child, counterpart) in kept {
			self.align(host_child, counterpart, depth + 1)?;
		}
		Ok(())
	}

	/// Emits the detached creation of `node`'s whole subtree.
	fn create(&mut self, node: &'a ShadowNode, depth: usize) -> Result<(), HydrateError> {
		self.check_depth(depth)?;
		trace!(id = %node.id(), template = %node.template(), "Creating.");
		self.patch.push(Operation::CreateElement {
			template: node.template().clone(),
			id: node.id(),
			slot_index: node.slot_index(),
		});
		if node.values().iter().any(|value| !value.is_null()) {
			self.patch.push(Operation::SetAttributes {
				id: node.id(),
				values: node.values().to_vec(),
			});
		}
		for &child in node.children() {
			if let Some(child_node) = self.shadow.get(&child) {
				self.create(child_node, depth + 1)?;
				self.patch.push(Operation::InsertBefore {
					parent: node.id(),
					child,
					before: None,
				});
			}
		}
		Ok(())
	}
}

/// The longest strictly increasing subsequence of `sequence`, as values.
fn longest_increasing_subsequence(sequence: &[usize]) -> Vec<usize> {
	let mut tails: Vec<usize> = Vec::new();
	let mut previous = vec![None; sequence.len()];
	for (i, &value) in sequence.iter().enumerate() {
		let at = tails.partition_point(|&tail| sequence[tail] < value);
		if at > 0 {
			previous[i] = Some(tails[at - 1]);
		}
		if at == tails.len() {
			tails.push(i);
		} else {
			tails[at] = i;
		}
	}

	let mut result = Vec::with_capacity(tails.len());
	let mut current = tails.last().copied();
	while let Some(i) = current {
		result.push(sequence[i]);
		current = previous[i];
	}
	result.reverse();
	result
}
