//! Restoring a host tree from a serialized snapshot, for when the render side starts from a tree it already painted.

use crate::{
	host::{HostOptions, HostPrimitives, HostTree},
	node::{NodeId, SerializedNode},
	patch::{Opcode, Operation, Patch, PatchError},
	template::TemplateRegistry,
};
use std::sync::Arc;
use tracing::instrument;

/// Rebuilds a realized host tree from a snapshot, keeping its ids, e.g. to restore a first paint.
///
/// # Errors
///
/// Iff the snapshot uses unregistered templates or slots, repeats an id, or has more values than holes somewhere.
#[instrument(skip(snapshot, templates, primitives))]
pub fn load_host_tree<P: HostPrimitives>(snapshot: &SerializedNode, templates: Arc<TemplateRegistry>, primitives: P, options: HostOptions) -> Result<HostTree<P>, PatchError> {
	let mut tree = HostTree::with_root(templates, primitives, options, snapshot.id, snapshot.template.clone()).map_err(|source| PatchError::Tree {
		opcode: Opcode::CreateElement,
		source,
	})?;

	let mut patch = Patch::new();
	push_values(&mut patch, snapshot);
	for child in &snapshot.children {
		push_subtree(&mut patch, snapshot.id, child);
	}
	tree.apply(&patch)?;
	Ok(tree)
}

fn push_values(patch: &mut Patch, node: &SerializedNode) {
	if node.values().iter().any(|value| !value.is_null()) {
		patch.push(Operation::SetAttributes {
			id: node.id,
			values: node.values().to_vec(),
		});
	}
}

/// Creates `node`'s subtree detached, then attaches it in one go.
fn push_subtree(patch: &mut Patch, parent: NodeId, node: &SerializedNode) {
	patch.push(Operation::CreateElement {
		template: node.template.clone(),
		id: node.id,
		slot_index: node.slot_index,
	});
	push_values(patch, node);
	for child in &node.children {
		push_subtree(patch, node.id, child);
	}
	patch.push(Operation::InsertBefore {
		parent,
		child: node.id,
		before: None,
	});
}
