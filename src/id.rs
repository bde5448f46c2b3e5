//! Per-tree identity allocation.
//!
//! Two counters exist per tree root. Before the tree is attached to its counterpart, ids come from the
//! pre-commit counter (`-1`, `-2`, …). Afterwards, they come from the commit counter, which starts
//! above [`COMMIT_ID_BASELINE`] and only increases. Both sides of a session use the same convention,
//! so a first tree built independently on each side lines up by id alone.

use crate::node::NodeId;
use thiserror::Error;

/// The commit counter's starting value. The first id handed out after attachment is one above it.
pub const COMMIT_ID_BASELINE: i32 = 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
	#[error("the {0} id counter is exhausted")]
	Exhausted(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocator {
	pre_commit: i32,
	commit: i32,
	attached: bool,
}
impl Default for IdAllocator {
	fn default() -> Self {
		Self::new()
	}
}
impl IdAllocator {
	#[must_use]
	pub const fn new() -> Self {
		Self {
			pre_commit: 0,
			commit: COMMIT_ID_BASELINE,
			attached: false,
		}
	}

	#[must_use]
	pub const fn is_attached(&self) -> bool {
		self.attached
	}

	/// Switches to the commit counter. Idempotent.
	pub fn attach(&mut self) {
		self.attached = true;
	}

	/// Hands out the next id from whichever counter is active.
	///
	/// # Errors
	///
	/// Iff the active counter would overflow.
	pub fn next_id(&mut self) -> Result<NodeId, IdError> {
		if self.attached {
			self.commit = self.commit.checked_add(1).ok_or(IdError::Exhausted("commit"))?;
			Ok(NodeId(self.commit))
		} else {
			self.pre_commit = self.pre_commit.checked_sub(1).ok_or(IdError::Exhausted("pre-commit"))?;
			Ok(NodeId(self.pre_commit))
		}
	}

	/// Moves the matching counter past an id that was assigned elsewhere, e.g. by a replayed patch,
	/// so that it is never handed out again.
	pub fn observe(&mut self, id: NodeId) {
		if id.is_pre_commit() {
			self.pre_commit = self.pre_commit.min(id.0);
		} else {
			self.commit = self.commit.max(id.0);
		}
	}
}
