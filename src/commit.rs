//! Commit envelopes and their generation-ordered delivery.

use crate::patch::Patch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// What one commit ships to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEnvelope {
	/// Strictly increasing per shadow tree, starting at `1`.
	pub generation: u64,
	/// Hosts drop envelopes stamped with an older reload version than their own.
	#[serde(default)]
	pub reload_version: u32,
	/// Set on the envelope produced by hydration.
	#[serde(default)]
	pub is_hydration: bool,
	pub patches: Vec<Patch>,
}
impl CommitEnvelope {
	/// Whether applying this envelope would change nothing.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.patches.iter().all(Patch::is_empty)
	}
}

/// Holds work tagged with a commit generation until the host has confirmed that generation.
///
/// Items for the same generation run in scheduling order. Items for confirmed generations are ready at once.
#[derive(Debug)]
pub struct GenerationQueue<T> {
	confirmed: u64,
	pending: BTreeMap<u64, Vec<T>>,
}
impl<T> Default for GenerationQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}
impl<T> GenerationQueue<T> {
	#[must_use]
	pub const fn new() -> Self {
		Self {
			confirmed: 0,
			pending: BTreeMap::new(),
		}
	}

	/// The highest generation the host has confirmed so far.
	#[must_use]
	pub const fn confirmed(&self) -> u64 {
		self.confirmed
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.pending.values().map(Vec::len).sum()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	pub fn schedule(&mut self, generation: u64, item: T) {
		trace!(generation, confirmed = self.confirmed, "Scheduling task.");
		self.pending.entry(generation).or_default().push(item);
	}

	/// Records that the host has applied everything up to and including `generation`
	/// and returns the items that became ready, as [`drain_ready`](`GenerationQueue::drain_ready`).
	///
	/// Confirmations never go backwards; a stale one is ignored.
	pub fn advance_to(&mut self, generation: u64) -> Vec<T> {
		if generation < self.confirmed {
			warn!("Expected confirmation of generation {} or later but found {}. Ignoring it.", self.confirmed, generation);
		} else {
			self.confirmed = generation;
		}
		self.drain_ready()
	}

	/// Removes and returns all items whose generation is confirmed, oldest generation first.
	pub fn drain_ready(&mut self) -> Vec<T> {
		let later = self.pending.split_off(&(self.confirmed + 1));
		let ready = core::mem::replace(&mut self.pending, later);
		ready.into_values().flatten().collect()
	}
}
