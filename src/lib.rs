#![doc(html_root_url = "https://docs.rs/snapshot-sync/0.0.1")]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Keeps an application-side [`ShadowTree`] and a render-side [`HostTree`] in sync.
//!
//! The first shadow tree is reconciled against the host's first paint by [`hydrate`](`hydrate::hydrate`).
//! After that, every shadow tree edit is recorded, and [`ShadowTree::commit`] hands out the edits as one flat,
//! ordered [`Patch`] for the host to [apply](`HostTree::update`).

#[cfg(doctest)]
pub mod readme {
	doc_comment::doctest!("../README.md");
}

pub mod commit;
mod diff;
pub mod dom;
pub mod host;
pub mod hydrate;
pub mod id;
pub mod list;
pub mod load;
pub mod node;
pub mod patch;
pub mod shadow;
pub mod template;
pub mod tree;

pub use commit::{CommitEnvelope, GenerationQueue};
pub use host::{HostNode, HostOptions, HostPrimitives, HostTree};
pub use hydrate::HydrateError;
pub use node::{ListItemInfo, NodeId, PartValue, SerializedNode, SlotIndex, TemplateKey, TemplateRef};
pub use patch::{Operation, Patch, PatchError};
pub use shadow::{ShadowNode, ShadowTree};
pub use template::{SlotKind, StaticShape, TemplateDef, TemplateRegistry};
pub use tree::TreeError;
