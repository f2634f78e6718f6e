//! Types shared between the slotflow orchestrator and stage workers.
//!
//! A stage worker only needs this crate: it reads a [`WorkerInput`] manifest
//! from the path in [`env::INPUT`], does its work, and writes a
//! [`StageOutput`] to the path in [`env::OUTPUT`] before exiting zero.

pub mod artifact;
pub mod ids;
pub mod worker;

pub use artifact::{Artifact, ArtifactKind, AssetRef};
pub use ids::{ParseIdError, RunId, StageId, normalize_jurisdiction};
pub use worker::{CacheRef, InputRef, StageOutput, WorkerInput, env};
