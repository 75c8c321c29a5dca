//! Core domain model types for dockflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage kind/status enums and the job state machine
//! - Declared artifacts and the result manifest
//! - The job record

mod artifact;
mod job;
mod manifest;
mod status;

pub use artifact::{ArtifactKind, DeclaredArtifact};
pub use job::{FailureRecord, Job, JobId, JobTransition};
pub use manifest::ResultManifest;
pub use status::{JobState, JobStatus, StageKind, StageStatus};

/// UTC timestamp used in job records.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
