// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job records and the registry that owns them.

pub mod job;
pub mod registry;

pub use job::{Job, JobKind, JobStatus, JobUpdate};
pub use registry::TaskRegistry;
