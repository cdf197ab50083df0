//! Control plane for import jobs.
//!
//! The coordinator owns everything with a single-writer constraint: the
//! checkpoint document, the rate limiter, and the authoritative caches.
//! Workers are in-process tasks fed over typed channels; their only shared
//! state is the rate-limiter handle and the cancellation token.

pub mod checkpoint;
pub mod coordinator;
pub mod roles;

pub use checkpoint::{CheckpointError, CheckpointManager, CreateParams};
pub use coordinator::{Coordinator, RunOutcome};
pub use roles::{
    process_role_definitions, RoleDefinition, RoleDefinitionOutcome, RoleDefinitionsReport,
    RoleOutcomeKind,
};
