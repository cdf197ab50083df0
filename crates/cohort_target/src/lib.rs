//! Target identity-service API surface.
//!
//! The engine talks to the target through the [`TargetApi`] trait only.
//! `HttpTarget` drives a real endpoint over REST; `DryRunTarget` fabricates
//! ids without I/O; the `mock` feature adds a scriptable in-memory target
//! for tests. All target-observable error detail (HTTP status, vendor code,
//! request id, message) is propagated verbatim through [`TargetError`].

pub mod api;
pub mod dry_run;
pub mod error;
pub mod http;
pub mod rate_limit;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use api::TargetApi;
pub use dry_run::DryRunTarget;
pub use error::TargetError;
pub use http::{HttpTarget, HttpTargetConfig};
pub use rate_limit::{RateLimiter, RateLimiterHandle};
pub use types::{CreatedUser, Membership, NewUser, Organization, Permission, Role};
