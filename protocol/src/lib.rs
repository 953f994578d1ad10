//! Shared wire types and error kinds for the sandbox core.
//!
//! This crate has no behavior of its own: it is the vocabulary that the
//! permission engine, delta store, filesystem adapter, mount supervisor and
//! lifecycle manager all speak so that none of them need to depend on each
//! other's internals.

mod error;
mod ids;
mod rules;
mod sandbox;
mod session;

pub use error::SandboxError;
pub use error::SandboxResult;
pub use ids::SandboxId;
pub use ids::SessionId;
pub use rules::PatternKind;
pub use rules::PermissionLevel;
pub use rules::PermissionRule;
pub use sandbox::SandboxRecord;
pub use sandbox::SandboxStatus;
pub use session::SessionRecord;
pub use session::SessionState;
