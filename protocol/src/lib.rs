//! Persisted data model for the SLB approval broker.
//!
//! Everything in this crate is either written to the shared store or to a
//! rollback manifest on disk, so the serde representations here are part of
//! the on-disk contract and must stay stable.

mod command;
mod error;
mod ids;
mod model;
mod rollback;

pub use command::CommandSpec;
pub use error::ErrorKind;
pub use error::Result;
pub use error::SlbErr;
pub use ids::AuditEventId;
pub use ids::RequestId;
pub use ids::ReviewId;
pub use ids::SessionId;
pub use model::Attachment;
pub use model::AttachmentKind;
pub use model::AuditEvent;
pub use model::AuditEventKind;
pub use model::ExecutionResult;
pub use model::Justification;
pub use model::Request;
pub use model::RequestStatus;
pub use model::Review;
pub use model::ReviewDecision;
pub use model::RiskTier;
pub use model::Session;
pub use rollback::FilesystemRollback;
pub use rollback::GitRollback;
pub use rollback::KubernetesRollback;
pub use rollback::ROLLBACK_MANIFEST_VERSION;
pub use rollback::RollbackData;
pub use rollback::RollbackKind;
pub use rollback::RollbackRoot;
