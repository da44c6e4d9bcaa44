//! Domain records shared by the engine, the repositories and the HTTP layer.

pub mod audit;
pub mod ids;
pub mod job;
pub mod principal;
pub mod results;
pub mod share;

pub use audit::{AuditAction, AuditOrigin, AuditRecord};
pub use ids::{AuditId, JobId, PrincipalId, ShareId};
pub use job::{
    JobFilter, JobPage, JobStats, JobStatus, PageRequest, ScanJob, ScanMode,
    ScanOptions, StatusTransition,
};
pub use principal::{Principal, PrincipalRole};
pub use results::{Disposition, SubTaskResult};
pub use share::{SharePermission, ShareGrant, ShareScope};
