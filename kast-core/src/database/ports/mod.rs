//! Repository ports. Services depend on these traits; the Postgres adapter
//! and the in-memory test adapter implement them.

pub mod audit;
pub mod jobs;
pub mod principals;
pub mod results;
pub mod shares;

pub use audit::AuditRepository;
pub use jobs::ScanJobRepository;
pub use principals::PrincipalRepository;
pub use results::SubTaskResultRepository;
pub use shares::ShareGrantRepository;
