//! Postgres adapters for the repository ports.

mod audit;
mod jobs;
mod principals;
mod results;
mod shares;

pub use audit::PostgresAuditRepository;
pub use jobs::PostgresScanJobRepository;
pub use principals::PostgresPrincipalRepository;
pub use results::PostgresSubTaskResultRepository;
pub use shares::PostgresShareGrantRepository;

use std::path::{Path, PathBuf};

use sqlx::postgres::PgRow;
use sqlx::{Decode, Postgres, Row, Type};

use crate::error::{Result, ScanError};

/// Read one column, naming it in the error.
fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| ScanError::Storage(format!("Failed to read {name}: {e}")))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn text_path(value: Option<String>) -> Option<PathBuf> {
    value.map(PathBuf::from)
}
