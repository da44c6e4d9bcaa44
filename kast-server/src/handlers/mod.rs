pub mod imports;
pub mod scans;
pub mod shares;
pub mod system;

use serde::Serialize;

/// Success envelope shared by every JSON endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data,
        }
    }
}

fn parse_id<T>(raw: &str, kind: &str) -> crate::errors::AppResult<T>
where
    T: std::str::FromStr,
{
    raw.parse()
        .map_err(|_| crate::errors::AppError::bad_request(format!("invalid {kind} id")))
}
