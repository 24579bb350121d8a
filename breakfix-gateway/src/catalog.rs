//! Exercise catalog loading for the in-memory store.

use std::path::Path;

use breakfix_core::Exercise;

use crate::error::GatewayError;

/// Environment variable naming the catalog file.
pub const CATALOG_VAR: &str = "BREAKFIX_EXERCISES";

/// Parse a JSON array of exercises.
///
/// # Errors
/// Returns [`GatewayError::Catalog`] if the JSON is malformed or two
/// exercises share an id.
pub fn parse_exercises(raw: &str) -> Result<Vec<Exercise>, GatewayError> {
    let exercises: Vec<Exercise> =
        serde_json::from_str(raw).map_err(|e| GatewayError::Catalog(e.to_string()))?;

    let mut ids: Vec<_> = exercises.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(GatewayError::Catalog(format!("duplicate exercise id {}", pair[0])));
    }
    Ok(exercises)
}

/// Read and parse the catalog file at `path`.
///
/// # Errors
/// Returns [`GatewayError::Catalog`] if the file cannot be read or parsed.
pub async fn load_exercises(path: &Path) -> Result<Vec<Exercise>, GatewayError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GatewayError::Catalog(format!("read {}: {e}", path.display())))?;
    let exercises = parse_exercises(&raw)?;
    tracing::info!(path = %path.display(), count = exercises.len(), "exercise catalog loaded");
    Ok(exercises)
}
