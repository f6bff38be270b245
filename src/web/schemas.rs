use crate::tools::filestore_tool::{Artifact, Category};
use serde::Serialize;

// Response bodies for the routes that do not return a tool result directly.

#[derive(Debug, Serialize)]
pub struct HealthResult {
    pub status: &'static str,
    pub active_runs: usize,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ArtifactListResult {
    pub category: Category,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Serialize)]
pub struct StopResult {
    pub success: bool,
    pub stopped: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CleanupResult {
    pub session_key: String,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct InputResult {
    pub success: bool,
    pub bytes: usize,
}
