use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entry of the pipeline listing (`GET /projects/:id/pipelines`).
///
/// GitLab only returns a summary here; timing data needs a separate fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: u64,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "ref", default)]
    pub ref_: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub source: String,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub web_url: String,
}

/// A GitLab CI/CD pipeline (`GET /projects/:id/pipelines/:pipeline_id`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    #[serde(default)]
    pub iid: u64,
    #[serde(default)]
    pub project_id: u64,
    /// Final pipeline status (e.g. "success", "failed", "canceled")
    #[serde(default)]
    pub status: String,
    /// Trigger source (e.g. "push", "schedule", "web")
    #[serde(default)]
    pub source: String,
    #[serde(rename = "ref", default)]
    pub ref_: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub before_sha: String,
    #[serde(default)]
    pub tag: bool,
    #[serde(default)]
    pub web_url: String,
    pub user: Option<User>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds spent running
    pub duration: Option<i64>,
    /// Seconds spent waiting for a runner
    pub queued_duration: Option<i64>,
}

/// A job within a pipeline (`GET /projects/:id/pipelines/:pipeline_id/jobs`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub stage: String,
    #[serde(rename = "ref", default)]
    pub ref_: String,
    #[serde(default)]
    pub tag: bool,
    #[serde(default)]
    pub allow_failure: bool,
    pub failure_reason: Option<String>,
    pub commit: Option<Commit>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub queued_duration: Option<f64>,
    #[serde(default)]
    pub tag_list: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub runner: Option<Runner>,
    pub user: Option<User>,
    #[serde(default)]
    pub web_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub filename: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Runner {
    pub id: u64,
    #[serde(default)]
    pub description: String,
    pub name: Option<String>,
    #[serde(default)]
    pub is_shared: bool,
}
