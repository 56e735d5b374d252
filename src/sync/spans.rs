use crate::providers::{Job, Pipeline};
use crate::telemetry::{ActiveSpan, SpanStatus};

/// Maps a GitLab pipeline or job status onto a span status.
///
/// Only `success`, `failed` and `canceled` are terminal outcomes worth a
/// verdict; everything else (skipped, manual, ...) stays unset.
pub fn span_status(status: &str, failure_reason: Option<&str>) -> SpanStatus {
    match status {
        "success" => SpanStatus::Ok,
        "failed" | "canceled" => {
            let message = match failure_reason.filter(|reason| !reason.is_empty()) {
                Some(reason) => format!("{status}: {reason}"),
                None => status.to_string(),
            };
            SpanStatus::Error { message }
        }
        _ => SpanStatus::Unset,
    }
}

pub fn pipeline_span_name(pipeline: &Pipeline) -> String {
    format!("Pipeline {}", pipeline.id)
}

pub fn job_span_name(job: &Job) -> String {
    format!("Job {}", job.id)
}

pub fn record_pipeline(span: &mut ActiveSpan, project_id: &str, pipeline: &Pipeline) {
    span.set_attribute("project_id", project_id);
    span.set_attribute("pipeline_id", pipeline.id);

    // timing
    span.set_attribute("duration_s", pipeline.duration.unwrap_or_default());
    span.set_attribute(
        "queued_duration_s",
        pipeline.queued_duration.unwrap_or_default(),
    );

    span.set_attribute("status", pipeline.status.as_str());
    span.set_status(span_status(&pipeline.status, None));

    span.set_attribute("source", pipeline.source.as_str());
    span.set_attribute("ref", pipeline.ref_.as_str());
    span.set_attribute("sha", pipeline.sha.as_str());
    span.set_attribute("before_sha", pipeline.before_sha.as_str());
    span.set_attribute("is_tag", pipeline.tag);

    span.set_attribute("user", username(pipeline.user.as_ref()));
    span.set_attribute("web_url", pipeline.web_url.as_str());
}

pub fn record_job(span: &mut ActiveSpan, job: &Job) {
    span.set_attribute("duration_s", job.duration.unwrap_or_default());
    span.set_attribute("queued_duration_s", job.queued_duration.unwrap_or_default());
    span.set_attribute("allow_failure", job.allow_failure);

    span.set_attribute("status", job.status.as_str());
    span.set_status(span_status(&job.status, job.failure_reason.as_deref()));

    span.set_attribute("name", job.name.as_str());
    span.set_attribute("stage", job.stage.as_str());
    span.set_attribute(
        "sha",
        job.commit.as_ref().map_or("", |commit| commit.id.as_str()),
    );
    span.set_attribute("ref", job.ref_.as_str());
    span.set_attribute("is_tag", job.tag);
    span.set_attribute("tag_list", job.tag_list.clone());

    span.set_attribute("artifact_count", job.artifacts.len());
    span.set_attribute("web_url", job.web_url.as_str());
    span.set_attribute("user", username(job.user.as_ref()));

    let runner = job.runner.clone().unwrap_or_default();
    span.set_attribute("runner_id", runner.id);
    span.set_attribute("runner_desc", runner.description);
    span.set_attribute("runner_name", runner.name.unwrap_or_default());
    span.set_attribute("runner_is_shared", runner.is_shared);
}

fn username(user: Option<&crate::providers::gitlab::types::User>) -> &str {
    user.map_or("", |user| user.username.as_str())
}
