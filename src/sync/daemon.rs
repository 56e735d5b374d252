use chrono::Utc;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::cache::{DedupSet, PipelineCache};
use super::paginate::PageWalker;
use super::processor::{PipelineProcessor, ProcessOutcome};
use crate::error::{CITraceError, Result};
use crate::providers::{CiProvider, PipelineFilter};
use crate::telemetry::Tracer;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub project_ids: Vec<String>,
    pub cache_dir: PathBuf,
    /// Pause between two sweeps
    pub interval: Duration,
    /// Listing window when the project already has cached ids
    pub lookback: chrono::Duration,
    /// Listing window on a cold cache
    pub max_retention: chrono::Duration,
    pub per_page: u32,
    /// Maximum number of pipelines processed at once
    pub concurrency: usize,
}

/// Counters for one project scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectScan {
    pub listed: usize,
    pub cached: usize,
    pub dispatched: usize,
    pub emitted: usize,
    /// Job spans emitted under the pipelines above
    pub job_spans: usize,
    pub unfinished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ProjectScan {
    fn record(&mut self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Emitted { jobs } => {
                self.emitted += 1;
                self.job_spans += jobs;
            }
            ProcessOutcome::Unfinished => self.unfinished += 1,
            ProcessOutcome::FetchFailed => self.failed += 1,
            ProcessOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub projects: usize,
    pub failed_projects: usize,
    pub emitted: usize,
}

/// Periodically backfills finished pipelines of every configured project.
pub struct SyncDaemon {
    provider: Arc<dyn CiProvider>,
    processor: PipelineProcessor,
    settings: SyncSettings,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl SyncDaemon {
    pub fn new(
        provider: Arc<dyn CiProvider>,
        tracer: Tracer,
        settings: SyncSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let processor = PipelineProcessor::new(Arc::clone(&provider), tracer, settings.per_page);
        let workers = Arc::new(Semaphore::new(settings.concurrency.max(1)));

        Self {
            provider,
            processor,
            settings,
            workers,
            shutdown,
        }
    }

    /// Sweeps all projects, sleeps, and repeats until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error hit by a sweep.
    pub async fn run(&self) -> Result<()> {
        while !self.shutdown.is_cancelled() {
            let summary = self.sweep().await?;
            if self.shutdown.is_cancelled() {
                break;
            }

            info!(
                "Sweep finished projects={} failed={} emitted={}, sleeping {}s",
                summary.projects,
                summary.failed_projects,
                summary.emitted,
                self.settings.interval.as_secs()
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        info!("Sync stopped");
        Ok(())
    }

    /// Scans every project once, in order.
    ///
    /// A project whose scan fails is logged and skipped; the next sweep
    /// retries it. Only fatal errors abort the sweep.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        for project_id in &self.settings.project_ids {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.scan_project(project_id).await {
                Ok(scan) => {
                    info!(
                        "Scanned project={project_id} listed={} cached={} dispatched={} emitted={} jobs={} unfinished={} failed={} cancelled={}",
                        scan.listed,
                        scan.cached,
                        scan.dispatched,
                        scan.emitted,
                        scan.job_spans,
                        scan.unfinished,
                        scan.failed,
                        scan.cancelled
                    );
                    summary.projects += 1;
                    summary.emitted += scan.emitted;
                }
                Err(e) if e.is_cancelled() => {
                    info!("Scan of project {project_id} interrupted by shutdown");
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Error scanning project {project_id}: {e}");
                    summary.projects += 1;
                    summary.failed_projects += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Lists the project's recent pipelines and processes the ones not seen
    /// before. Waits for every dispatched pipeline before returning.
    pub async fn scan_project(&self, project_id: &str) -> Result<ProjectScan> {
        let cache = PipelineCache::open(&self.settings.cache_dir, project_id)?;
        let mut seen = cache.load()?;

        let window = if seen.is_empty() {
            self.settings.max_retention
        } else {
            self.settings.lookback
        };
        let filter = PipelineFilter {
            updated_after: Utc::now() - window,
        };
        info!(
            "Scanning project={project_id} updated_after={} cached={}",
            filter.updated_after,
            seen.len()
        );

        let provider = self.provider.as_ref();
        let filter = &filter;
        let mut pages = PageWalker::new(self.settings.per_page, move |page| {
            provider.list_pipelines(project_id, filter, page)
        });

        let mut scan = ProjectScan::default();
        let mut workers = JoinSet::new();

        let listing: Result<()> = 'pages: loop {
            if self.shutdown.is_cancelled() {
                break Err(CITraceError::Cancelled);
            }

            let summaries = match pages.next_page().await {
                Ok(Some(summaries)) => summaries,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            for summary in summaries {
                scan.listed += 1;
                let pipeline_id = summary.id;

                // Marked before dispatch so a slow worker is never dispatched twice
                if !seen.insert(pipeline_id) {
                    scan.cached += 1;
                    debug!("Skipping cached pipeline project={project_id} pipeline={pipeline_id}");
                    continue;
                }

                let permit = tokio::select! {
                    permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
                    _ = self.shutdown.cancelled() => None,
                };
                let Some(permit) = permit else {
                    seen.remove(&pipeline_id);
                    break 'pages Err(CITraceError::Cancelled);
                };

                scan.dispatched += 1;
                let processor = self.processor.clone();
                let project = project_id.to_string();
                workers.spawn(async move {
                    let _permit = permit;
                    (pipeline_id, processor.process(&project, pipeline_id).await)
                });
            }

            flush(&cache, &seen);
        };

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((pipeline_id, outcome)) => {
                    if outcome == ProcessOutcome::Cancelled {
                        seen.remove(&pipeline_id);
                    }
                    scan.record(outcome);
                }
                Err(e) => error!("Pipeline worker of project {project_id} failed: {e}"),
            }
        }
        flush(&cache, &seen);

        listing.map(|()| scan)
    }
}

fn flush(cache: &PipelineCache, seen: &DedupSet) {
    if let Err(e) = cache.flush(seen) {
        warn!(
            "Error saving pipeline cache file={}: {e}",
            cache.path().display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{finished_job, finished_pipeline, FakeProvider};
    use crate::telemetry::testing::RecordingExporter;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn settings(cache_dir: &Path, projects: &[&str]) -> SyncSettings {
        SyncSettings {
            project_ids: projects.iter().map(|p| p.to_string()).collect(),
            cache_dir: cache_dir.to_path_buf(),
            interval: Duration::from_secs(900),
            lookback: chrono::Duration::days(14),
            max_retention: chrono::Duration::days(60),
            per_page: 2,
            concurrency: 4,
        }
    }

    fn daemon(
        provider: &Arc<FakeProvider>,
        settings: SyncSettings,
        shutdown: CancellationToken,
    ) -> (SyncDaemon, Arc<RecordingExporter>) {
        let exporter = Arc::new(RecordingExporter::default());
        let daemon = SyncDaemon::new(
            provider.clone(),
            Tracer::new(exporter.clone()),
            settings,
            shutdown,
        );
        (daemon, exporter)
    }

    fn pipeline_spans(exporter: &RecordingExporter) -> Vec<String> {
        let mut names: Vec<String> = exporter
            .spans()
            .into_iter()
            .map(|span| span.name)
            .filter(|name| name.starts_with("Pipeline"))
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_backfill_then_rerun_emits_nothing_new() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(
            FakeProvider::default()
                .with_pipeline("42", finished_pipeline(101))
                .with_pipeline("42", finished_pipeline(102))
                .with_pipeline("42", finished_pipeline(103))
                .with_jobs(102, vec![finished_job(1, "success")]),
        );
        let (daemon, exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["42"]),
            CancellationToken::new(),
        );

        let summary = daemon.sweep().await.unwrap();

        assert_eq!(summary.emitted, 3);
        assert_eq!(summary.failed_projects, 0);
        assert_eq!(
            pipeline_spans(&exporter),
            vec!["Pipeline 101", "Pipeline 102", "Pipeline 103"]
        );
        assert_eq!(exporter.spans().len(), 4);
        assert_eq!(provider.list_requests("42").len(), 2);

        let cache = PipelineCache::open(temp_dir.path(), "42").unwrap();
        assert_eq!(
            cache.load().unwrap(),
            [101, 102, 103].into_iter().collect::<DedupSet>()
        );

        let summary = daemon.sweep().await.unwrap();
        assert_eq!(summary.emitted, 0);
        assert_eq!(exporter.spans().len(), 4);
    }

    #[tokio::test]
    async fn test_rerun_scan_reports_cached_pipelines() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(
            FakeProvider::default()
                .with_pipeline("42", finished_pipeline(101))
                .with_pipeline("42", finished_pipeline(102)),
        );
        let (daemon, _exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["42"]),
            CancellationToken::new(),
        );

        daemon.scan_project("42").await.unwrap();
        let scan = daemon.scan_project("42").await.unwrap();

        assert_eq!(
            scan,
            ProjectScan {
                listed: 2,
                cached: 2,
                ..ProjectScan::default()
            }
        );
    }

    #[tokio::test]
    async fn test_listed_pages_reach_disk_before_the_next_page() {
        let temp_dir = TempDir::new().unwrap();
        let cache_file = temp_dir.path().join("42.txt");
        let snapshots = Arc::new(Mutex::new(Vec::new()));

        let provider = Arc::new(
            FakeProvider::default()
                .with_pipeline("42", finished_pipeline(101))
                .with_pipeline("42", finished_pipeline(102))
                .with_pipeline("42", finished_pipeline(103))
                .failing_listing_page("42", 2)
                .observe_listing({
                    let snapshots = Arc::clone(&snapshots);
                    move |_, page| {
                        let content = std::fs::read_to_string(&cache_file).unwrap_or_default();
                        snapshots.lock().unwrap().push((page.page, content));
                    }
                }),
        );
        let (daemon, exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["42"]),
            CancellationToken::new(),
        );

        let err = daemon.scan_project("42").await.unwrap_err();

        assert!(!err.is_fatal());
        assert_eq!(
            *snapshots.lock().unwrap(),
            vec![(1, String::new()), (2, "101\n102\n".to_string())]
        );
        assert_eq!(pipeline_spans(&exporter), vec!["Pipeline 101", "Pipeline 102"]);

        let cache = PipelineCache::open(temp_dir.path(), "42").unwrap();
        assert_eq!(
            cache.load().unwrap(),
            [101, 102].into_iter().collect::<DedupSet>()
        );
    }

    #[tokio::test]
    async fn test_corrupt_cache_line_does_not_block_the_project() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("42.txt"), b"101\n\xff\n").unwrap();

        let provider = Arc::new(
            FakeProvider::default()
                .with_pipeline("42", finished_pipeline(101))
                .with_pipeline("42", finished_pipeline(102)),
        );
        let (daemon, exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["42"]),
            CancellationToken::new(),
        );

        let summary = daemon.sweep().await.unwrap();

        assert_eq!(
            summary,
            SweepSummary {
                projects: 1,
                failed_projects: 0,
                emitted: 1,
            }
        );
        assert_eq!(pipeline_spans(&exporter), vec!["Pipeline 102"]);
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("42.txt")).unwrap(),
            "101\n102\n"
        );
    }

    #[tokio::test]
    async fn test_cold_cache_uses_retention_window() {
        let temp_dir = TempDir::new().unwrap();
        let provider =
            Arc::new(FakeProvider::default().with_pipeline("42", finished_pipeline(101)));
        let (daemon, _exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["42"]),
            CancellationToken::new(),
        );

        let before = Utc::now();
        daemon.sweep().await.unwrap();
        daemon.sweep().await.unwrap();
        let after = Utc::now();

        let requests = provider.list_requests("42");
        assert_eq!(requests.len(), 2);

        let (cold, _) = &requests[0];
        assert!(cold.updated_after >= before - chrono::Duration::days(60));
        assert!(cold.updated_after <= after - chrono::Duration::days(60));

        let (warm, _) = &requests[1];
        assert!(warm.updated_after >= before - chrono::Duration::days(14));
        assert!(warm.updated_after <= after - chrono::Duration::days(14));
    }

    #[tokio::test]
    async fn test_failing_project_does_not_stop_the_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(
            FakeProvider::default()
                .failing_listing("broken")
                .with_pipeline("42", finished_pipeline(101)),
        );
        let (daemon, exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["broken", "42"]),
            CancellationToken::new(),
        );

        let summary = daemon.sweep().await.unwrap();

        assert_eq!(
            summary,
            SweepSummary {
                projects: 2,
                failed_projects: 1,
                emitted: 1,
            }
        );
        assert_eq!(pipeline_spans(&exporter), vec!["Pipeline 101"]);
    }

    #[tokio::test]
    async fn test_unopenable_cache_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let not_a_dir = temp_dir.path().join("cache");
        std::fs::write(&not_a_dir, "").unwrap();

        let provider =
            Arc::new(FakeProvider::default().with_pipeline("42", finished_pipeline(101)));
        let (daemon, exporter) = daemon(
            &provider,
            settings(&not_a_dir, &["42"]),
            CancellationToken::new(),
        );

        let err = daemon.run().await.unwrap_err();

        assert!(err.is_fatal());
        assert!(exporter.spans().is_empty());
    }

    #[tokio::test]
    async fn test_unfinished_pipeline_stays_marked() {
        let temp_dir = TempDir::new().unwrap();
        let mut running = finished_pipeline(101);
        running.finished_at = None;
        let provider = Arc::new(FakeProvider::default().with_pipeline("42", running));
        let (daemon, exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["42"]),
            CancellationToken::new(),
        );

        let scan = daemon.scan_project("42").await.unwrap();

        assert_eq!(scan.unfinished, 1);
        assert!(exporter.spans().is_empty());
        let cache = PipelineCache::open(temp_dir.path(), "42").unwrap();
        assert!(cache.load().unwrap().contains(&101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let provider = (101..=108).fold(
            FakeProvider::default().with_fetch_delay(Duration::from_millis(10)),
            |provider, id| provider.with_pipeline("42", finished_pipeline(id)),
        );
        let provider = Arc::new(provider);

        let mut settings = settings(temp_dir.path(), &["42"]);
        settings.concurrency = 2;
        settings.per_page = 100;
        let (daemon, exporter) = daemon(&provider, settings, CancellationToken::new());

        let scan = daemon.scan_project("42").await.unwrap();

        assert_eq!(scan.emitted, 8);
        assert_eq!(pipeline_spans(&exporter).len(), 8);
        assert!(provider.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_daemon_exits_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let provider =
            Arc::new(FakeProvider::default().with_pipeline("42", finished_pipeline(101)));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (daemon, exporter) = daemon(&provider, settings(temp_dir.path(), &["42"]), shutdown);

        daemon.run().await.unwrap();

        assert!(provider.list_requests("42").is_empty());
        assert!(exporter.spans().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let temp_dir = TempDir::new().unwrap();
        let provider =
            Arc::new(FakeProvider::default().with_pipeline("42", finished_pipeline(101)));
        let shutdown = CancellationToken::new();
        let (daemon, exporter) = daemon(
            &provider,
            settings(temp_dir.path(), &["42"]),
            shutdown.clone(),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        });

        daemon.run().await.unwrap();
        canceller.await.unwrap();

        assert_eq!(provider.list_requests("42").len(), 1);
        assert_eq!(pipeline_spans(&exporter), vec!["Pipeline 101"]);
    }
}
