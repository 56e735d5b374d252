use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::Token;
use crate::config::{self, Config};
use crate::providers::GitLabClient;
use crate::ratelimit::RateLimiter;
use crate::sync::{PipelineCache, SyncDaemon};
use crate::telemetry::{OtlpExporter, Tracer};

#[derive(Parser)]
#[command(name = "citrace")]
#[command(author, version, about = "Backfills GitLab CI pipelines as traces", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./citrace.{toml,json,yaml,yml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync finished pipelines into the tracing backend
    Run(RunArgs),

    /// Forget which pipelines of a project were already exported
    ClearCache {
        #[arg(short = 'P', long)]
        project: String,

        #[arg(long, env = "CITRACE_CACHE_DIR")]
        cache_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Run a single sweep and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    #[arg(short, long, env = "GITLAB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(short, long, env = "GITLAB_URL")]
    url: Option<String>,

    /// Comma-separated project ids or paths
    #[arg(short = 'P', long, env = "GITLAB_PROJECT_IDS", value_delimiter = ',')]
    projects: Vec<String>,

    /// Maximum GitLab API calls per second
    #[arg(long, env = "GITLAB_RATE_LIMIT")]
    rate_limit: Option<u32>,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    endpoint: Option<String>,

    /// Export headers as key=value pairs separated by commas
    #[arg(long, env = "OTEL_EXPORTER_OTLP_HEADERS", hide_env_values = true)]
    headers: Option<String>,

    #[arg(long, env = "HONEYCOMB_API_KEY", hide_env_values = true)]
    honeycomb_api_key: Option<String>,

    #[arg(long, env = "HONEYCOMB_DATASET")]
    honeycomb_dataset: Option<String>,

    #[arg(long, env = "CITRACE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Seconds to sleep between sweeps
    #[arg(long, env = "CITRACE_SLEEP_INTERVAL")]
    interval: Option<u64>,
}

impl RunArgs {
    /// Applies command line and environment overrides on top of the file.
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(token) = &self.token {
            config.gitlab.token = Some(token.clone());
        }
        if let Some(url) = &self.url {
            config.gitlab.base_url = url.clone();
        }

        let projects: Vec<String> = self
            .projects
            .iter()
            .map(|project| project.trim().to_string())
            .filter(|project| !project.is_empty())
            .collect();
        if !projects.is_empty() {
            config.gitlab.project_ids = projects;
        }

        if let Some(rate_limit) = self.rate_limit {
            config.gitlab.rate_limit = rate_limit;
        }
        if let Some(endpoint) = &self.endpoint {
            config.exporter.endpoint = endpoint.clone();
        }
        if let Some(headers) = &self.headers {
            let headers = config::parse_headers(headers).context("Invalid export headers")?;
            config.exporter.headers.extend(headers);
        }
        if let Some(key) = &self.honeycomb_api_key {
            config
                .exporter
                .headers
                .insert("x-honeycomb-team".to_string(), key.clone());
        }
        if let Some(dataset) = &self.honeycomb_dataset {
            config
                .exporter
                .headers
                .insert("x-honeycomb-dataset".to_string(), dataset.clone());
        }
        if let Some(cache_dir) = &self.cache_dir {
            config.sync.cache_dir = Some(cache_dir.clone());
        }
        if let Some(interval) = self.interval {
            config.sync.interval_secs = interval;
        }

        Ok(())
    }
}

impl Cli {
    async fn execute_run(&self, args: &RunArgs) -> Result<()> {
        let mut config = Config::load(self.config.as_deref())?;
        args.apply(&mut config)?;
        config.validate()?;

        let settings = config.sync_settings()?;
        info!(
            "Syncing {} project(s) from {} every {}s",
            settings.project_ids.len(),
            config.gitlab.base_url,
            settings.interval.as_secs()
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(cancel_on_signal(shutdown.clone()));

        let limiter = if config.gitlab.rate_limit == 0 {
            warn!("GitLab API rate limiting disabled");
            RateLimiter::unlimited()
        } else {
            RateLimiter::new(config.gitlab.rate_limit)
        };
        let limiter = Arc::new(limiter);
        let token = config.gitlab.token.as_deref().map(Token::from);
        if token.is_none() {
            warn!("No GitLab token configured, only public projects are readable");
        }

        let client = GitLabClient::new(&config.gitlab.base_url, token, limiter)?
            .with_retry_policy(config.retry_policy())
            .with_shutdown(shutdown.clone());

        let exporter = OtlpExporter::start(config.otlp_settings())?;
        let tracer = Tracer::new(Arc::new(exporter));

        let daemon = SyncDaemon::new(Arc::new(client), tracer.clone(), settings, shutdown);

        let result = if args.once {
            daemon.sweep().await.map(|summary| {
                info!(
                    "Sweep finished projects={} failed={} emitted={}",
                    summary.projects, summary.failed_projects, summary.emitted
                );
            })
        } else {
            daemon.run().await
        };

        // Drain queued spans even when the sync failed
        info!("Flushing pending spans");
        if let Err(e) = tracer.shutdown().await {
            warn!("Error flushing spans: {e}");
        }

        result.context("Sync failed")
    }

    fn execute_clear_cache(&self, project: &str, cache_dir: &Option<PathBuf>) -> Result<()> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(cache_dir) = cache_dir {
            config.sync.cache_dir = Some(cache_dir.clone());
        }

        PipelineCache::clear(&config.sync.cache_dir()?, project)?;

        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Run(args) => self.execute_run(args).await,
            Commands::ClearCache { project, cache_dir } => {
                self.execute_clear_cache(project, cache_dir)
            }
        }
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested, finishing in-flight work");
    shutdown.cancel();
}
