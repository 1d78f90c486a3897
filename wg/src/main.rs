//! WorkGate - admission control for shared upstream quotas
//!
//! CLI entry point for inspecting queue state, cancelling jobs, and
//! reading bucket levels from the shared store.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use gatestore::{JobState, RedisStore, Store, now_ms};
use workgate::cli::{Cli, Command, OutputFormat};
use workgate::config::Config;
use workgate::events::{WgEvent, read_event_log};
use workgate::limiter::QuotaKey;
use workgate::queue::{HandlerRegistry, WorkQueue};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Logging is not initialized yet; nothing in here can log
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("workgate")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Level priority: CLI --log-level > config file > INFO
    let level = if let Some(s) = cli_log_level.or(config_log_level) {
        match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        }
    } else {
        tracing::Level::INFO
    };

    let log_file = fs::File::create(log_dir.join("wg.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate()?;

    info!("WorkGate loaded config: prefix={}", config.store.prefix);

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Status { format }) => {
            debug!(?format, "main: matched Status command");
            cmd_status(&config, format).await
        }
        Some(Command::Jobs { ids, format }) => {
            debug!(count = ids.len(), ?format, "main: matched Jobs command");
            cmd_jobs(&config, &ids, format).await
        }
        Some(Command::Cancel { ids, format }) => {
            debug!(count = ids.len(), ?format, "main: matched Cancel command");
            cmd_cancel(&config, &ids, format).await
        }
        Some(Command::Buckets { key, format }) => {
            debug!(?key, ?format, "main: matched Buckets command");
            cmd_buckets(&config, key.as_deref(), format).await
        }
        Some(Command::Purge) => {
            debug!("main: matched Purge command");
            cmd_purge(&config).await
        }
        Some(Command::Events { job, lines, format }) => {
            debug!(?job, lines, ?format, "main: matched Events command");
            cmd_events(&config, job.as_deref(), lines, format).await
        }
        None => {
            debug!("main: no command specified, showing status");
            cmd_status(&config, OutputFormat::Text).await
        }
    }
}

/// Connect to the shared store and wrap it in a queue client
///
/// CLI invocations only inspect and cancel; the empty registry means no
/// worker loop ever claims from this process.
fn open_queue(config: &Config) -> Result<WorkQueue> {
    let store = RedisStore::new(&config.store.resolved_url(), config.store.prefix.clone())?;
    let bus = workgate::events::create_event_bus();
    Ok(WorkQueue::new(
        Arc::new(store),
        config.queue.clone(),
        HandlerRegistry::new(),
        bus.emitter_for("cli"),
    ))
}

/// Show queue counters for every job kind
async fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_status: called");
    let queue = open_queue(config)?;
    let report = queue.queue_status().await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!("WorkGate Queue");
            println!("--------------");
            for (kind, status) in &report.types {
                println!(
                    "{:<12} queued {:>5}  running {:>5}  completed {:>7}  failed {:>5}  total {:>7}",
                    kind, status.queued, status.running, status.completed, status.failed, status.total
                );
            }
            println!();
            println!(
                "Totals: {} queued, {} running, {} completed, {} failed",
                report.stats.total_queued,
                report.stats.total_running,
                report.stats.total_completed,
                report.stats.total_failed
            );
            if report.degraded {
                println!();
                println!(
                    "{}",
                    "Shared store unreachable: counters reflect this process's local view".red()
                );
            }
        }
    }

    Ok(())
}

/// Look up jobs by ID
async fn cmd_jobs(config: &Config, ids: &[String], format: OutputFormat) -> Result<()> {
    debug!(count = ids.len(), ?format, "cmd_jobs: called");
    let queue = open_queue(config)?;
    let report = queue.status(ids).await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            for job in &report.jobs {
                let duration = match (job.started_at, job.completed_at) {
                    (Some(start), Some(end)) => format!("  {}ms", end.saturating_sub(start)),
                    _ => String::new(),
                };
                println!(
                    "{}  {:<12} {}  band {}{}",
                    job.id,
                    job.kind,
                    paint_state(job.state),
                    job.priority,
                    duration
                );
                if let Some(error) = &job.error {
                    println!("    error: {}", error.red());
                }
            }
            if !report.jobs.is_empty() {
                println!();
            }
            let s = &report.summary;
            println!(
                "Summary: {} queued, {} running, {} completed, {} failed, {} cancelled, {} not found",
                s.queued, s.running, s.completed, s.failed, s.cancelled, s.not_found
            );
        }
    }

    Ok(())
}

/// Cancel queued jobs
async fn cmd_cancel(config: &Config, ids: &[String], format: OutputFormat) -> Result<()> {
    debug!(count = ids.len(), ?format, "cmd_cancel: called");
    let queue = open_queue(config)?;
    let report = queue.cancel(ids).await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            for result in &report.results {
                if result.cancelled {
                    println!("{}  {}", result.id, "cancelled".green());
                } else {
                    println!("{}  {}", result.id, "not cancelled (running, finished, or unknown)".yellow());
                }
            }
            println!();
            println!("Cancelled {} of {}", report.cancelled, report.total);
        }
    }

    Ok(())
}

/// Show token bucket levels for configured quotas
async fn cmd_buckets(config: &Config, key_filter: Option<&str>, format: OutputFormat) -> Result<()> {
    debug!(?key_filter, ?format, "cmd_buckets: called");
    let store = RedisStore::new(&config.store.resolved_url(), config.store.prefix.clone())?;

    if config.quotas.is_empty() {
        println!("No quotas configured");
        return Ok(());
    }

    let mut rows = Vec::new();
    for (key_str, spec) in config.quotas.iter() {
        if let Some(filter) = key_filter {
            if filter != key_str {
                continue;
            }
        }
        let quota_key: QuotaKey = match key_str.parse() {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %key_str, error = %e, "cmd_buckets: skipping malformed quota key");
                continue;
            }
        };
        // Cost is irrelevant for peeking; takes() is only used for the
        // bucket keys and their params
        for take in spec.takes(&quota_key, 0.0) {
            let tokens = match store.peek_bucket(&take.key).await? {
                Some(mut bucket) => {
                    // Stored levels are stale by up to one refill interval;
                    // catch the copy up to now for display
                    bucket.refill(&take.params, now_ms());
                    bucket.tokens
                }
                // Never touched means never drained
                None => take.params.capacity,
            };
            rows.push((take.key, tokens, take.params));
        }
    }

    match format {
        OutputFormat::Json => {
            let buckets: Vec<serde_json::Value> = rows
                .iter()
                .map(|(key, tokens, params)| {
                    serde_json::json!({
                        "key": key,
                        "tokens": tokens,
                        "capacity": params.capacity,
                        "refill_per_sec": params.refill_per_sec,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&buckets)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            if rows.is_empty() {
                println!("No buckets match");
                return Ok(());
            }
            for (key, tokens, params) in &rows {
                let fraction = if params.capacity > 0.0 {
                    tokens / params.capacity
                } else {
                    0.0
                };
                let level = format!("{:>8.1} / {:<8.1}", tokens, params.capacity);
                let level = if fraction < 0.1 {
                    level.red().to_string()
                } else if fraction < 0.5 {
                    level.yellow().to_string()
                } else {
                    level.normal().to_string()
                };
                println!(
                    "{:<40} {}  (+{:.2}/s)",
                    key, level, params.refill_per_sec
                );
            }
        }
    }

    Ok(())
}

/// Drop job records past their retention deadline
async fn cmd_purge(config: &Config) -> Result<()> {
    debug!("cmd_purge: called");
    let queue = open_queue(config)?;
    let purged = queue.purge_expired().await?;
    println!("Purged {} expired job record(s)", purged);
    Ok(())
}

/// Show recent entries from the shared event log
async fn cmd_events(config: &Config, job_filter: Option<&str>, lines: usize, format: OutputFormat) -> Result<()> {
    debug!(?job_filter, lines, ?format, "cmd_events: called");

    let Some(path) = &config.event_log else {
        println!("No event log configured (set event-log in the config file)");
        return Ok(());
    };

    let entries = read_event_log(path)?;
    let filtered: Vec<_> = entries
        .iter()
        .filter(|entry| match job_filter {
            Some(job) => entry.event.job_id() == Some(job),
            None => true,
        })
        .collect();
    let start = filtered.len().saturating_sub(lines);
    let tail = &filtered[start..];

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&tail)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            if tail.is_empty() {
                println!("No events");
                return Ok(());
            }
            for entry in tail {
                println!(
                    "{}  {:<14} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    paint_event_type(&entry.event),
                    describe_event(&entry.event)
                );
            }
        }
    }

    Ok(())
}

/// Color a job state for terminal output; padding happens before painting
/// because escape codes break format-width counting
fn paint_state(state: JobState) -> String {
    let padded = format!("{:<9}", state.to_string());
    match state {
        JobState::Queued => padded.yellow(),
        JobState::Running => padded.cyan(),
        JobState::Completed => padded.green(),
        JobState::Failed => padded.red(),
        JobState::Cancelled => padded.dimmed(),
    }
    .to_string()
}

fn paint_event_type(event: &WgEvent) -> String {
    let padded = format!("{:<14}", event.event_type());
    match event {
        WgEvent::JobCompleted { .. } | WgEvent::StoreRecovered { .. } => padded.green(),
        WgEvent::JobFailed { .. } | WgEvent::StoreDegraded { .. } => padded.red(),
        WgEvent::JobCancelled { .. } => padded.dimmed(),
        _ => padded.normal(),
    }
    .to_string()
}

/// One human-readable line per event variant
fn describe_event(event: &WgEvent) -> String {
    match event {
        WgEvent::JobQueued { job_id, kind, priority } => {
            format!("{} {} queued at {} priority", kind, job_id, priority)
        }
        WgEvent::JobStarted { job_id, kind } => format!("{} {} started", kind, job_id),
        WgEvent::JobCompleted { job_id, kind, duration_ms } => {
            format!("{} {} completed in {}ms", kind, job_id, duration_ms)
        }
        WgEvent::JobFailed { job_id, kind, error } => format!("{} {} failed: {}", kind, job_id, error),
        WgEvent::JobCancelled { job_id, kind } => format!("{} {} cancelled", kind, job_id),
        WgEvent::StoreDegraded { component, reason } => {
            format!("{} lost the shared store: {}", component, reason)
        }
        WgEvent::StoreRecovered { component } => format!("{} reached the shared store again", component),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_event_covers_lifecycle() {
        let event = WgEvent::JobQueued {
            job_id: "job-1".to_string(),
            kind: "analysis".to_string(),
            priority: "high".to_string(),
        };
        assert_eq!(describe_event(&event), "analysis job-1 queued at high priority");

        let event = WgEvent::StoreDegraded {
            component: "queue".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(describe_event(&event), "queue lost the shared store: connection refused");
    }

    #[test]
    fn test_paint_state_pads_before_painting() {
        // Strip-ANSI is overkill here; with colors forced off the padded
        // label must come through verbatim
        colored::control::set_override(false);
        assert_eq!(paint_state(JobState::Queued), "queued   ");
        assert_eq!(paint_state(JobState::Completed), "completed");
        colored::control::unset_override();
    }
}
