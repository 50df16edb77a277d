//! # CLI Module
//!
//! Command-line interface for the media pipeline.
//!
//! ## Usage
//! ```bash
//! # Walk folders and store what was found
//! media-pipeline scan ~/Photos
//!
//! # Run one storage-driven batch of a stage
//! media-pipeline run hash --limit 200 --concurrency 8
//!
//! # Queue-driven processing
//! media-pipeline enqueue exif
//! media-pipeline work exif --until-idle
//!
//! # Inspect and administer queues
//! media-pipeline counts
//! media-pipeline reset thumbnail failed
//! media-pipeline audit thumbnail --output json
//!
//! # Duplicates
//! media-pipeline dedup --input request.json
//! media-pipeline resolve-identical --dry-run
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use media_pipeline::config::PipelineConfig;
use media_pipeline::core::audit::AuditReport;
use media_pipeline::core::cluster::rpc::{process_duplicates, ProcessDuplicatesRequest};
use media_pipeline::core::cluster::ClusterResult;
use media_pipeline::core::media::{MediaId, Stage};
use media_pipeline::core::queue::{JobState, QueueCounts};
use media_pipeline::core::stage::BatchSummary;
use media_pipeline::core::worker::{CancelToken, WorkerReport};
use media_pipeline::core::PipelineContext;
use media_pipeline::error::{ConfigError, PipelineError, Result};
use media_pipeline::events::{Event, EventChannel, EventReceiver, StageEvent};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Media Pipeline - staged ingest with duplicate detection
#[derive(Parser, Debug)]
#[command(name = "media-pipeline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Walk folders and store the media files found
    Scan {
        /// Folders to scan (defaults to the configured roots)
        roots: Vec<PathBuf>,
    },
    /// Process one batch of eligible items straight from the store
    Run {
        stage: Stage,
        /// Items to select (defaults to the stage batch size)
        #[arg(short, long)]
        limit: Option<usize>,
        /// Parallel workers (defaults to the stage concurrency)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },
    /// Queue jobs for eligible items (or the scan roots)
    Enqueue {
        stage: Stage,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Consume a stage queue, feeding the next stage
    Work {
        stage: Stage,
        /// Stop once nothing can be leased
        #[arg(long)]
        until_idle: bool,
    },
    /// Jobs per state
    Counts {
        /// Single stage (defaults to all)
        stage: Option<Stage>,
    },
    /// Remove every job of a stage in one state
    Reset { stage: Stage, state: JobState },
    /// Remove every waiting and delayed job of a stage
    Drain { stage: Stage },
    /// Stop leasing jobs of a stage
    Pause { stage: Stage },
    /// Resume leasing jobs of a stage
    Resume { stage: Stage },
    /// Compare recent job outcomes with the stored items
    Audit { stage: Stage },
    /// Cluster duplicates from the store, or from a JSON request
    Dedup {
        /// Request file (`-` for stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Override the maximum Hamming distance
        #[arg(short, long)]
        max_distance: Option<u32>,
    },
    /// Soft-delete the losing copy of identical pairs
    ResolveIdentical {
        /// Show the plan without changing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with colors
    Pretty,
    /// JSON output for scripting
    Json,
}

/// Run the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    media_pipeline::init_tracing(cli.verbose);

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Commands::Scan { roots } = &cli.command {
        if !roots.is_empty() {
            config.scan_roots = roots.clone();
        }
    }
    if let Commands::Dedup {
        max_distance: Some(distance),
        ..
    } = &cli.command
    {
        config.dedup.max_hamming_distance = *distance;
    }

    let output = cli.output;
    let term = Term::stderr();

    match cli.command {
        Commands::Dedup {
            input: Some(input),
            max_distance,
        } => run_dedup_request(&config, &input, max_distance),
        command => {
            let (sender, receiver) = EventChannel::new();
            let context = PipelineContext::open(config)?.with_events(sender);
            let progress = (output == OutputFormat::Pretty).then(spinner);
            let events = spawn_event_renderer(receiver, progress.clone());

            let result = dispatch(&context, command, output, &term);

            drop(context);
            events.join().ok();
            result
        }
    }
}

fn dispatch(
    context: &PipelineContext,
    command: Commands,
    output: OutputFormat,
    term: &Term,
) -> Result<()> {
    match command {
        Commands::Scan { .. } => {
            if context.config.scan_roots.is_empty() {
                return Err(ConfigError::Invalid("no folders to scan".to_string()).into());
            }
            let runner = context.runner(Stage::Scan)?;
            let summary = runner.run_batch(
                context.config.scan_roots.len(),
                context.config.stage(Stage::Scan).concurrency,
                &CancelToken::new(),
            )?;
            print_summary(term, output, &summary);
        }
        Commands::Run {
            stage,
            limit,
            concurrency,
        } => {
            let settings = context.config.stage(stage);
            let summary = context.runner(stage)?.run_batch(
                limit.unwrap_or(settings.batch_size),
                concurrency.unwrap_or(settings.concurrency),
                &CancelToken::new(),
            )?;
            print_summary(term, output, &summary);
        }
        Commands::Enqueue { stage, limit } => {
            let limit = limit.unwrap_or(context.config.stage(stage).batch_size);
            let jobs = context.enqueue(stage, limit)?;
            print_value(term, output, &serde_json::json!({ "stage": stage, "jobs": jobs }), || {
                format!("{} {} jobs queued", style(jobs).cyan(), stage)
            });
        }
        Commands::Work { stage, until_idle } => {
            let worker = context.worker(stage)?.until_idle(until_idle);
            let report = worker.run(&CancelToken::new())?;
            print_worker_report(term, output, stage, &report);
        }
        Commands::Counts { stage } => {
            let stages = match stage {
                Some(stage) => vec![stage],
                None => Stage::ALL.to_vec(),
            };
            let mut counts = Vec::with_capacity(stages.len());
            for stage in stages {
                counts.push((stage, context.queue(stage)?.counts()?));
            }
            print_counts(term, output, &counts);
        }
        Commands::Reset { stage, state } => {
            let removed = context.reset(stage, state)?;
            print_value(
                term,
                output,
                &serde_json::json!({ "stage": stage, "state": state, "removed": removed }),
                || format!("Removed {} {} jobs from {}", style(removed).cyan(), state, stage),
            );
        }
        Commands::Drain { stage } => {
            let removed = context.drain(stage)?;
            print_value(
                term,
                output,
                &serde_json::json!({ "stage": stage, "removed": removed }),
                || format!("Drained {} jobs from {}", style(removed).cyan(), stage),
            );
        }
        Commands::Pause { stage } => {
            context.pause(stage)?;
            print_value(term, output, &serde_json::json!({ "stage": stage, "paused": true }), || {
                format!("{} paused", stage)
            });
        }
        Commands::Resume { stage } => {
            context.resume(stage)?;
            print_value(term, output, &serde_json::json!({ "stage": stage, "paused": false }), || {
                format!("{} resumed", stage)
            });
        }
        Commands::Audit { stage } => {
            let report = context.auditor().audit(stage)?;
            print_audit(term, output, &report);
        }
        Commands::Dedup { .. } => {
            let result = context.cluster_store()?;
            print_clusters(term, output, &result);
        }
        Commands::ResolveIdentical { dry_run } => {
            let plan = context.resolve_identical(dry_run)?;
            match output {
                OutputFormat::Json => print_json(&plan),
                OutputFormat::Pretty => {
                    let verb = if dry_run { "Would discard" } else { "Discarded" };
                    write(term, &format!("{} {} items", verb, style(plan.choices.len()).cyan()));
                    for choice in &plan.choices {
                        write(
                            term,
                            &format!(
                                "  {} {} ({})",
                                style("✗").red(),
                                choice.discard,
                                style(choice.rule).dim()
                            ),
                        );
                    }
                    write(
                        term,
                        &format!("  {} undecided, {} skipped", plan.undecided, plan.skipped),
                    );
                }
            }
        }
    }
    Ok(())
}

/// Cluster a JSON request without touching the store. The request's own
/// distance applies unless `--max-distance` is given.
fn run_dedup_request(config: &PipelineConfig, input: &Path, max_distance: Option<u32>) -> Result<()> {
    let content = if input == Path::new("-") {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|source| ConfigError::Read {
                path: input.to_path_buf(),
                source,
            })?;
        content
    } else {
        std::fs::read_to_string(input).map_err(|source| ConfigError::Read {
            path: input.to_path_buf(),
            source,
        })?
    };

    let mut request: ProcessDuplicatesRequest = serde_json::from_str(&content)
        .map_err(|e| PipelineError::InvalidRequest(format!("malformed request: {}", e)))?;
    if let Some(distance) = max_distance {
        request.max_hamming_distance = distance;
    }

    let response = process_duplicates(&request, config.dedup.thresholds()?);
    print_json(&response);
    Ok(())
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Render progress events until every sender is dropped
fn spawn_event_renderer(
    receiver: EventReceiver,
    progress: Option<ProgressBar>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in receiver.iter() {
            let Some(pb) = &progress else { continue };
            match event {
                Event::Stage(StageEvent::ScanProgress(p)) => pb.set_message(format!(
                    "{}: {} files in {} folders",
                    p.root.display(),
                    p.files_found,
                    p.directories_scanned
                )),
                Event::Stage(StageEvent::BatchStarted { stage, items }) => {
                    pb.set_message(format!("{}: processing {} items", stage, items))
                }
                Event::Stage(StageEvent::ItemFailed {
                    stage,
                    message,
                    retryable,
                    ..
                }) => pb.println(format!(
                    "  {} {}: {}{}",
                    style("!").yellow(),
                    stage,
                    message,
                    if retryable { " (will retry)" } else { "" }
                )),
                Event::Stage(StageEvent::BatchAborted { stage, message }) => {
                    pb.println(format!("  {} {} batch aborted: {}", style("✗").red(), stage, message))
                }
                _ => {}
            }
        }
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
    })
}

fn write(term: &Term, line: &str) {
    term.write_line(line).ok();
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to serialise output: {}", e),
    }
}

fn print_value(term: &Term, output: OutputFormat, json: &serde_json::Value, pretty: impl Fn() -> String) {
    match output {
        OutputFormat::Json => print_json(json),
        OutputFormat::Pretty => write(term, &pretty()),
    }
}

fn print_summary(term: &Term, output: OutputFormat, summary: &BatchSummary) {
    if output == OutputFormat::Json {
        return print_json(summary);
    }
    write(
        term,
        &format!(
            "{} {} batch complete",
            style("✓").green().bold(),
            style(summary.stage).bold()
        ),
    );
    write(term, &format!("  {} processed", style(summary.processed).cyan()));
    write(term, &format!("  {} failed", style(summary.failed).red()));
    if summary.skipped > 0 {
        write(term, &format!("  {} skipped", style(summary.skipped).dim()));
    }
    write(
        term,
        &format!(
            "  {} total, {} store writes",
            summary.total,
            style(summary.writes).dim()
        ),
    );
}

fn print_worker_report(term: &Term, output: OutputFormat, stage: Stage, report: &WorkerReport) {
    if output == OutputFormat::Json {
        return print_json(report);
    }
    write(
        term,
        &format!(
            "{} {} worker finished after {} batches",
            style("✓").green().bold(),
            style(stage).bold(),
            report.batches
        ),
    );
    write(
        term,
        &format!(
            "  {} processed, {} failed, {} skipped, {} forwarded",
            style(report.processed).cyan(),
            style(report.failed).red(),
            report.skipped,
            report.forwarded
        ),
    );
}

fn print_counts(term: &Term, output: OutputFormat, counts: &[(Stage, QueueCounts)]) {
    if output == OutputFormat::Json {
        let map: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(stage, c)| (stage.to_string(), serde_json::json!(c)))
            .collect();
        return print_json(&map);
    }
    write(
        term,
        &format!(
            "{}",
            style(format!(
                "{:<12} {:>8} {:>8} {:>8} {:>10} {:>8} {:>8}",
                "queue", "waiting", "active", "delayed", "completed", "failed", "paused"
            ))
            .bold()
        ),
    );
    for (stage, c) in counts {
        write(
            term,
            &format!(
                "{:<12} {:>8} {:>8} {:>8} {:>10} {:>8} {:>8}",
                stage.as_str(),
                c.waiting,
                c.active,
                c.delayed,
                c.completed,
                c.failed,
                c.paused
            ),
        );
    }
}

fn print_audit(term: &Term, output: OutputFormat, report: &AuditReport) {
    if output == OutputFormat::Json {
        return print_json(report);
    }
    let mark = if report.is_consistent() {
        style("✓").green().bold()
    } else {
        style("!").yellow().bold()
    };
    write(
        term,
        &format!(
            "{} {} audit: {} mismatches in {} sampled jobs",
            mark,
            style(report.stage).bold(),
            report.total_mismatches,
            report.sampled
        ),
    );
    for m in &report.completed_but_missing_effect {
        write(term, &format!("  completed, no effect: {} ({})", m.media_id, m.reason));
    }
    for m in &report.failed_but_has_effect {
        write(term, &format!("  failed, has effect:   {} ({})", m.media_id, m.reason));
    }
}

fn print_clusters(term: &Term, output: OutputFormat, result: &ClusterResult<MediaId>) {
    if output == OutputFormat::Json {
        return print_json(result);
    }
    write(
        term,
        &format!(
            "{} exact groups, {} near groups",
            style(result.exact_groups.len()).cyan(),
            style(result.near_groups.len()).cyan()
        ),
    );
    for (i, group) in result.sorted_groups().iter().enumerate() {
        write(
            term,
            &format!(
                "  {} {:?} {} items, distance {}-{} ({})",
                style(format!("Group {}:", i + 1)).bold(),
                group.kind,
                group.len(),
                group.min_distance,
                group.max_distance,
                style(group.tier).yellow()
            ),
        );
        for member in &group.members {
            write(term, &format!("    {} {}", style("○").dim(), member));
        }
    }
    if result.skipped_comparisons > 0 {
        write(
            term,
            &format!(
                "  {} comparisons skipped (fingerprint length mismatch)",
                style(result.skipped_comparisons).dim()
            ),
        );
    }
}
