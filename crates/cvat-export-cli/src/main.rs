// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

use clap::{Parser, Subcommand};
use cvat_export::{
    Batch, Client, Error, ExportConfig, ExportFormat, ExportOrchestrator, ExportReport, OutputLayout,
    Progress, TaskId, TaskIndex, task_index,
};
use log::{info, warn};
use std::{path::PathBuf, process::ExitCode, str::FromStr, sync::Arc};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CVAT server URL
    #[clap(long, env = "CVAT_SERVER")]
    server: Option<String>,

    /// CVAT username
    #[clap(long, env = "CVAT_USERNAME")]
    username: Option<String>,

    /// CVAT password
    #[clap(long, env = "CVAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// CVAT API token, used when no username and password are given
    #[clap(long, env = "CVAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Organization slug scoping every request
    #[clap(long, env = "CVAT_ORG")]
    org: Option<String>,

    /// Client Command
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Returns the CVAT server version.
    Version,
    /// List the ids of every task visible to the user.  With --batch-size
    /// the ids are split into batches, one batch per line.
    Tasks {
        /// Number of ids per batch, all ids on one line if omitted
        #[clap(long)]
        batch_size: Option<usize>,

        /// Write the batches to this file instead of stdout
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
    /// Export tasks to the local filesystem.  Tasks are taken from the
    /// command line, from --from-file, or from the server's task list when
    /// neither is given.  Exits with a failure status if any task failed;
    /// the failed ids are appended to the error log.
    Export {
        /// Task IDs
        ids: Vec<String>,

        /// Read task ids from a batch file or error log
        #[clap(long)]
        from_file: Option<PathBuf>,

        /// Annotation format (coco or yolo)
        #[clap(long)]
        format: Option<String>,

        /// Also export the task images
        #[clap(long)]
        images: bool,

        /// Output directory receiving one task_<id> folder per task
        #[clap(long, short)]
        output: Option<PathBuf>,

        /// Number of concurrent exports
        #[clap(long)]
        workers: Option<usize>,

        /// File receiving the ids of failed tasks
        #[clap(long)]
        error_log: Option<PathBuf>,

        /// Maximum number of export requests per task
        #[clap(long)]
        max_attempts: Option<u32>,

        /// Milliseconds between export requests of the same task
        #[clap(long)]
        interval_ms: Option<u64>,

        /// Keep the folder structure of the archive instead of flattening it
        #[clap(long)]
        nested: bool,

        /// Configuration file, defaults to the per-user config.toml
        #[clap(long)]
        config: Option<PathBuf>,
    },
    /// Print the ids of ALL that are not in DONE.  Both files may contain
    /// ids in any layout (batch files, error logs, directory listings).
    Remaining {
        /// File with every task id
        all: PathBuf,

        /// File with the ids already exported
        done: PathBuf,

        /// Write the remaining ids to this file instead of stdout
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
}

async fn connect(args: &Args) -> Result<Client, Error> {
    let client = Client::new()?;
    let client = match &args.server {
        Some(server) => client.with_server(server)?,
        None => client,
    };

    let client = match (&args.username, &args.password) {
        (Some(username), Some(password)) => client.with_login(username, password).await?,
        _ => match &args.token {
            Some(token) => client.with_token(token)?,
            _ => client,
        },
    };

    Ok(match &args.org {
        Some(org) => client.with_organization(org),
        None => client,
    })
}

// Command handler functions

async fn handle_version(client: &Client) -> Result<(), Error> {
    let version = client.version().await?;
    println!(
        "CVAT Server [{}]: {} Client: {}",
        client.url(),
        version,
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

async fn handle_tasks(
    client: Client,
    batch_size: Option<usize>,
    output: Option<PathBuf>,
) -> Result<(), Error> {
    let ids = TaskIndex::new(Arc::new(client)).list_all().await?;
    info!("found {} tasks", ids.len());

    let batches = task_index::batch(&ids, batch_size.unwrap_or(ids.len().max(1)))?;
    match output {
        Some(path) => {
            task_index::persist(&batches, &path)?;
            info!("wrote {} batches to {:?}", batches.len(), path);
        }
        None => {
            for batch in batches {
                println!("{}", batch);
            }
        }
    }
    Ok(())
}

struct ExportArgs {
    ids: Vec<String>,
    from_file: Option<PathBuf>,
    format: Option<String>,
    images: bool,
    output: Option<PathBuf>,
    workers: Option<usize>,
    error_log: Option<PathBuf>,
    max_attempts: Option<u32>,
    interval_ms: Option<u64>,
    nested: bool,
    config: Option<PathBuf>,
}

/// Layers the command line flags over the loaded configuration.
fn export_config(export: &ExportArgs) -> Result<ExportConfig, Error> {
    let mut config = ExportConfig::load(export.config.as_deref())?;

    if let Some(format) = &export.format {
        config.format = ExportFormat::from_str(format)?;
    }
    if export.images {
        config.include_images = true;
    }
    if let Some(output) = &export.output {
        config.output_dir = output.clone();
    }
    if let Some(workers) = export.workers {
        config.workers = workers;
    }
    if let Some(error_log) = &export.error_log {
        config.error_log = error_log.clone();
    }
    if let Some(max_attempts) = export.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(interval_ms) = export.interval_ms {
        config.poll_interval_ms = interval_ms;
    }
    if export.nested {
        config.layout = OutputLayout::Nested;
    }

    config.validate()?;
    Ok(config)
}

async fn handle_export(args: &Args, export: ExportArgs) -> Result<ExitCode, Error> {
    use indicatif::{ProgressBar, ProgressStyle};
    use tokio::sync::mpsc;

    let config = export_config(&export)?;

    let mut ids = export
        .ids
        .iter()
        .map(|id| TaskId::from_str(id))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(path) = &export.from_file {
        ids.extend(task_index::restore(path)?);
    }

    let client = Arc::new(connect(args).await?);
    if ids.is_empty() && export.from_file.is_none() {
        info!("no task ids given, exporting every task");
        ids = TaskIndex::new(client.clone()).list_all().await?;
    }
    if ids.is_empty() {
        warn!("nothing to export");
        return Ok(ExitCode::SUCCESS);
    }

    let bar = ProgressBar::new(ids.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise} ETA: {eta}] {msg}: {wide_bar:.yellow} {human_pos}/{human_len}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▇▆▅▄▃▂▁  "),
    );
    bar.set_message("Exporting");

    let (tx, mut rx) = mpsc::channel::<Progress>(1);
    let progress_bar = bar.clone();
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            if progress.total > 0 {
                progress_bar.set_length(progress.total as u64);
                progress_bar.set_position(progress.current as u64);
            }
        }
    });

    let orchestrator = ExportOrchestrator::new(client, config)?.with_progress(tx);

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remaining exports");
            cancel.cancel();
        }
    });

    orchestrator.submit(ids);
    let error_log = orchestrator.error_log_path().to_path_buf();
    let report = orchestrator.shutdown().await?;
    bar.finish_and_clear();

    print_report(&report);
    if report.is_success() {
        return Ok(ExitCode::SUCCESS);
    }

    match &report.error_log_failure {
        Some(err) => eprintln!(
            "Failed task ids could not be written to {}: {}",
            error_log.display(),
            err
        ),
        None => eprintln!("Failed task ids were appended to {}", error_log.display()),
    }
    Ok(ExitCode::FAILURE)
}

fn print_report(report: &ExportReport) {
    for task in &report.failed {
        println!(
            "task {} failed ({:?}): {}",
            task.task_id, task.state, task.reason
        );
    }

    let elapsed = report.finished_at - report.started_at;
    println!(
        "Exported {} of {} tasks in {:.1}s, {} failed",
        report.succeeded.len(),
        report.total(),
        elapsed.num_milliseconds() as f64 / 1000.0,
        report.failed.len()
    );
}

fn handle_remaining(all: PathBuf, done: PathBuf, output: Option<PathBuf>) -> Result<(), Error> {
    let all = task_index::extract_ids(&std::fs::read_to_string(all)?);
    let done = task_index::extract_ids(&std::fs::read_to_string(done)?);
    let remaining = task_index::subtract(&all, &done);

    match output {
        Some(path) => {
            task_index::persist(&[Batch::from(remaining)], &path)?;
        }
        None => {
            for id in remaining {
                println!("{}", id);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.cmd.clone() {
        Command::Version => {
            let client = connect(&args).await?;
            handle_version(&client).await?;
        }
        Command::Tasks { batch_size, output } => {
            let client = connect(&args).await?;
            handle_tasks(client, batch_size, output).await?;
        }
        Command::Export {
            ids,
            from_file,
            format,
            images,
            output,
            workers,
            error_log,
            max_attempts,
            interval_ms,
            nested,
            config,
        } => {
            let export = ExportArgs {
                ids,
                from_file,
                format,
                images,
                output,
                workers,
                error_log,
                max_attempts,
                interval_ms,
                nested,
                config,
            };
            return handle_export(&args, export).await;
        }
        Command::Remaining { all, done, output } => handle_remaining(all, done, output)?,
    }

    Ok(ExitCode::SUCCESS)
}
