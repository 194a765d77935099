//! Tree Uploader CLI
//!
//! Inventories a directory tree in parallel and optionally uploads it.

use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tree_uploader::config::{DEFAULT_CONCURRENCY, DEFAULT_ITEM_TIMEOUT_MS, DEFAULT_ROUND_TIMEOUT_MS};
use tree_uploader::{
    CommandTransfer, JsonLinesReporter, LocalDirTransfer, LocalFs, NullSink, Pipeline,
    ProgressSink, RunConfig, RunSummary, TransferCapability, TransferMode, UnitStatus,
};

const ABOUT: &str = r#"
Tree Uploader - parallel directory inventory and upload

Examples:
  tree_uploader scan -r /data/photos                          inventory only
  tree_uploader scan -r /data/photos --json                   JSON summary
  tree_uploader upload -r /data/photos -D /mnt/backup         mirror into a local directory
  tree_uploader upload -r /data -D remote:bucket --backend rclone --mode folders
  tree_uploader upload -r /data -D remote:bucket --backend rclone -d runs.db --resume
"#;

/// Parallel directory inventory and upload
#[derive(Parser)]
#[command(name = "tree_uploader")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Files,
    Folders,
}

impl From<ModeArg> for TransferMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Files => TransferMode::Files,
            ModeArg::Folders => TransferMode::Folders,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Copy into a local directory
    Local,
    /// Run `rclone copyto` per unit
    Rclone,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Root directory to inventory
    #[arg(short = 'r', long)]
    root: PathBuf,

    /// Walker threads (0 = auto)
    #[arg(short = 't', long, default_value = "0")]
    workers: usize,

    /// Inventory database file
    #[arg(short = 'd', long)]
    db: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Write JSON progress lines to stderr
    #[arg(long)]
    progress: bool,

    /// Minimum milliseconds between progress lines
    #[arg(long, default_value = "1000")]
    progress_interval_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Inventory a directory tree
    Scan {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Inventory a directory tree and upload it
    Upload {
        #[command(flatten)]
        common: CommonArgs,

        /// Destination prefix (a directory for --backend local)
        #[arg(short = 'D', long)]
        dest: String,

        /// Transfers per round
        #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// One unit per file or per first-level folder
        #[arg(long, value_enum, default_value = "files")]
        mode: ModeArg,

        #[arg(long, value_enum, default_value = "local")]
        backend: Backend,

        /// Skip units already present at the destination
        #[arg(long)]
        check_exists: bool,

        /// Verify copied files by MD5 (local backend)
        #[arg(long)]
        checksum: bool,

        /// Per-unit deadline in milliseconds
        #[arg(long, default_value_t = DEFAULT_ITEM_TIMEOUT_MS)]
        item_timeout_ms: u64,

        /// Per-round deadline in milliseconds
        #[arg(long, default_value_t = DEFAULT_ROUND_TIMEOUT_MS)]
        round_timeout_ms: u64,

        /// Skip units recorded as done in the database
        #[arg(long, requires = "db")]
        resume: bool,

        /// Drop per-file records after the scan when not needed
        #[arg(long)]
        no_store_files: bool,
    },
}

fn base_config(common: &CommonArgs) -> tree_uploader::config::RunConfigBuilder {
    let mut builder = RunConfig::builder()
        .root(&common.root)
        .num_workers(common.workers)
        .progress_interval_ms(common.progress_interval_ms);
    if let Some(db) = &common.db {
        builder = builder.db_path(db);
    }
    builder
}

fn make_sink(common: &CommonArgs) -> Box<dyn ProgressSink> {
    if common.progress {
        Box::new(JsonLinesReporter::stderr(common.progress_interval_ms))
    } else {
        Box::new(NullSink)
    }
}

fn print_summary(summary: &RunSummary, json: bool) {
    if json {
        match serde_json::to_string_pretty(summary) {
            Ok(out) => println!("{}", out),
            Err(e) => eprintln!("Failed to serialize summary: {}", e),
        }
        return;
    }

    println!("Scan completed:");
    println!("  Root: {}", summary.scan.root_name);
    println!("  Total files: {}", summary.scan.total_files);
    println!("  Total size: {} bytes", summary.scan.total_size);
    println!("  Directories: {}", summary.scan.processed_dirs);
    println!("  First-level folders: {}", summary.scan.folder_count);
    println!("  Skipped entries: {}", summary.scan.skipped_entries);
    println!("  Skipped subtrees: {}", summary.scan.skipped_subtrees);

    if let Some(upload) = &summary.upload {
        println!("Upload completed:");
        for status in UnitStatus::ALL {
            println!("  {}: {}", status, upload.count(status));
        }
        println!("  Already present: {}", upload.skipped_existing);
        println!("  Resumed: {}", summary.resumed);
        println!("  Bytes transferred: {}", upload.bytes_transferred);
        println!("  Rounds: {}", upload.rounds());
        println!("  Throughput: {:.0} B/s", upload.throughput);
        let failed = summary.failed_paths();
        if !failed.is_empty() {
            println!("  Failed units:");
            for path in failed {
                println!("    {}", path);
            }
        }
    }
    println!("  Duration: {}ms", summary.duration_ms);
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let (config, transfer, common) = match cli.command {
        Some(Commands::Scan { common }) => (base_config(&common).build(), None, common),
        Some(Commands::Upload {
            common,
            dest,
            concurrency,
            mode,
            backend,
            check_exists,
            checksum,
            item_timeout_ms,
            round_timeout_ms,
            resume,
            no_store_files,
        }) => {
            let config = base_config(&common)
                .upload_to(dest)
                .mode(mode.into())
                .concurrency(concurrency)
                .check_exists(check_exists)
                .item_timeout(Duration::from_millis(item_timeout_ms))
                .round_timeout(Duration::from_millis(round_timeout_ms))
                .resume(resume)
                .store_files(!no_store_files)
                .release_settled(no_store_files)
                .build();
            let transfer: Arc<dyn TransferCapability> = match backend {
                Backend::Local => Arc::new(LocalDirTransfer::new().with_checksum(checksum)),
                Backend::Rclone => Arc::new(CommandTransfer::rclone()),
            };
            (config, Some(transfer), common)
        }
        None => {
            println!("{}", ABOUT);
            println!("Use 'tree_uploader <command> -h' for command options");
            return ExitCode::SUCCESS;
        }
    };

    info!("Root: {:?}", config.root);
    info!(
        "Workers: {}",
        if config.num_workers == 0 {
            "auto".to_string()
        } else {
            config.num_workers.to_string()
        }
    );
    if config.upload {
        info!(
            "Uploading to {:?} as {}, {} per round",
            config.destination,
            config.mode.as_str(),
            config.concurrency
        );
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut pipeline = Pipeline::new(config, Arc::new(LocalFs));
    if let Some(transfer) = transfer {
        pipeline = pipeline.with_transfer(transfer);
    }
    let sink = make_sink(&common);

    match runtime.block_on(pipeline.run(sink)) {
        Ok(outcome) => {
            print_summary(&outcome.summary, common.json);
            if outcome.summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
