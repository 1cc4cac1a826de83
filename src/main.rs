use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use hashpatch::config::Config;
use hashpatch::create::{self, CreateOptions};
use hashpatch::fetch;
use hashpatch::fingerprint;
use hashpatch::gate::{AccessPrompt, DenyPrompt, PermissionGate, StdinPrompt};
use hashpatch::sink::{SinkRegistry, SinkStrategy};
use hashpatch::status::ConsoleReporter;
use hashpatch::{Destination, PatchOptions, Patcher};

#[derive(Parser)]
#[command(name = "hashpatch", version, about = "Content-addressed binary patch publisher and applier")]
struct Cli {
    /// Path to a hashpatch.toml configuration file
    #[arg(long, short = 'c', env = "HASHPATCH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HASHPATCH_LOG", default_value = "warn", global = true)]
    log: String,

    /// Log format
    #[arg(long, env = "HASHPATCH_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fingerprint of each file
    Identify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Look up and apply the published patch for each file
    Apply {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Base URL or directory serving patches/<fingerprint>.bin
        #[arg(long, env = "HASHPATCH_ORIGIN")]
        origin: Option<String>,
        /// Directory to write patched files into
        #[arg(long, short, conflicts_with = "in_place")]
        output_dir: Option<PathBuf>,
        /// Write next to the original and remove the original afterwards
        #[arg(long)]
        in_place: bool,
        /// How patched output is written
        #[arg(long)]
        sink: Option<SinkStrategy>,
        /// Fail instead of asking when a destination is not writable
        #[arg(long)]
        no_prompt: bool,
    },
    /// Create patches by comparing old and new files or directories
    Create {
        /// Path to the old (original) file or directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) file or directory
        #[arg(long)]
        new: PathBuf,
        /// Site directory; patches are written under <output>/patches
        #[arg(long, short)]
        output: PathBuf,
        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    let config = Config::load(cli.config.as_deref()).await?;
    tracing::debug!(config = ?cli.config, "configuration loaded");

    match cli.command {
        Commands::Identify { files } => {
            for file in files {
                let fp = fingerprint::identify_file(&file, config.key.as_bytes(), config.read_buffer, |_, _| {})
                    .await
                    .with_context(|| format!("Failed to identify {}", file.display()))?;
                println!("{}  {}", fp.id(), file.display());
            }
        }
        Commands::Apply {
            files,
            origin,
            output_dir,
            in_place,
            sink,
            no_prompt,
        } => {
            let Some(origin) = origin.or_else(|| config.origin.clone()) else {
                bail!("No patch origin given; pass --origin or set `origin` in the config file");
            };
            let destination = if let Some(dir) = output_dir {
                Destination::Directory(dir)
            } else if in_place || config.in_place {
                Destination::InPlace
            } else if let Some(dir) = config.output_dir.clone() {
                Destination::Directory(dir)
            } else {
                Destination::Directory(PathBuf::from("."))
            };
            let prompt: Arc<dyn AccessPrompt> = if no_prompt || !config.prompt {
                Arc::new(DenyPrompt)
            } else {
                Arc::new(StdinPrompt::default())
            };
            let options = PatchOptions {
                key: config.key.as_bytes().to_vec(),
                read_buffer: config.read_buffer,
                strategy: sink.unwrap_or(config.sink),
                buffer_limit: config.buffer_limit,
                destination,
            };

            run_apply(files, &origin, prompt, options, &config).await?;
        }
        Commands::Create {
            old,
            new,
            output,
            chunk_size,
        } => {
            println!("Creating patches...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let options = CreateOptions {
                key: config.key.as_bytes().to_vec(),
                chunk_size: chunk_size.unwrap_or(config.chunk_size),
            };
            let start = Instant::now();
            let summary = create::create_patches(&old, &new, &output, &options).await?;
            let elapsed = start.elapsed();

            println!("\nPatches created successfully!");
            println!("  Patches written: {}", summary.patches_written);
            println!("  Unchanged files: {}", summary.unchanged);
            println!("  Duplicate originals: {}", summary.duplicates);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}

async fn run_apply(
    files: Vec<PathBuf>,
    origin: &str,
    prompt: Arc<dyn AccessPrompt>,
    options: PatchOptions,
    config: &Config,
) -> Result<()> {
    let source = fetch::source_for_origin(origin)?;
    let registry = SinkRegistry::new();
    let reporter = Arc::new(ConsoleReporter::new(config.messages.clone()));
    let patcher = Arc::new(Patcher::new(
        source,
        PermissionGate::new(prompt),
        registry.clone(),
        reporter,
        options,
    ));

    let start = Instant::now();
    let run = patcher.process_all(files);
    tokio::pin!(run);

    // First interrupt with files still being written only warns; the next one
    // removes partial outputs and exits.
    let mut warned = false;
    let results = loop {
        tokio::select! {
            results = &mut run => break results,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if !warned && registry.pending() > 0 {
                    eprintln!("{}", config.messages.page_leave);
                    warned = true;
                    continue;
                }
                let removed = registry.abort_all();
                tracing::warn!(removed, "interrupted, partial outputs removed");
                std::process::exit(130);
            }
        }
    };
    let elapsed = start.elapsed();

    let failed = results.iter().filter(|(_, result)| result.is_err()).count();
    let bytes_written: u64 = results
        .iter()
        .filter_map(|(_, result)| result.as_ref().ok())
        .map(|summary| summary.bytes_written)
        .sum();

    println!("\nPatched {} of {} file(s)", results.len() - failed, results.len());
    println!("  Bytes written: {bytes_written}");
    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

    if failed > 0 {
        bail!("{failed} file(s) could not be patched");
    }
    Ok(())
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
