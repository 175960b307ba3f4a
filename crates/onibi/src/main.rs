//! onibi CLI
//!
//! Commands:
//! - onibi watch [--path P] [--from-start] [--no-persist] [--backend B]
//! - onibi replay <FILE>
//! - onibi parse <LINE>...
//! - onibi config [--default]

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use onibi_core::config::{LogFormat, StartPosition, WatchBackend};
use onibi_core::error::format_error_with_remediation;
use onibi_core::logging::{LogConfig, LogLevel, init_logging};
use onibi_core::pipeline::now_ms;
use onibi_core::stats::PipelineStats;
use onibi_core::tailer::TailerConfig;
use onibi_core::{
    Config, EventBus, ParsedRecord, Pipeline, RecvError, RejectReason, Scheduler, TailBuffer,
    parse_line,
};

#[derive(Parser)]
#[command(name = "onibi")]
#[command(about = "Tail the terminal hook log and stream detected events")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/onibi/onibi.toml)
    #[arg(long, global = true, env = "ONIBI_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the log and print every bus event as a JSON line
    Watch {
        /// Log file to watch instead of watch.path
        #[arg(long)]
        path: Option<PathBuf>,

        /// Read existing content instead of starting at the end
        #[arg(long)]
        from_start: bool,

        /// Neither restore nor save the watermark and dedup window
        #[arg(long)]
        no_persist: bool,

        /// Notification backend: auto, native or poll
        #[arg(long)]
        backend: Option<WatchBackend>,
    },

    /// Run the pipeline over a file once and print confirmed detections
    Replay {
        file: PathBuf,
    },

    /// Parse log lines and print the records
    Parse {
        #[arg(required = true)]
        lines: Vec<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<onibi_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    if let Commands::Config { default: true } = cli.command {
        print!("{}", Config::default().to_toml().map_err(onibi_core::Error::from)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = Config::load(cli.config.as_deref()).map_err(onibi_core::Error::from)?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level.to_string();
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }

    match cli.command {
        Commands::Config { .. } => {
            print!("{}", config.to_toml().map_err(onibi_core::Error::from)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Parse { lines } => Ok(parse_lines(&lines)?),
        Commands::Replay { file } => {
            start_logging(&config)?;
            replay(&config, file)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch {
            path,
            from_start,
            no_persist,
            backend,
        } => {
            if let Some(path) = path {
                config.watch.path = path.display().to_string();
            }
            if from_start {
                config.watch.start_position = StartPosition::Beginning;
            }
            if no_persist {
                config.persistence.enabled = false;
            }
            if let Some(backend) = backend {
                config.watch.backend = backend;
            }
            config.validate().map_err(onibi_core::Error::from)?;
            start_logging(&config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(watch(config))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn start_logging(config: &Config) -> Result<()> {
    let log_config = LogConfig::from_config(config).map_err(onibi_core::Error::from)?;
    init_logging(&log_config).context("failed to initialize logging")
}

fn print_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

async fn watch(config: Config) -> Result<()> {
    let bus = EventBus::new(config.bus.queue_capacity);
    let events = bus.subscribe();
    let mut scheduler = Scheduler::new(config, bus);
    scheduler.start().await?;

    let mut stdout = io::stdout();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(err) = signal {
                    warn!(error = %err, "Cannot listen for Ctrl-C; stopping");
                }
                info!("Interrupted; stopping");
                break;
            }
            received = events.recv() => match received {
                Ok(event) => print_json(&mut stdout, &event)?,
                Err(RecvError::Lagged { missed_count }) => {
                    warn!(missed_count, "Output fell behind; events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.stop().await?;
    while let Ok(Some(event)) = events.try_recv() {
        print_json(&mut stdout, &event)?;
    }
    Ok(())
}

fn replay(config: &Config, file: PathBuf) -> Result<()> {
    if !file.is_file() {
        bail!("{} is not a readable file", file.display());
    }
    let stats = Arc::new(PipelineStats::new());
    let tailer_config = TailerConfig {
        start_position: StartPosition::Beginning,
        ..TailerConfig::from(&config.watch)
    };
    let tailer = TailBuffer::open(&file, tailer_config, None, Arc::clone(&stats))
        .with_context(|| format!("failed to open {}", file.display()))?;
    let bus = EventBus::new(config.bus.queue_capacity);
    let mut pipeline = Pipeline::new(tailer, config, bus, Arc::clone(&stats));

    let report = pipeline.drain_at(now_ms())?;
    let mut stdout = io::stdout();
    for confirmed in &report.confirmed {
        print_json(&mut stdout, confirmed)?;
    }

    let snapshot = stats.snapshot();
    eprintln!(
        "replayed {} lines: {} records, {} malformed, {} candidates, {} confirmed, {} suppressed",
        snapshot.lines_read,
        snapshot.records_parsed,
        snapshot.malformed_lines,
        snapshot.candidates,
        snapshot.confirmed,
        snapshot.suppressed,
    );
    Ok(())
}

#[derive(Serialize)]
#[serde(untagged)]
enum ParseOutput<'a> {
    Record(ParsedRecord),
    Rejected { line: &'a str, rejected: RejectReason },
}

/// Exits non-zero when any line was rejected.
fn parse_lines(lines: &[String]) -> Result<ExitCode> {
    let observed_ms = now_ms();
    let mut stdout = io::stdout();
    let mut rejected_any = false;
    for line in lines {
        let output = match parse_line(line, 0, observed_ms) {
            Ok(record) => ParseOutput::Record(record),
            Err(rejected) => {
                rejected_any = true;
                ParseOutput::Rejected { line, rejected }
            }
        };
        print_json(&mut stdout, &output)?;
    }
    Ok(if rejected_any {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
