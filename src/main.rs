use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use speedmeter::bench::{run_suite, RunnerEvent, Suite, TrialStatus};
use speedmeter::config::{PurgeMode, SuiteConfig};
use speedmeter::models::SuiteReport;
use speedmeter::util::units::{format_bytes, format_remaining, format_throughput, MIB};
use speedmeter::{Result, SCRATCH_FILE_NAME, TEST_FILE_NAME};

/// Shell convention for termination by SIGINT
const EXIT_INTERRUPTED: i32 = 130;

/// Storage throughput benchmark
#[derive(Parser, Debug)]
#[command(name = "speedmeter", version, about)]
struct Cli {
    /// Directory on the volume to test
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Benchmark file size in MiB
    #[arg(short = 's', long)]
    file_size: Option<u64>,

    /// Small file and short random trials
    #[arg(long)]
    quick: bool,

    /// Cache purge before read trials
    #[arg(long, value_enum)]
    purge: Option<PurgeArg>,

    /// Append a memory copy trial as a RAM baseline
    #[arg(long)]
    memory_copy: bool,

    /// Skip warm-up blocks before sequential write
    #[arg(long)]
    no_warm_up: bool,

    /// Use cached file handles
    #[arg(long)]
    cached: bool,

    /// Leave the benchmark file in place
    #[arg(long)]
    keep_file: bool,

    /// Export the report as JSON
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,

    /// Include every sample in the JSON report
    #[arg(long, requires = "json")]
    raw: bool,

    /// Persist the effective configuration before running
    #[arg(long)]
    save_config: bool,

    /// Log trial lifecycle at info level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PurgeArg {
    Auto,
    Always,
    Never,
}

impl From<PurgeArg> for PurgeMode {
    fn from(arg: PurgeArg) -> Self {
        match arg {
            PurgeArg::Auto => PurgeMode::Auto,
            PurgeArg::Always => PurgeMode::Always,
            PurgeArg::Never => PurgeMode::Never,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(cli: &Cli) -> Result<SuiteConfig> {
    let base = match &cli.config {
        Some(path) => SuiteConfig::load_from(path)?,
        None => SuiteConfig::load()?,
    };
    let mut config = if cli.quick {
        SuiteConfig {
            target_dir: base.target_dir.clone(),
            ..SuiteConfig::quick()
        }
    } else {
        base
    };

    if let Some(dir) = &cli.dir {
        config = config.with_target_dir(dir.clone());
    }
    if let Some(mib) = cli.file_size {
        config = config.with_file_size(mib * MIB);
    }
    if let Some(purge) = cli.purge {
        config = config.with_purge_mode(purge.into());
    }
    if cli.memory_copy {
        config = config.with_memory_copy(true);
    }
    if cli.no_warm_up {
        config = config.with_warm_up(false);
    }
    if cli.cached {
        config = config.with_bypass_cache(false);
    }
    if cli.keep_file {
        config = config.with_keep_test_file(true);
    }

    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli)?;
    if cli.save_config {
        match &cli.config {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
    }

    let suite = Suite::standard(&config)?;
    println!(
        "Testing {} with a {} file, {} trials (about {})",
        config.target_dir.display(),
        format_bytes(config.file_size),
        suite.len(),
        format_remaining(suite.remaining_time())
    );

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{prefix:<36} [{bar:30}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let mut run = run_suite(suite);
    let mut interrupts = Interrupts::default();
    loop {
        tokio::select! {
            event = run.next_event() => match event {
                Some(event) => show_event(&bar, &event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => match interrupts.next() {
                Interrupt::Cancel => {
                    bar.println("Cancelling after the current block (Ctrl-C again to quit now)...");
                    run.cancel();
                }
                Interrupt::ForceExit => {
                    bar.abandon();
                    eprintln!(
                        "Quit before cleanup; remove {} and {} by hand if present",
                        config.target_dir.join(TEST_FILE_NAME).display(),
                        config.target_dir.join(SCRATCH_FILE_NAME).display()
                    );
                    std::process::exit(EXIT_INTERRUPTED);
                }
            }
        }
    }
    bar.finish_and_clear();

    let outcome = run.finish().await?;
    outcome.result?;

    let report = SuiteReport::from_suite(&outcome.suite, cli.raw);
    println!("\n{}", report);
    if let Some(elapsed) = report.elapsed_secs {
        println!("Finished in {:.1}s on {}", elapsed, report.system.storage);
    }
    if let Some(path) = &cli.json {
        report.save_json(path)?;
        println!("Report written to {}", path.display());
    }

    Ok(if interrupts.cancelled() {
        ExitCode::from(EXIT_INTERRUPTED as u8)
    } else {
        ExitCode::SUCCESS
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// Stop the suite after the operation in flight
    Cancel,
    /// Leave without waiting for the worker
    ForceExit,
}

/// Ctrl-C count for one run
#[derive(Debug, Default)]
struct Interrupts {
    received: u32,
}

impl Interrupts {
    fn next(&mut self) -> Interrupt {
        self.received += 1;
        if self.received == 1 {
            Interrupt::Cancel
        } else {
            Interrupt::ForceExit
        }
    }

    fn cancelled(&self) -> bool {
        self.received > 0
    }
}

fn show_event(bar: &ProgressBar, event: &RunnerEvent) {
    let update = &event.update;
    let eta = format!("{} left", format_remaining(event.remaining));

    if let Some(percent) = update.progress_percent {
        bar.set_position(percent as u64);
        let rate = update
            .recent_rate
            .map(format_throughput)
            .unwrap_or_default();
        bar.set_message(format!("{} {}", rate, eta));
        return;
    }

    match update.status {
        TrialStatus::Started => {
            bar.reset();
            bar.set_prefix(update.name.clone());
            bar.set_message(eta);
        }
        TrialStatus::Completed => {
            let summary = update
                .results
                .as_ref()
                .map(|r| format_throughput(r.avg_throughput_normalized()))
                .unwrap_or_default();
            bar.println(format!("{:<36} {}", update.name, summary));
        }
        status if status.is_terminal() => {
            bar.println(format!("{:<36} {}", update.name, status));
        }
        status => bar.set_message(format!("{} {}", status, eta)),
    }
}
