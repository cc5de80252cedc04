use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_srautils::app::{Dumper, Fetcher, ProgressSink};
use kira_srautils::backend::Backend;
use kira_srautils::cancel::{CancelToken, INTERRUPTED_EXIT_CODE, install_signal_forwarder};
use kira_srautils::config::{
    DEFAULT_CHUNKS, DEFAULT_CONCURRENCY, DEFAULT_QUEUE, DumpRequest, FetchConfig, FetchRequest,
    RunConfig,
};
use kira_srautils::error::SraError;
use kira_srautils::fetch::S3HttpClient;
use kira_srautils::output::{self, JsonOutput, LogSink, OutputMode};
use kira_srautils::toolkit::SystemToolkit;

#[derive(Parser)]
#[command(name = "kira-sra")]
#[command(about = "Fast utils to fetch SRA archives and dump them to FASTQ in parallel chunks")]
#[command(version, author)]
struct Cli {
    /// Print the final report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch a run archive by SRR/ERR/DRR id")]
    Fetch(FetchArgs),
    #[command(about = "Dump a run archive into FASTQ/FASTA")]
    Dump(DumpArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// Run accession, SRR/ERR/DRR allowed
    #[arg(short = 'i', long = "id", value_name = "ID")]
    id: String,

    /// Output directory, current dir by default
    #[arg(short = 'o', long, value_name = "DIR")]
    outdir: Option<PathBuf>,

    /// Max number of concurrent connections
    #[arg(short = 'n', long = "num", default_value_t = DEFAULT_CONCURRENCY, value_name = "INT")]
    num: usize,

    /// Max speed per second, e.g. 500K or 10M; unlimited by default
    #[arg(short = 's', long, value_name = "SPEED")]
    max_speed: Option<String>,
}

#[derive(Args)]
struct DumpArgs {
    /// Input .sra file
    #[arg(short = 'i', long, value_name = "FILE")]
    input: PathBuf,

    /// Output directory, current dir by default
    #[arg(short = 'o', long, value_name = "DIR")]
    outdir: Option<PathBuf>,

    /// Number of chunk jobs
    #[arg(short = 'p', long = "processes", default_value_t = DEFAULT_CHUNKS, value_name = "INT")]
    processes: u64,

    /// SGE queue(s)
    #[arg(short = 'q', long = "queue", num_args = 0.., default_values_t = [DEFAULT_QUEUE.to_string()], value_name = "QUEUE")]
    queue: Vec<String>,

    /// Append log output to this file instead of stderr
    #[arg(short = 'l', long = "log", value_name = "FILE")]
    log: Option<PathBuf>,

    /// Do not compress output
    #[arg(long)]
    no_gzip: bool,

    /// FASTA only
    #[arg(long)]
    fasta: bool,

    /// Run chunk jobs on this host instead of SGE
    #[arg(long)]
    local: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SraError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SraError) -> u8 {
    match error {
        SraError::InvalidAccession(_)
        | SraError::InvalidArgument(_)
        | SraError::RemoteNotFound(_)
        | SraError::InvalidPartition { .. } => 2,
        SraError::Preflight(_)
        | SraError::Probe(_)
        | SraError::Http(_)
        | SraError::HttpStatus { .. } => 3,
        // chunked dumps are all-or-nothing
        SraError::BackendFailure { .. } | SraError::Interrupted(_) => INTERRUPTED_EXIT_CODE,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let log_file = match &cli.command {
        Commands::Dump(args) => args.log.clone(),
        Commands::Fetch(_) => None,
    };
    init_logging(log_file)?;

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, output_mode),
        Commands::Dump(args) => run_dump(args, output_mode),
    }
}

fn init_logging(log_file: Option<PathBuf>) -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .into_diagnostic()?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run_fetch(args: FetchArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = FetchConfig::resolve(FetchRequest {
        id: args.id,
        outdir: args.outdir,
        concurrency: args.num,
        max_speed: args.max_speed,
    })?;
    let fetcher = Fetcher::new(S3HttpClient::new()?);

    match output_mode {
        OutputMode::Json => {
            let report = fetcher.run(&config, &JsonOutput)?;
            JsonOutput::print_fetch(&report).into_diagnostic()?;
        }
        OutputMode::Human => {
            let report = fetcher.run(&config, &LogSink)?;
            output::print_fetch_summary(&report);
        }
    }
    Ok(())
}

fn run_dump(args: DumpArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = RunConfig::resolve(DumpRequest {
        input: args.input,
        outdir: args.outdir,
        chunks: args.processes,
        queues: args.queue,
        log_file: args.log,
        no_gzip: args.no_gzip,
        fasta: args.fasta,
        local: args.local,
    })?;

    let cancel = CancelToken::new();
    install_signal_forwarder(cancel.clone())?;
    let dumper = Dumper::new(SystemToolkit::new(), Backend::for_mode(config.mode), cancel);

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &LogSink,
    };
    let report = dumper.run(&config, sink)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_dump(&report).into_diagnostic()?,
        OutputMode::Human => output::print_dump_summary(&report),
    }
    Ok(())
}
