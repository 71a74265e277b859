//! chunkeval-bench - polynomial evaluation over in-memory, memory-mapped
//! and compressed chunked storage.
//!
//! Reports go to stdout, one block per configuration as it completes;
//! diagnostics go to stderr through `tracing`.

use alopex_chunkeval::bench::{
    BenchConfig, ResultSink, Runner, SweepReport, DEFAULT_EXPR, DEFAULT_N, DEFAULT_STEP,
};
use alopex_chunkeval::{Codec, SyncMode};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

/// Benchmark out-of-core polynomial evaluation across storage backends
#[derive(Parser, Debug)]
#[command(name = "chunkeval-bench")]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Expression to evaluate over `x`
    #[arg(short = 'e', long = "expr", default_value = DEFAULT_EXPR)]
    expr: String,

    /// Number of points per dataset
    #[arg(short = 'n', long = "points", default_value_t = DEFAULT_N)]
    n: usize,

    /// Elements per slice for chunked population and evaluation
    #[arg(short = 's', long = "step", default_value_t = DEFAULT_STEP)]
    step: usize,

    /// Codecs to sweep, unavailable ones are skipped [default: zlib,zstd,gorilla,blosc]
    #[arg(short = 'c', long = "codec", value_delimiter = ',')]
    codecs: Option<Vec<String>>,

    /// Compression levels to sweep [default: 0-9]
    #[arg(
        short = 'l',
        long = "level",
        value_delimiter = ',',
        value_parser = clap::value_parser!(u8).range(0..=9)
    )]
    levels: Option<Vec<u8>>,

    /// Fixed container chunk length in elements
    #[arg(long = "chunk-len")]
    chunk_len: Option<usize>,

    /// Disable the byte-shuffle filter
    #[arg(long = "no-shuffle")]
    no_shuffle: bool,

    /// Directory for generated files
    #[arg(short = 'd', long = "dir", default_value = ".")]
    work_dir: PathBuf,

    /// Skip the memory-mapped flat file configuration
    #[arg(long = "no-flat-file")]
    no_flat_file: bool,

    /// Where the result dataset is stored
    #[arg(long = "result", value_enum, default_value_t = SinkArg::Dataset)]
    result_sink: SinkArg,

    /// How files are flushed before sizes are measured
    #[arg(long = "sync", value_enum, default_value_t = SyncArg::Fsync)]
    sync_mode: SyncArg,

    /// Print codec availability and versions, then exit
    #[arg(long = "list-codecs")]
    list_codecs: bool,

    /// Enable debug logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Only log errors
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Dataset,
    Memory,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyncArg {
    Fsync,
    Fdatasync,
    None,
}

impl CliArgs {
    fn into_config(self) -> BenchConfig {
        let mut config = BenchConfig::default()
            .with_expr(self.expr)
            .with_n(self.n)
            .with_step(self.step)
            .with_chunk_len(self.chunk_len)
            .with_shuffle(!self.no_shuffle)
            .with_work_dir(self.work_dir)
            .with_flat_file(!self.no_flat_file)
            .with_result_sink(match self.result_sink {
                SinkArg::Dataset => ResultSink::Dataset,
                SinkArg::Memory => ResultSink::Memory,
            })
            .with_sync_mode(match self.sync_mode {
                SyncArg::Fsync => SyncMode::Fsync,
                SyncArg::Fdatasync => SyncMode::Fdatasync,
                SyncArg::None => SyncMode::None,
            });
        if let Some(codecs) = self.codecs {
            config = config.with_codecs(codecs);
        }
        if let Some(levels) = self.levels {
            config = config.with_levels(levels);
        }
        config
    }
}

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

fn print_codecs() {
    for codec in Codec::ALL {
        let status = if codec.is_available() {
            "available"
        } else {
            "not built"
        };
        println!(
            "{:<8} {:<10} {}",
            codec.name(),
            status,
            codec.version().unwrap_or("-")
        );
    }
}

fn run(args: CliArgs) -> alopex_chunkeval::Result<()> {
    let runner = Runner::new(args.into_config())?;
    print!("{}", SweepReport::new(runner.config().n));
    runner.run_each(|report| print!("{report}"))?;
    Ok(())
}

fn main() {
    let args = CliArgs::parse();
    setup_logging(args.verbose, args.quiet);

    if args.list_codecs {
        print_codecs();
        return;
    }

    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}
