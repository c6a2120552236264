use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use dnsprint::config::{ProbeConfig, TrainConfig, DEFAULT_PORT, DEFAULT_TIMEOUT_MS, DEFAULT_WORKERS};
use dnsprint::model::Granularity;

#[derive(Parser, Debug)]
#[command(name = "dnsprint")]
#[command(version = "0.1.0")]
#[command(about = "Fingerprint DNS server software from its answers to unusual queries", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub probe: ProbeArgs,

    #[arg(long, global = true, help = "JSON file overriding the query axes")]
    pub axes: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory holding models and important test case lists")]
    pub artifacts: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[arg(long, global = true, default_value_t = DEFAULT_PORT, help = "Destination port for probes")]
    pub port: u16,

    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT_MS, help = "Single-shot wait per probe, in milliseconds")]
    pub timeout_ms: u64,

    #[arg(short, long, global = true, default_value_t = DEFAULT_WORKERS, help = "Maximum probes in flight")]
    pub workers: usize,
}

impl From<&ProbeArgs> for ProbeConfig {
    fn from(args: &ProbeArgs) -> Self {
        ProbeConfig {
            port: args.port,
            timeout: Duration::from_millis(args.timeout_ms),
            workers: args.workers,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe labelled servers for several rounds and record their signatures
    Fingerprint {
        #[arg(short, long, help = "File with one 'label,address[:port]' per line")]
        targets: PathBuf,

        #[arg(short, long, help = "Signature corpus to (re)write after every round")]
        corpus: PathBuf,

        #[arg(short, long, default_value_t = 10, help = "Number of full sweeps")]
        rounds: usize,

        #[arg(short, long, value_enum, help = "Only probe the important test cases of this trained granularity")]
        granularity: Option<Granularity>,
    },

    /// Train a classifier from a signature corpus
    Train {
        #[arg(short, long, help = "Signature corpus produced by 'fingerprint'")]
        corpus: PathBuf,

        #[arg(short, long, value_enum, help = "How finely to distinguish software versions")]
        granularity: Granularity,

        #[arg(long, default_value_t = TrainConfig::default().holdout_fraction, help = "Share of samples held out for accuracy")]
        holdout: f64,

        #[arg(long, default_value_t = TrainConfig::default().seed, help = "Seed for the hold-out shuffle")]
        seed: u64,
    },

    /// Classify a stream of addresses with a trained model
    Scan {
        #[arg(short, long, value_enum, help = "Granularity of the model to use")]
        granularity: Granularity,

        #[arg(short, long, help = "Addresses, one per line (default: stdin)")]
        input: Option<PathBuf>,

        #[arg(short, long, help = "JSON lines output (default: stdout)")]
        output: Option<PathBuf>,

        #[arg(long, help = "Addresses per chunk (default: a third of --workers)")]
        chunk_size: Option<usize>,
    },
}
