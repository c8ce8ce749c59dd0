use clap::Parser;
use maprunner::{config, logging, map_reduce, PercentSink, SilentSink, WorkerPool};
use std::io::Read;

/// maprunner - a single-host, multi-worker map-reduce execution engine
#[derive(Parser)]
#[command(name = "maprunner")]
#[command(author = "Keith Bugeja <keith.bugeja@um.edu.mt>")]
#[command(version = "0.1.0")]
#[command(about = "Run embarrassingly parallel map-reduce jobs on one host")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Number of worker threads (overrides config file and NWORKERS)
    #[arg(short, long)]
    nworkers: Option<usize>,

    /// Force the in-caller (no worker threads) execution path
    #[arg(long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Input file; reads stdin if omitted
    #[arg(short, long)]
    input: Option<String>,

    /// Suppress the progress bar
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&cli.log_level);

    let overrides = config::CliOverrides {
        nworkers: cli.nworkers,
        debug: if cli.debug { Some(true) } else { None },
        spill_dir: None,
        log_level: Some(cli.log_level.clone()),
    };
    let engine_config = config::load(cli.config.as_deref().map(std::path::Path::new), overrides)?;

    let text = match &cli.input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    let len = lines.len();
    let quiet = cli.quiet;

    tracing::info!(nworkers = ?engine_config.nworkers, lines = len, "starting word count job");

    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<(String, i64)>> {
        let mut pool = WorkerPool::new(engine_config.nworkers, Some(engine_config.debug));
        let mut percent = PercentSink::new();
        let mut silent = SilentSink;
        let progress: &mut dyn maprunner::ProgressSink =
            if quiet { &mut silent } else { &mut percent };

        let reduced = map_reduce(
            &mut pool,
            lines.into_iter(),
            Some(len),
            |line: String| {
                line.split_whitespace()
                    .map(|w| (w.to_lowercase(), 1i64))
                    .collect::<Vec<_>>()
            },
            |word: String, counts: Vec<i64>| vec![(word, counts.into_iter().sum::<i64>())],
            progress,
        )?;

        let mut counts = Vec::new();
        for r in reduced {
            counts.push(r?);
        }
        counts.sort();
        Ok(counts)
    })
    .await??;

    for (word, count) in result {
        println!("{word}\t{count}");
    }

    Ok(())
}
