use clap::Parser;
use fooocus_metadata::config::{self, ExtractorConfig};
use fooocus_metadata::error::ExtractError;
use fooocus_metadata::{default_decoder, extract_from_file, scanner, StructuredMetadata};
use rayon::prelude::*;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;

/// Prints the generation parameters embedded in AI-generated images.
#[derive(Parser, Debug)]
#[command(name = "fooocus-meta", version)]
struct Cli {
    /// Log every decode attempt.
    #[arg(long)]
    debug: bool,

    /// Log progress.
    #[arg(short, long)]
    verbose: bool,

    /// YAML or JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Private log to consult for every image, instead of `log.html` next
    /// to each one.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the tool-specific record instead of the summary.
    #[arg(long)]
    raw: bool,

    /// Image files or directories to scan.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn render(meta: &StructuredMetadata, raw: bool) -> serde_json::Result<Value> {
    if raw {
        serde_json::to_value(meta)
    } else {
        serde_json::to_value(meta.summary())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = match &cli.config {
        Some(path) => config::load(path),
        None => ExtractorConfig::default().with_env_overrides(),
    };
    if let Some(log_file) = &cli.log_file {
        config.log_file = Some(log_file.clone());
    }
    log::debug!("Using config {:?}", config);

    let decoder = default_decoder(&config);

    let files: Vec<PathBuf> = cli
        .paths
        .iter()
        .flat_map(|path| {
            if path.is_dir() {
                let found = scanner::scan_directory(path);
                log::info!("Found {} images in {}", found.len(), path.display());
                found
            } else {
                vec![path.clone()]
            }
        })
        .collect();

    let results: Vec<(PathBuf, Result<StructuredMetadata, ExtractError>)> = files
        .into_par_iter()
        .map(|path| {
            let result = extract_from_file(&path, &decoder);
            (path, result)
        })
        .collect();

    let mut missing = 0usize;
    let mut records = Vec::with_capacity(results.len());
    for (path, result) in results {
        match result.map(|meta| render(&meta, cli.raw)) {
            Ok(Ok(metadata)) => records.push(json!({
                "path": path.display().to_string(),
                "metadata": metadata,
            })),
            Ok(Err(err)) => {
                log::error!("Failed to render metadata for {}: {}", path.display(), err);
                missing += 1;
            }
            Err(err) => {
                log::warn!("{}: {}", path.display(), err);
                missing += 1;
            }
        }
    }

    match serde_json::to_string_pretty(&records) {
        Ok(output) => println!("{}", output),
        Err(err) => {
            log::error!("Failed to serialize output: {}", err);
            return ExitCode::FAILURE;
        }
    }

    log::info!("Extracted {} records, {} without metadata", records.len(), missing);
    if missing > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
