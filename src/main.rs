use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;

use rxscan::config::{AnalyzerConfig, EngineToggles, APP_VERSION};
use rxscan::pipeline::entities::ExtractionScope;
use rxscan::{CancellationFlag, ExtractionError};

/// rxscan - OCR and medicine extraction for prescription images
#[derive(Parser, Debug)]
#[command(name = "rxscan", version)]
#[command(about = "Extract text, medicines and condition hints from medical document images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze one image and print the result as JSON
    Analyze {
        /// Path to a JPEG, PNG or TIFF image
        image: PathBuf,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,

        /// Text the medicine extractor scans
        #[arg(long, value_enum, default_value = "full")]
        scope: ScopeArg,

        /// Skip the cloud vision engine
        #[arg(long)]
        no_cloud: bool,

        /// Skip the local vision model
        #[arg(long)]
        no_local: bool,

        /// Skip Tesseract
        #[arg(long)]
        no_rule_based: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Full,
    MedicationZone,
}

impl From<ScopeArg> for ExtractionScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Full => ExtractionScope::FullText,
            ScopeArg::MedicationZone => ExtractionScope::MedicationZone,
        }
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Analysis(#[from] ExtractionError),

    #[error("cannot serialize result: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    // .env is optional; real environment variables take precedence
    let _ = dotenvy::dotenv();
    rxscan::init_tracing();

    let cli = Cli::parse();
    tracing::info!("rxscan v{APP_VERSION}");

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Analysis failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Analyze {
            image,
            pretty,
            scope,
            no_cloud,
            no_local,
            no_rule_based,
        } => {
            let bytes = std::fs::read(&image).map_err(|source| CliError::Read {
                path: image.clone(),
                source,
            })?;

            let analyzer = AnalyzerConfig::from_env()
                .with_scope(scope.into())
                .with_engines(EngineToggles {
                    cloud: !no_cloud,
                    local: !no_local,
                    rule_based: !no_rule_based,
                })
                .build_analyzer()?;

            let analysis = analyzer.analyze_bytes(&bytes, &CancellationFlag::new())?;
            let json = if pretty {
                serde_json::to_string_pretty(&analysis)?
            } else {
                serde_json::to_string(&analysis)?
            };
            println!("{json}");
            Ok(())
        }
    }
}
