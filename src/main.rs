use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use locomote_rs::config::{read_config, ConfigSource};
use locomote_rs::server;
use locomote_rs::App;

/// locomote - content publishing server.
#[derive(Parser, Debug)]
#[command(name = "locomote", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Individual configuration overrides, e.g. `server.port=9000`.
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let mut overrides = Vec::with_capacity(cli.set.len());
    for entry in &cli.set {
        match entry.split_once('=') {
            Some((key, value)) => overrides.push((key.to_string(), value.to_string())),
            None => {
                eprintln!("Error: override '{entry}' is not KEY=VALUE");
                return ExitCode::FAILURE;
            }
        }
    }

    let source = ConfigSource {
        config_file: cli.config,
        overrides,
    };
    let config = match read_config(&source) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let app = match App::create(config) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = app.start_background().await {
        eprintln!("Error: {err}");
        return ExitCode::FAILURE;
    }
    if let Err(err) = server::serve(app).await {
        eprintln!("Error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
