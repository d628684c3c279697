//! Sparkobs CLI

use clap::{Arg, ArgAction, Command};
use sparkobs_deployer::{config::Config, crate_version, stage, stage::Stage};
use std::path::PathBuf;
use tracing::error;

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

fn stage_arg() -> Arg {
    Arg::new("stage")
        .long("stage")
        .help("Run a single stage instead of the whole pipeline")
        .value_parser(["infra", "emr", "jobs", "ssl", "shs", "vpn"])
}

/// Entrypoint for the sparkobs CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    let matches = Command::new("sparkobs")
        .version(crate_version())
        .about("Provision a centralized Spark observability platform on AWS.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("deploy")
                .about("Deploy all stages in order, or one stage.")
                .arg(config_arg())
                .arg(stage_arg()),
        )
        .subcommand(
            Command::new("destroy")
                .about("Destroy all stages in inverse order, or one stage. The templates and event-log buckets are always retained.")
                .arg(config_arg())
                .arg(stage_arg()),
        )
        .subcommand(
            Command::new("status")
                .about("Report the state of every stage's resources without changing anything.")
                .arg(config_arg()),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let run = |matches: &clap::ArgMatches| -> Option<(Config, Option<Stage>)> {
        let config_path = matches.get_one::<PathBuf>("config")?;
        let config = match Config::load(config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = ?e, "failed to load configuration");
                return None;
            }
        };
        let stage = matches
            .get_one::<String>("stage")
            .and_then(|s| Stage::parse(s));
        Some((config, stage))
    };

    match matches.subcommand() {
        Some(("deploy", matches)) => {
            let Some((config, only)) = run(matches) else {
                return std::process::ExitCode::FAILURE;
            };
            if let Err(e) = stage::deploy(&config, only).await {
                error!(error = ?e, "deploy failed");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some(("destroy", matches)) => {
            let Some((config, only)) = run(matches) else {
                return std::process::ExitCode::FAILURE;
            };
            if let Err(e) = stage::destroy(&config, only).await {
                error!(error = ?e, "destroy failed");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some(("status", matches)) => {
            let Some((config, _)) = run(matches) else {
                return std::process::ExitCode::FAILURE;
            };
            if let Err(e) = stage::status(&config).await {
                error!(error = ?e, "status failed");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    std::process::ExitCode::FAILURE
}
