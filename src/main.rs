use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use shared_stats::config::StatsConfig;
use shared_stats::logging::init_logging;
use shared_stats::StatsRepository;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

const LONG_VERSION: &str = concat!(
    env!("BUILD_VERSION"),
    " (built ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

fn build_cli() -> Command {
    Command::new("stats-admin")
        .version(env!("BUILD_VERSION"))
        .long_version(LONG_VERSION)
        .about("Inspect and administer the shared statistics store")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("YAML configuration file"),
        )
        .arg(
            Arg::new("base-path")
                .long("base-path")
                .value_name("DIR")
                .global(true)
                .help("Shared directory containing Stats/ (overrides config)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("Log filter, e.g. info or debug (RUST_LOG takes precedence)"),
        )
        .subcommand(Command::new("show").about("Print global counters"))
        .subcommand(
            Command::new("client")
                .about("Print counters for one client")
                .arg(Arg::new("id").required(true).value_name("CLIENT_ID")),
        )
        .subcommand(
            Command::new("history")
                .about("Print history entries, newest first")
                .arg(
                    Arg::new("tool")
                        .required(true)
                        .value_parser(["analysis", "packing"]),
                )
                .arg(Arg::new("client").long("client").value_name("CLIENT_ID"))
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .value_parser(value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("session")
                .about("Print analysis and packing entries of one session")
                .arg(Arg::new("id").required(true).value_name("SESSION_ID")),
        )
        .subcommand(
            Command::new("reset")
                .about("Zero all counters and empty both history logs")
                .arg(
                    Arg::new("confirm")
                        .long("confirm")
                        .action(ArgAction::SetTrue)
                        .help("Required; the reset cannot be undone"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<StatsConfig, String> {
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = StatsConfig::load(config_path.as_deref()).map_err(|e| e.to_string())?;

    if let Some(base_path) = matches.get_one::<String>("base-path") {
        config.base_path = PathBuf::from(base_path);
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.log_level = level.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<(), String> {
    let config = load_config(matches)?;
    init_logging(&config.logging).map_err(|e| e.to_string())?;
    config.log_summary();

    let repository = StatsRepository::from_config(&config).map_err(|e| e.to_string())?;

    match matches.subcommand() {
        Some(("show", _)) => {
            let stats = repository.get_global_stats().map_err(|e| e.to_string())?;
            print_json(&stats)
        }
        Some(("client", sub)) => {
            let id = sub.get_one::<String>("id").map(String::as_str).unwrap_or_default();
            match repository.get_client_stats(id).map_err(|e| e.to_string())? {
                Some(stats) => print_json(&stats),
                None => Err(format!("no statistics recorded for client {}", id.to_uppercase())),
            }
        }
        Some(("history", sub)) => {
            let client = sub.get_one::<String>("client").map(String::as_str);
            let limit = sub.get_one::<usize>("limit").copied();
            let entries = match sub.get_one::<String>("tool").map(String::as_str) {
                Some("packing") => repository.get_packing_history(client, limit),
                _ => repository.get_analysis_history(client, limit),
            }
            .map_err(|e| e.to_string())?;
            print_json(&entries)
        }
        Some(("session", sub)) => {
            let id = sub.get_one::<String>("id").map(String::as_str).unwrap_or_default();
            let session = repository.get_session_history(id).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({
                "session_id": id,
                "analysis": session.analysis,
                "packing": session.packing,
            }))
        }
        Some(("reset", sub)) => {
            let confirm = sub.get_flag("confirm");
            if !confirm {
                return Err("refusing to reset statistics without --confirm".to_string());
            }
            if repository.reset_stats(true) {
                info!("Statistics reset from stats-admin");
                println!("statistics reset");
                Ok(())
            } else {
                Err("statistics reset failed, see log for details".to_string())
            }
        }
        _ => Err("unknown command".to_string()),
    }
}

fn main() -> ExitCode {
    let matches = build_cli().get_matches();
    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("stats-admin failed: {}", message);
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}
