use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smart_filter::models::FilterActions;
use smart_filter::{EmailRecord, EngineConfig, FilterCriteria, FilterEngine};
use std::fs;
use std::path::Path;
use std::process;

/// Shape of the file passed to `--add-filter`.
#[derive(Debug, Deserialize)]
struct NewFilter {
    name: String,
    #[serde(default)]
    description: String,
    criteria: Value,
    actions: FilterActions,
    #[serde(default)]
    priority: i64,
}

#[derive(Debug, Serialize)]
struct ToggleResult<'a> {
    filter_id: &'a str,
    updated: bool,
}

#[tokio::main]
async fn main() {
    let matches = Command::new("smart-filter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Persistent rule-based email filtering engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/smart-filter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("apply")
                .long("apply")
                .value_name("EMAIL_JSON")
                .help("Apply active filters to the email in this JSON file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("mine")
                .long("mine")
                .value_name("SAMPLES_JSON")
                .help("Create filters from a JSON array of sample emails")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("add-filter")
                .long("add-filter")
                .value_name("FILTER_JSON")
                .help("Add a custom filter described by this JSON file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("prune")
                .long("prune")
                .help("Disable or delete ineffective filters")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .help("List all filters")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show filter and cache statistics")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("enable")
                .long("enable")
                .value_name("ID")
                .help("Activate a filter")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("disable")
                .long("disable")
                .value_name("ID")
                .help("Deactivate a filter without deleting it")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("delete")
                .long("delete")
                .value_name("ID")
                .help("Delete a filter and its performance history")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/smart-filter.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = run(&matches, &config).await {
        log::error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(matches: &ArgMatches, config: &EngineConfig) -> anyhow::Result<()> {
    let engine = FilterEngine::open(config)
        .with_context(|| format!("Failed to open filter database: {}", config.database_path))?;

    if let Some(path) = matches.get_one::<String>("apply") {
        let email: EmailRecord = read_json(path)?;
        let result = engine.apply_to_email(&email).await?;
        return print_json(&result);
    }

    if let Some(path) = matches.get_one::<String>("mine") {
        let samples: Vec<EmailRecord> = read_json(path)?;
        let outcome = engine.create_intelligent_filters(&samples).await;
        let created = outcome.into_result()?;
        return print_json(&created);
    }

    if let Some(path) = matches.get_one::<String>("add-filter") {
        let new: NewFilter = read_json(path)?;
        let criteria = FilterCriteria::from_json(new.criteria)?;
        let filter = engine
            .add_custom_filter(&new.name, &new.description, criteria, new.actions, new.priority)
            .await?;
        return print_json(&filter);
    }

    if matches.get_flag("prune") {
        let report = engine.prune_ineffective_filters().await?;
        return print_json(&report);
    }

    if let Some(filter_id) = matches.get_one::<String>("enable") {
        let updated = engine.set_active(filter_id, true).await?;
        return print_json(&ToggleResult { filter_id, updated });
    }

    if let Some(filter_id) = matches.get_one::<String>("disable") {
        let updated = engine.set_active(filter_id, false).await?;
        return print_json(&ToggleResult { filter_id, updated });
    }

    if let Some(filter_id) = matches.get_one::<String>("delete") {
        let updated = engine.delete_filter(filter_id).await?;
        return print_json(&ToggleResult { filter_id, updated });
    }

    if matches.get_flag("stats") {
        return print_json(&engine.statistics().await?);
    }

    if matches.get_flag("list") {
        return print_json(&engine.list_all().await?);
    }

    bail!("No command given; see --help")
}

fn load_config(path: &str) -> anyhow::Result<EngineConfig> {
    if Path::new(path).exists() {
        EngineConfig::load(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(EngineConfig::default())
    }
}

fn generate_default_config(path: &str) {
    let written = EngineConfig::default()
        .to_yaml()
        .and_then(|yaml| fs::write(path, yaml).with_context(|| format!("Failed to write {path}")));
    match written {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read JSON file: {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse JSON file: {path}"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
