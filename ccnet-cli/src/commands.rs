//! Subcommand handlers.

use crate::{Commands, ConfigAction};
use ccnet_core::TrainConfig;
use ccnet_core::config::{CONFIG_FILE_NAME, to_toml_string};
use ccnet_train::checkpoint;
use std::path::Path;

pub fn handle_command(
    command: Commands,
    mut config: TrainConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    config.hub.base_path = workspace.join(&config.hub.base_path);

    match command {
        Commands::Train {
            steps,
            seed,
            resume,
        } => {
            if let Some(steps) = steps {
                config.total_iterations = steps;
            }
            let summary = crate::train::run(&config, seed, resume)?;
            println!(
                "Finished {} iterations ({} checkpoints, {} saves). Final test metrics:",
                summary.iterations, summary.checkpoints, summary.saves
            );
            for (name, value) in summary.final_metrics.iter() {
                println!("  {name:<24} {value:>12.6}");
            }
            Ok(())
        }
        Commands::Config { action } => handle_config(action, &config, workspace),
        Commands::Checkpoints { json } => handle_checkpoints(&config, json),
    }
}

fn handle_config(action: ConfigAction, config: &TrainConfig, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            let toml_str = to_toml_string(&TrainConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", to_toml_string(config)?);
            Ok(())
        }
    }
}

fn handle_checkpoints(config: &TrainConfig, json: bool) -> anyhow::Result<()> {
    let models = config.hub.base_path.join("models");
    let mut entries = Vec::new();
    for dir in [models.clone(), models.join("temp")] {
        entries.extend(checkpoint::list(&dir)?);
    }
    entries.sort_by_key(|e| e.created_at);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No checkpoints under {}", models.display());
        return Ok(());
    }
    println!("Checkpoints ({}):", entries.len());
    for entry in &entries {
        let status = match checkpoint::verify(entry) {
            Ok(true) => "current",
            Ok(false) => "superseded",
            Err(_) => "missing",
        };
        println!(
            "  {} {:<8} iter {:>8}  {}  [{}]",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.role,
            entry.iteration,
            entry.path.display(),
            status
        );
    }
    Ok(())
}
