use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# brainsync configuration

# Path to SQLite database (default: platform data dir/brainsync/brainsync.db)
# database_path: ~/.local/share/brainsync/brainsync.db

# Root of the markdown vault (default: ~/SecondBrain)
# vault_root: ~/SecondBrain

# What to do when both sides changed: manual, prefer_database, prefer_file, newest_wins
conflict_policy: manual

# Entity kinds that take part in sync
kinds: [area, project, task]

sync:
  # delete_entity or restore, when a linked file is deleted
  deletion_policy: delete_entity
  max_workers: 4
  # full_scan_interval_secs: 300

watch:
  debounce_ms: 500
  rename_window_ms: 1000
"#;

impl ConfigCommand {
    pub fn run(
        &self,
        config: &Config,
        cli_config_path: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                cli_config_path
                                    .unwrap_or_else(Config::default_config_path)
                                    .display()
                            );
                        }
                        println!();

                        println!("database_path: {}", config.database_path.value.display());
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!("vault_root: {}", config.vault_root.value.display());
                        println!("  source: {}", config.vault_root.source);
                        println!();

                        println!("conflict_policy: {}", config.conflict_policy.value);
                        println!("  source: {}", config.conflict_policy.source);
                        println!();

                        let kinds: Vec<&str> =
                            config.kinds.value.iter().map(|k| k.as_str()).collect();
                        println!("kinds: {}", kinds.join(", "));
                        println!("  source: {}", config.kinds.source);
                        println!();

                        println!("deletion_policy: {}", config.sync.deletion_policy);
                        println!("max_workers: {}", config.sync.max_workers);
                        println!("debounce_ms: {}", config.watch.debounce_ms);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = cli_config_path.unwrap_or_else(Config::default_config_path);

                // Check if config already exists
                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'brainsync config show' to view current configuration.");
                    return Ok(());
                }

                // Create parent directory
                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(DEFAULT_CONFIG.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}
