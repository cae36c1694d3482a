use clap::{Args, Subcommand};

use dualsync::config::{BackendConfig, Config};

use super::OutputFormat;

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

    /// Show the backend that commands will connect to
    Backend {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
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
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!(
                            "backend_override: {}",
                            config.backend_override.value.display()
                        );
                        println!("  source: {}", config.backend_override.source);
                        println!();

                        println!("watch_interval_ms: {}", config.watch_interval_ms.value);
                        println!("  source: {}", config.watch_interval_ms.source);
                        println!();

                        println!(
                            "auth.email: {}",
                            config.auth.email.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "auth.password: {}",
                            if config.auth.password.is_some() {
                                "(set)"
                            } else {
                                "(not set)"
                            }
                        );
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Backend { format } => {
                let backend = config.active_backend();
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&backend)?);
                    }
                    OutputFormat::Text => print_backend(&backend),
                }
                Ok(())
            }
        }
    }
}

fn print_backend(backend: &BackendConfig) {
    println!("project_id:         {}", backend.project_id);
    println!("auth_domain:        {}", backend.auth_domain);
    println!("database_url:       {}", backend.database_url);
    println!("storage_bucket:     {}", backend.storage_bucket);
    println!("firestore_endpoint: {}", backend.firestore_endpoint);
    println!("identity_endpoint:  {}", backend.identity_endpoint);
    println!("token_endpoint:     {}", backend.token_endpoint);
}
