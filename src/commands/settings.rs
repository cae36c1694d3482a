use clap::{Args, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;

use dualsync::DualStoreSync;

use super::{print_record, read_record, wait_for_interrupt, OutputFormat, SUBSCRIPTION_ENDED};

#[derive(Args)]
pub struct SettingsCommand {
    #[command(subcommand)]
    pub command: SettingsSubcommand,
}

#[derive(Subcommand)]
pub enum SettingsSubcommand {
    /// Show the current system settings
    Get {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Replace the system settings with a JSON file (use - for stdin)
    Set {
        /// JSON file holding the settings
        file: PathBuf,
    },

    /// Print the settings every time they change
    Watch {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl SettingsCommand {
    pub async fn run(&self, sync: &DualStoreSync) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            SettingsSubcommand::Get { format } => match sync.get_system_settings().await? {
                Some(settings) => print_record(&settings, format),
                None => {
                    println!("No system settings saved");
                    Ok(())
                }
            },

            SettingsSubcommand::Set { file } => {
                let settings = read_record(file)?;
                sync.save_system_settings(settings).await?;
                println!("Saved system settings");
                Ok(())
            }

            SettingsSubcommand::Watch { format } => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let _subscription = sync.subscribe_settings(move |settings| {
                    let _ = tx.send(settings);
                })?;

                let printer = async {
                    while let Some(settings) = rx.recv().await {
                        print_record(&settings, format)?;
                        println!();
                    }
                    Err::<(), Box<dyn std::error::Error>>(SUBSCRIPTION_ENDED.into())
                };

                tokio::select! {
                    result = printer => result,
                    result = wait_for_interrupt() => result,
                }
            }
        }
    }
}
