mod config_cmd;
mod content;
mod settings;
mod status;
mod user;

pub use config_cmd::ConfigCommand;
pub use content::ContentCommand;
pub use settings::SettingsCommand;
pub use status::StatusCommand;
pub use user::UserCommand;

use clap::ValueEnum;
use std::io::{self, Read, Write};
use std::path::Path;

use dualsync::Record;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Reads a JSON object from `path`, or from stdin when `path` is `-`.
pub fn read_record(path: &Path) -> Result<Record, Box<dyn std::error::Error>> {
    let contents = if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?
    };
    parse_record(&contents)
}

fn parse_record(contents: &str) -> Result<Record, Box<dyn std::error::Error>> {
    match serde_json::from_str(contents)? {
        serde_json::Value::Object(record) => Ok(record),
        _ => Err("Expected a JSON object".into()),
    }
}

/// Prints a record as `key: value` lines or pretty JSON.
pub fn print_record(record: &Record, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(record)?),
        OutputFormat::Text => {
            let width = record.keys().map(|k| k.len()).max().unwrap_or(0);
            for (key, value) in record {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                println!("{:<width$}  {}", key, value, width = width);
            }
        }
    }
    Ok(())
}

/// Asks a yes/no question on stdout.
pub fn confirm(prompt: &str) -> Result<bool, Box<dyn std::error::Error>> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Returned by watch commands when the subscription stops on its own.
pub const SUBSCRIPTION_ENDED: &str = "Subscription ended; see the log for the cause";

/// Blocks until Ctrl-C, keeping live subscriptions running.
pub async fn wait_for_interrupt() -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Watching for changes, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}
