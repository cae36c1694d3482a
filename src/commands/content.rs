use clap::{Args, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

use dualsync::{DualStoreSync, Record};

use super::{
    confirm, print_record, read_record, wait_for_interrupt, OutputFormat, SUBSCRIPTION_ENDED,
};

#[derive(Args)]
pub struct ContentCommand {
    #[command(subcommand)]
    pub command: ContentSubcommand,
}

#[derive(Subcommand)]
pub enum ContentSubcommand {
    /// Show a chapter's data
    Get {
        /// Chapter key
        key: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Save a chapter's data from a JSON file (use - for stdin)
    Set {
        /// Chapter key
        key: String,

        /// JSON file holding the chapter data
        file: PathBuf,
    },

    /// Save many chapters at once from a JSON object keyed by chapter
    Import {
        /// JSON file mapping chapter keys to their data (use - for stdin)
        file: PathBuf,
    },

    /// Delete a chapter's data from both stores
    Delete {
        /// Chapter key
        key: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Print a chapter's data every time it changes
    Watch {
        /// Chapter key
        key: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ContentCommand {
    pub async fn run(&self, sync: &DualStoreSync) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ContentSubcommand::Get { key, format } => match sync.get_chapter_data(key).await? {
                Some(data) => print_record(&data, format),
                None => Err(format!("Chapter not found: {}", key).into()),
            },

            ContentSubcommand::Set { key, file } => {
                let data = read_record(file)?;
                sync.save_chapter_data(key, data).await?;
                println!("Saved chapter {}", key);
                Ok(())
            }

            ContentSubcommand::Import { file } => {
                let updates = links_from_record(read_record(file)?)?;
                if updates.is_empty() {
                    println!("Nothing to import");
                    return Ok(());
                }

                sync.bulk_save_links(&updates).await?;
                println!("Imported {} chapter(s)", updates.len());
                Ok(())
            }

            ContentSubcommand::Delete { key, force } => {
                if !force && !confirm(&format!("Delete chapter '{}' from both stores?", key))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }

                sync.delete_chapter_data(key).await?;
                println!("Deleted chapter {}", key);
                Ok(())
            }

            ContentSubcommand::Watch { key, format } => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let _subscription = sync.subscribe_chapter_data(key, move |data| {
                    let _ = tx.send(data);
                })?;

                let printer = async {
                    while let Some(data) = rx.recv().await {
                        print_record(&data, format)?;
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

/// Splits `{key: {...}, ...}` into per-chapter records.
fn links_from_record(record: Record) -> Result<BTreeMap<String, Record>, String> {
    record
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::Object(data) => Ok((key, data)),
            _ => Err(format!("Entry '{}' is not a JSON object", key)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_links_from_record() {
        let record = json!({"ch1": {"url": "a"}, "ch2": {"url": "b"}})
            .as_object()
            .cloned()
            .unwrap();
        let links = links_from_record(record).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links["ch2"].get("url"), Some(&json!("b")));
    }

    #[test]
    fn test_links_from_record_rejects_scalar_entries() {
        let record = json!({"ch1": {"url": "a"}, "ch2": "oops"})
            .as_object()
            .cloned()
            .unwrap();
        let err = links_from_record(record).unwrap_err();
        assert!(err.contains("ch2"));
    }
}
