use clap::Args;

use dualsync::DualStoreSync;

use super::OutputFormat;

#[derive(Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl StatusCommand {
    pub async fn run(&self, sync: &DualStoreSync) -> Result<(), Box<dyn std::error::Error>> {
        let status = sync.check_connection().await?;
        let user = sync.current_user();

        match self.format {
            OutputFormat::Json => {
                let report = serde_json::json!({
                    "documentStore": status.document_store,
                    "treeStore": status.tree_store,
                    "user": user,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Text => {
                let label = |ok: bool| if ok { "reachable" } else { "unreachable" };
                println!("Document store: {}", label(status.document_store));
                println!("Tree store:     {}", label(status.tree_store));
                match &user {
                    Some(user) => println!(
                        "Signed in as:   {}",
                        user.email.as_deref().unwrap_or(&user.uid)
                    ),
                    None => println!("Signed in as:   (anonymous)"),
                }
            }
        }

        if status.is_connected() {
            Ok(())
        } else {
            Err("One or more stores are unreachable".into())
        }
    }
}
