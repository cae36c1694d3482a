use chrono::Utc;
use clap::{Args, Subcommand};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

use dualsync::models::from_record;
use dualsync::{DualStoreSync, Record, TestAttempt, User};

use super::{
    confirm, print_record, read_record, wait_for_interrupt, OutputFormat, SUBSCRIPTION_ENDED,
};

#[derive(Args)]
pub struct UserCommand {
    #[command(subcommand)]
    pub command: UserSubcommand,
}

#[derive(Subcommand)]
pub enum UserSubcommand {
    /// List all users
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a user by id
    Get {
        /// User ID
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Find a user by email
    Find {
        /// Email address
        email: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Save a user from a JSON file (use - for stdin)
    Save {
        /// JSON file holding the user record
        file: PathBuf,

        /// User ID (overrides any id in the file)
        #[arg(long)]
        id: Option<String>,
    },

    /// Delete a user from both stores
    Delete {
        /// User ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Mark a user as active now
    Touch {
        /// User ID
        id: String,
    },

    /// Record a test attempt for a user
    Result {
        /// User ID
        user_id: String,

        /// Test ID
        test_id: String,

        /// JSON file with the attempt's other fields (use - for stdin)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Print the user list every time it changes
    Watch {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl UserCommand {
    pub async fn run(&self, sync: &DualStoreSync) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            UserSubcommand::List { format } => {
                let (tx, rx) = oneshot::channel();
                let mut tx = Some(tx);
                let subscription = sync.subscribe_users(move |users| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(users);
                    }
                })?;
                let users = rx.await?;
                subscription.unsubscribe();

                print_users(&users, format)
            }

            UserSubcommand::Get { id, format } => match sync.get_user(id).await? {
                Some(user) => print_user(&user, format),
                None => Err(format!("User not found: {}", id).into()),
            },

            UserSubcommand::Find { email, format } => match sync.get_user_by_email(email).await? {
                Some(user) => print_user(&user, format),
                None => Err(format!("No user with email: {}", email).into()),
            },

            UserSubcommand::Save { file, id } => {
                let mut user: User = from_record(read_record(file)?)?;
                if let Some(id) = id {
                    user.id = id.clone();
                }
                if user.id.is_empty() {
                    return Err("User has no id. Add one to the file or pass --id.".into());
                }

                sync.save_user(&user).await?;
                println!("Saved user {}", user.id);
                Ok(())
            }

            UserSubcommand::Delete { id, force } => {
                if !force && !confirm(&format!("Delete user '{}' from both stores?", id))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }

                sync.delete_user(id).await?;
                println!("Deleted user {}", id);
                Ok(())
            }

            UserSubcommand::Touch { id } => {
                sync.update_user_status(id, Utc::now().timestamp_millis())
                    .await?;
                println!("Updated last active time for {}", id);
                Ok(())
            }

            UserSubcommand::Result {
                user_id,
                test_id,
                file,
            } => {
                let mut attempt = TestAttempt::new(test_id.clone());
                if let Some(file) = file {
                    let mut fields: Record = read_record(file)?;
                    fields.remove("testId");
                    attempt.extra = fields;
                }

                let path = sync.save_test_result(user_id, &attempt).await?;
                println!("Saved test result {}", path);
                Ok(())
            }

            UserSubcommand::Watch { format } => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let _subscription = sync.subscribe_users(move |users| {
                    let _ = tx.send(users);
                })?;

                let printer = async {
                    while let Some(users) = rx.recv().await {
                        print_users(&users, format)?;
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

fn print_user(user: &User, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    print_record(&dualsync::models::to_record(user)?, format)
}

fn print_users(users: &[User], format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(users)?);
        }
        OutputFormat::Text => {
            if users.is_empty() {
                println!("No users found");
                return Ok(());
            }

            println!("{:<28}  {:<32}  LAST ACTIVE", "ID", "EMAIL");
            println!("{}", "-".repeat(86));
            for user in users {
                let last_active = match &user.last_active_time {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "-".to_string(),
                };
                println!(
                    "{:<28}  {:<32}  {}",
                    user.id,
                    user.email.as_deref().unwrap_or("-"),
                    last_active
                );
            }
            println!("\nTotal: {} user(s)", users.len());
        }
    }
    Ok(())
}
