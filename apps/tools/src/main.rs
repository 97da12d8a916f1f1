use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
    },
    ListConversations {
        user_id: i64,
    },
    DeleteConversation {
        conversation_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username } => {
            let username = username.trim();
            if username.is_empty() {
                bail!("username must not be empty");
            }
            let user_id = storage.create_user(username).await?;
            println!("user_id={} username={username}", user_id.0);
        }
        Command::ListConversations { user_id } => {
            let previews = storage.list_conversation_previews(UserId(user_id)).await?;
            if previews.is_empty() {
                println!("no conversations for user_id={user_id}");
            }
            for preview in previews {
                let messages = storage.count_messages(preview.conversation_id).await?;
                println!(
                    "conversation_id={} peer={} (user_id={}) messages={} last={}",
                    preview.conversation_id.0,
                    preview.peer.username,
                    preview.peer.user_id.0,
                    messages,
                    preview.last_message.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::DeleteConversation { conversation_id } => {
            let participants = storage
                .delete_conversation(ConversationId(conversation_id))
                .await?;
            let ids: Vec<String> = participants.iter().map(|id| id.0.to_string()).collect();
            println!(
                "deleted conversation_id={conversation_id} participants=[{}]",
                ids.join(",")
            );
        }
    }

    Ok(())
}
