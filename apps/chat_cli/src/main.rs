use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{ChatSnapshot, ClientEvent, ClientHandle, RealtimeClient, ViewState};
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server_url: String,
    #[arg(long)]
    username: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Users,
    List,
    Open(UserId),
    Send(String),
    Delete(ConversationId),
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (head, rest) = line
        .split_once(char::is_whitespace)
        .map(|(head, rest)| (head, rest.trim()))
        .unwrap_or((line, ""));
    let command = match head {
        "users" => Command::Users,
        "list" => Command::List,
        "open" => Command::Open(UserId(parse_id(rest, "open <userId>")?)),
        "send" => Command::Send(rest.to_string()),
        "delete" => Command::Delete(ConversationId(parse_id(rest, "delete <conversationId>")?)),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ if head.starts_with('/') => return Err(anyhow!("unknown command: {head}")),
        _ => Command::Send(line.to_string()),
    };
    Ok(Some(command))
}

fn parse_id(raw: &str, usage: &str) -> Result<i64> {
    raw.parse().map_err(|_| anyhow!("usage: {usage}"))
}

/// Prints confirmed messages of the open conversation exactly once.
#[derive(Default)]
struct Transcript {
    conversation_id: Option<ConversationId>,
    peer: Option<UserId>,
    shown: HashSet<MessageId>,
}

impl Transcript {
    fn render(&mut self, snapshot: &ChatSnapshot) {
        let peer = snapshot.view.peer().map(|peer| peer.id);
        let conversation_id = snapshot.view.conversation_id();
        if peer != self.peer {
            self.shown.clear();
            match &snapshot.view {
                ViewState::NoConversationSelected => println!("-- no conversation open"),
                ViewState::Loading { peer, .. } | ViewState::Ready { peer, .. } => {
                    println!("-- chatting with {} (user {})", peer.name, peer.id.0)
                }
            }
        } else if self.conversation_id.is_some() && conversation_id.is_none() {
            self.shown.clear();
        }
        self.peer = peer;
        self.conversation_id = conversation_id;

        for message in &snapshot.messages {
            let Some(id) = message.durable_id() else {
                continue;
            };
            if !self.shown.insert(id) {
                continue;
            }
            let who = if message.sender_id() == snapshot.user_id {
                "me".to_string()
            } else {
                snapshot
                    .view
                    .peer()
                    .map(|peer| peer.name.clone())
                    .unwrap_or_else(|| format!("user {}", message.sender_id().0))
            };
            println!("[{who}] {}", message.content());
        }
    }
}

fn print_help() {
    println!("commands: users | list | open <userId> | send <text> | delete <conversationId> | quit");
    println!("plain text is sent to the open conversation");
}

async fn run_command(client: &Arc<RealtimeClient>, command: Command) -> Result<bool> {
    match command {
        Command::Users => {
            for user in client.list_users().await? {
                println!("user {}: {}", user.id.0, user.name);
            }
        }
        Command::List => {
            let previews = client.refresh_conversations().await?;
            if previews.is_empty() {
                println!("no conversations yet");
            }
            for preview in previews {
                println!(
                    "conversation {} with {}: {}",
                    preview.id.0,
                    preview.user.name,
                    preview.last_message.as_deref().unwrap_or("(no messages)")
                );
            }
        }
        Command::Open(user_id) => {
            let peer = client
                .list_users()
                .await?
                .into_iter()
                .find(|user| user.id == user_id)
                .ok_or_else(|| anyhow!("no user with id {}", user_id.0))?;
            client.select_peer(peer).await?;
        }
        Command::Send(text) => client.send_message(&text).await?,
        Command::Delete(conversation_id) => {
            client.delete_conversation(conversation_id).await?;
            println!("deleted conversation {}", conversation_id.0);
        }
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let client = RealtimeClient::new();
    let mut events = client.subscribe_events();
    let identity = client.login(&args.server_url, &args.username).await?;
    println!("logged in as {} (user {})", identity.name, identity.user_id.0);
    print_help();

    tokio::spawn(async move {
        let mut transcript = Transcript::default();
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::StateChanged(snapshot) => transcript.render(&snapshot),
                ClientEvent::Connected => println!("-- connected"),
                ClientEvent::Disconnected => println!("-- disconnected, retrying"),
                ClientEvent::Error(err) => eprintln!("error: {err}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        match run_command(&client, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("error: {err}"),
        }
    }

    client.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_plain_text() {
        assert_eq!(parse_command("  ").expect("parse"), None);
        assert_eq!(parse_command("users").expect("parse"), Some(Command::Users));
        assert_eq!(
            parse_command("open 7").expect("parse"),
            Some(Command::Open(UserId(7)))
        );
        assert_eq!(
            parse_command("delete 12").expect("parse"),
            Some(Command::Delete(ConversationId(12)))
        );
        assert_eq!(
            parse_command("send  hello there ").expect("parse"),
            Some(Command::Send("hello there".into()))
        );
        assert_eq!(
            parse_command("hello there").expect("parse"),
            Some(Command::Send("hello there".into()))
        );
        assert_eq!(parse_command("quit").expect("parse"), Some(Command::Quit));
    }

    #[test]
    fn rejects_bad_ids_and_unknown_slash_commands() {
        assert!(parse_command("open bob").is_err());
        assert!(parse_command("delete").is_err());
        assert!(parse_command("/nope").is_err());
    }
}
