use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, AvatarUpload, ChatClient, ClientEvent, ConnectionState, CreateOutcome,
    SendOutcome,
};
use shared::domain::{ChatId, PeerProfile, UserId};
use tokio::{sync::broadcast::error::RecvError, time};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal front end for the chat client core")]
struct Args {
    /// Settings file; defaults to ./chat_client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Access token for the chat backend.
    #[arg(long, env = "CHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange username and password for an access token.
    Login { username: String, password: String },
    /// List chats, most recently active first.
    Chats {
        #[arg(long, default_value = "")]
        filter: String,
    },
    /// Print the history of a chat.
    History { chat_id: i64 },
    Send { chat_id: i64, text: String },
    Create {
        participants: Vec<i64>,
        #[arg(long)]
        group: bool,
        #[arg(long)]
        name: Option<String>,
    },
    Search { term: String },
    /// Upload a new avatar image.
    Avatar { path: PathBuf },
    /// Tell every running client to drop cached avatars.
    Invalidate {
        #[arg(long)]
        user: Option<i64>,
    },
    /// Print live events until interrupted.
    Watch,
}

const CONNECT_WAIT: Duration = Duration::from_secs(10);
const SEARCH_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let settings = load_settings(args.config.as_deref())?;
    let client = ChatClient::new(&settings);

    if let Command::Login { username, password } = &args.command {
        let pair = client
            .obtain_token(username, password)
            .await
            .context("token request failed")?;
        println!("{}", pair.access);
        return Ok(());
    }

    let Some(token) = args.token else {
        bail!("an access token is required (--token or CHAT_TOKEN)");
    };
    let me = client.login(token).await.context("login failed")?;
    println!("Logged in as {} (user_id={})", me.username, me.id);

    let result = run(&client, args.command).await;
    client.logout().await;
    result
}

async fn run(client: &Arc<ChatClient>, command: Command) -> Result<()> {
    match command {
        Command::Login { .. } => bail!("token exchange does not need a session"),
        Command::Chats { filter } => {
            client.load_chats().await?;
            for chat in client.filtered_chats(&filter).await {
                let title = client
                    .store()
                    .chat_title(chat.id)
                    .await
                    .unwrap_or_else(|| format!("chat {}", chat.id));
                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|m| m.text.as_str())
                    .unwrap_or("");
                println!("{:>6}  {:<32} {}", chat.id, title, preview);
            }
        }
        Command::History { chat_id } => {
            client.load_chats().await?;
            let messages = client.select_chat(ChatId(chat_id)).await?;
            for message in messages {
                let sender = match client.directory().resolve_profile_now(message.sender).await {
                    Ok(profile) => sender_label(&profile),
                    Err(err) => {
                        tracing::debug!(
                            user_id = %message.sender,
                            error = %err,
                            "chat_cli: profile lookup failed"
                        );
                        format!("user {}", message.sender)
                    }
                };
                println!(
                    "[{}] {}: {}",
                    message.sent_at.format("%Y-%m-%d %H:%M"),
                    sender,
                    message.text
                );
            }
        }
        Command::Send { chat_id, text } => {
            wait_connected(client, CONNECT_WAIT).await;
            client.load_chats().await?;
            match client.send_message(ChatId(chat_id), &text).await? {
                SendOutcome::Dispatched => println!("sent over the live channel"),
                SendOutcome::Delivered(message) => println!("stored as message {}", message.id),
            }
        }
        Command::Create {
            participants,
            group,
            name,
        } => {
            wait_connected(client, CONNECT_WAIT).await;
            let ids: Vec<UserId> = participants.into_iter().map(UserId).collect();
            match client.create_chat(&ids, name.as_deref(), group).await? {
                CreateOutcome::Created(chat) => println!("created chat {}", chat.id),
                CreateOutcome::Requested => {
                    println!("creation requested; the chat arrives as a live event")
                }
            }
        }
        Command::Search { term } => {
            let mut events = client.subscribe_events();
            wait_connected(client, CONNECT_WAIT).await;
            if !client.search_users(&term).await {
                bail!("search needs a non-empty term and a live connection");
            }
            let found = time::timeout(SEARCH_WAIT, async {
                loop {
                    match events.recv().await {
                        Ok(ClientEvent::SearchResults(profiles)) => return Some(profiles),
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return None,
                    }
                }
            })
            .await
            .ok()
            .flatten()
            .context("no search results received")?;
            for profile in found {
                println!("{:>6}  {:<24} {}", profile.id, profile.display_name, profile.handle);
            }
        }
        Command::Avatar { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read '{}'", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("avatar")
                .to_string();
            let profile = client
                .upload_avatar(AvatarUpload {
                    filename,
                    mime_type: None,
                    bytes,
                })
                .await?;
            println!("avatar now at {}", profile.avatar_url);
        }
        Command::Invalidate { user } => {
            let record = client.invalidate_avatars(user.map(UserId)).await?;
            println!("invalidation published at {}", record.written_at_ms);
        }
        Command::Watch => {
            let mut events = client.subscribe_events();
            client.load_chats().await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => println!("{}", describe(client, &event)),
                        Err(RecvError::Lagged(skipped)) => println!("({skipped} events skipped)"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}

/// Waits briefly for the live channel; commands fall back to REST when it
/// does not come up. Returns whether the channel is authenticated.
async fn wait_connected(client: &ChatClient, wait: Duration) -> bool {
    let mut status = client.subscribe_status();
    let settled = time::timeout(
        wait,
        status.wait_for(|s| s.is_authenticated() || s.fault.is_some()),
    )
    .await
    .is_ok();
    let current = client.connection_status();
    let ready = current.state == ConnectionState::Authenticated;
    if !ready {
        tracing::warn!(settled, fault = ?current.fault, "chat_cli: live channel unavailable");
    }
    ready
}

/// Display name, or the numeric id while the profile is unknown.
fn sender_label(profile: &PeerProfile) -> String {
    if profile.is_placeholder() {
        format!("user {}", profile.id)
    } else {
        profile.display_name.clone()
    }
}

fn describe(client: &ChatClient, event: &ClientEvent) -> String {
    match event {
        ClientEvent::ConnectionChanged(status) => match &status.fault {
            Some(fault) => format!("connection {:?} ({fault:?})", status.state),
            None => format!("connection {:?}", status.state),
        },
        ClientEvent::MessageAppended(message) => format!(
            "#{} {}: {}",
            message.chat,
            sender_label(&client.resolve_profile(message.sender)),
            message.text
        ),
        ClientEvent::ChatCreated(chat) => format!("new chat {}", chat.id),
        ClientEvent::PresenceChanged(ids) => ids
            .iter()
            .map(|id| {
                let state = if client.is_online(*id) { "online" } else { "offline" };
                format!("{} is {state}", sender_label(&client.resolve_profile(*id)))
            })
            .collect::<Vec<_>>()
            .join(", "),
        ClientEvent::RemoteError(notice) => format!("server error: {}", notice.message),
        ClientEvent::SessionExpired => "session expired; log in again".to_string(),
        other => format!("{other:?}"),
    }
}
