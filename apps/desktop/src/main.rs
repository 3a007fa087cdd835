mod config;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{ChatClient, ChatHandle, ClientEvent, SidebarQuery};
use shared::{
    domain::{GroupId, UserId},
    protocol::{MessageDraft, PushEvent},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: Option<String>,
    /// Settings file, defaults to ./chat.toml
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => config::load_settings_from(path),
        None => config::load_settings(),
    };
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(username) = args.username {
        settings.username = Some(username);
    }
    let username = settings
        .username
        .clone()
        .ok_or_else(|| anyhow!("missing username: pass --username or set it in chat.toml"))?;

    let client = ChatClient::with_config(settings.client_config());
    let user_id = client.login(&settings.server_url, &username).await?;
    println!("Logged in as user_id={}", user_id.0);

    client.fetch_users().await?;
    client.fetch_groups().await?;
    client.fetch_unread_counts().await?;
    print_sidebar(&client).await;

    println!("commands: /user <id>, /group <id>, /list, /close, /quit; anything else sends a message");

    let mut events = client.subscribe_events();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => render_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break; };
                if handle_command(&client, line.trim()).await { break; }
            }
        }
    }

    Ok(())
}

async fn print_sidebar(client: &Arc<ChatClient>) {
    let sidebar = client.sidebar(SidebarQuery::default()).await;
    for row in &sidebar.users {
        let presence = if row.online { " [online]" } else { "" };
        let badge = if row.unread > 0 {
            format!(" ({} unread)", row.unread)
        } else {
            String::new()
        };
        println!(
            "  user {:<6} {}{presence}{badge}",
            row.user.user_id.0, row.user.display_name
        );
    }
    for group in &sidebar.groups {
        println!("  group {:<5} {}", group.group_id.0, group.name);
    }
}

fn render_event(event: ClientEvent) {
    match event {
        ClientEvent::Push(PushEvent::NewMessage { message }) => {
            let sender = message
                .sender_id
                .map(|u| u.0.to_string())
                .unwrap_or_else(|| "?".to_string());
            let body = message.text.unwrap_or_else(|| "[image]".to_string());
            println!("[{}] {sender}: {body}", message.sent_at.format("%H:%M"));
        }
        ClientEvent::Push(PushEvent::UserTyping { sender_id }) => {
            println!("(user {} is typing...)", sender_id.0);
        }
        ClientEvent::Push(PushEvent::GroupTyping { sender_id, .. }) => {
            println!("(user {} is typing...)", sender_id.0);
        }
        ClientEvent::UnreadChanged { key, count } => {
            println!("({key}: {count} unread)");
        }
        ClientEvent::SendFailed { reason, .. } => {
            println!("send failed: {reason}");
        }
        ClientEvent::Error(message) => warn!("client error: {message}"),
        _ => {}
    }
}

async fn handle_command(client: &Arc<ChatClient>, line: &str) -> bool {
    if line.is_empty() {
        return false;
    }

    if let Some(rest) = line.strip_prefix("/user ") {
        match rest.trim().parse::<i64>() {
            Ok(id) => open_conversation(client, || client.select_user(UserId(id))).await,
            Err(_) => println!("usage: /user <id>"),
        }
    } else if let Some(rest) = line.strip_prefix("/group ") {
        match rest.trim().parse::<i64>() {
            Ok(id) => open_conversation(client, || client.select_group(GroupId(id))).await,
            Err(_) => println!("usage: /group <id>"),
        }
    } else if line == "/list" {
        print_sidebar(client).await;
    } else if line == "/close" {
        client.clear_selection().await;
        println!("(conversation closed)");
    } else if line == "/quit" {
        return true;
    } else {
        match client.send_message(MessageDraft::text(line)).await {
            Ok(confirmed) => println!("(sent, message_id={})", confirmed.message_id.0),
            Err(err) => println!("send failed: {err}"),
        }
    }

    false
}

async fn open_conversation<F, Fut>(client: &Arc<ChatClient>, select: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    if let Err(err) = select().await {
        println!("failed to open conversation: {err}");
        return;
    }
    let view = client.conversation_view().await;
    for message in &view.messages {
        let sender = message
            .sender_id
            .map(|u| u.0.to_string())
            .unwrap_or_else(|| "?".to_string());
        let body = message
            .text
            .clone()
            .unwrap_or_else(|| "[image]".to_string());
        println!("[{}] {sender}: {body}", message.sent_at.format("%H:%M"));
    }
}
