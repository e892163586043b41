//! Chat Client - sends stdin lines, prints what the server relays.
//!
//! This example demonstrates:
//! - Building a [`ClientEndpoint`] with auto-reconnect and backoff
//! - Waiting for the first connection
//! - Pushing typed messages and observing incoming ones
//!
//! Start `chat_server` first; restart it while the client runs to watch the
//! client reconnect on its own.

use std::time::Duration;

use pipelink::{notification_channel, ClientEndpoint, Notification, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// One chat line, shared with the server demo.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct ChatLine {
    from: String,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let (observer, mut events) = notification_channel::<ChatLine>();
    let client = ClientEndpoint::<ChatLine>::builder("pipelink_chat")
        .auto_reconnect(true)
        .reconnect_policy(ReconnectPolicy::backoff())
        .observer(observer)
        .build();

    client.start();
    if !client.wait_for_connected(Some(Duration::from_secs(10))).await {
        eprintln!("no chat server found");
        return Ok(());
    }

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Notification::Message(_, line) => println!("[{}] {}", line.from, line.text),
                Notification::Connected(conn) => println!("* connected as {}", conn.name()),
                Notification::Disconnected(Some(_)) => println!("* disconnected"),
                Notification::Disconnected(None) => {}
                Notification::Error(e) => eprintln!("* error: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(text) = lines.next_line().await? {
        let line = ChatLine {
            from: String::new(),
            text,
        };
        if let Err(e) = client.push(&line).await {
            eprintln!("* not sent: {}", e);
        }
    }

    client.stop();
    Ok(())
}
