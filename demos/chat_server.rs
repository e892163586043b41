//! Chat Server - relays every line to every connected client.
//!
//! This example demonstrates:
//! - Starting a [`Listener`] on a well-known name
//! - Consuming events through `notification_channel`
//! - Broadcasting and addressing one client by its display name
//!
//! # Running
//!
//! ```text
//! RUST_LOG=pipelink=debug cargo run --example chat_server
//! cargo run --example chat_client   # in as many terminals as you like
//! ```

use pipelink::{notification_channel, Listener, Notification};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// One chat line, shared with the client demo.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct ChatLine {
    from: String,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (observer, mut events) = notification_channel::<ChatLine>();
    let listener = Listener::<ChatLine>::builder("pipelink_chat")
        .observer(observer)
        .build();
    listener.start()?;
    println!("listening on {}", listener.endpoint());

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Notification::Connected(conn) => {
                let welcome = ChatLine {
                    from: "server".into(),
                    text: format!("welcome, you are {}", conn.name()),
                };
                if let Err(e) = listener.push_to(&welcome, &conn.name()).await {
                    eprintln!("welcome to {} failed: {}", conn.name(), e);
                }
                println!("+ {} ({} online)", conn.name(), listener.len());
            }
            Notification::Disconnected(Some(conn)) => {
                println!("- {} ({} online)", conn.name(), listener.len());
            }
            Notification::Disconnected(None) => {}
            Notification::Message(conn, line) => {
                let relayed = ChatLine {
                    from: conn.name(),
                    text: line.text,
                };
                let delivered = listener.broadcast(&relayed).await?;
                println!("{}: {} (to {})", relayed.from, relayed.text, delivered);
            }
            Notification::Error(e) => eprintln!("error: {}", e),
        }
    }

    listener.stop().await;
    Ok(())
}
