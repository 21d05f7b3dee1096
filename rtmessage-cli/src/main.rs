//! CLI for the rtmessage bus.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rtmessage::{CancellationToken, Connection, Message};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "RTMESSAGE_LOG";

#[derive(Parser)]
#[command(name = "rtmessage", version, about = "Talk to an rtmessage router")]
struct Cli {
    /// Router address (`unix:///path` or `tcp://host:port`).
    #[arg(long, global = true, default_value = "unix:///tmp/rtrouted")]
    url: String,

    /// Application name used for the private inbox.
    #[arg(long, global = true, default_value = "rtmessage_cli")]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every message delivered to this client until interrupted.
    Listen {
        /// Topic to subscribe to. Repeatable; the inbox is always included.
        #[arg(short, long = "topic")]
        topics: Vec<String>,
    },

    /// Publish a single message.
    Send {
        /// Destination topic.
        topic: String,
        /// Payload, sent as UTF-8 bytes.
        payload: String,
    },

    /// Send a request and print the reply.
    Request {
        /// Destination topic.
        topic: String,
        /// Payload, sent as UTF-8 bytes.
        payload: String,
        /// Seconds to wait for the reply.
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("rtmessage: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Listen { topics } => listen(&self.url, &self.name, topics).await,
            Command::Send { topic, payload } => send(&self.url, &self.name, topic, payload).await,
            Command::Request {
                topic,
                payload,
                wait,
            } => request(&self.url, &self.name, topic, payload, wait).await,
        }
    }
}

async fn listen(url: &str, name: &str, topics: Vec<String>) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (err_tx, mut errors) = mpsc::unbounded_channel();
    let conn = Connection::builder(url, name)
        .subscriptions(topics)
        .message_listener(move |m: &Message| {
            let _ = tx.send(m.clone());
        })
        .error_listener(move |e: &rtmessage::Error| {
            let _ = err_tx.send(e.to_string());
        })
        .build()?;
    conn.connect()
        .await
        .with_context(|| format!("connecting to {url}"))?;
    eprintln!("listening on {} (inbox {})", conn.endpoint(), conn.inbox());

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => print_message(&msg),
            Some(err) = errors.recv() => anyhow::bail!("connection lost: {err}"),
            r = tokio::signal::ctrl_c() => {
                r.context("waiting for interrupt")?;
                break;
            }
        }
    }
    conn.disconnect().await?;
    Ok(())
}

async fn send(url: &str, name: &str, topic: String, payload: String) -> Result<()> {
    let conn = Connection::builder(url, name).build()?;
    conn.connect()
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let seq = conn
        .send(Message::new(topic, payload), &CancellationToken::new())
        .await?;
    eprintln!("sent seq {seq}");
    conn.disconnect().await?;
    Ok(())
}

async fn request(url: &str, name: &str, topic: String, payload: String, wait: u64) -> Result<()> {
    let conn = Connection::builder(url, name).build()?;
    conn.connect()
        .await
        .with_context(|| format!("connecting to {url}"))?;

    let (tx, reply) = oneshot::channel();
    let id = conn
        .request(
            payload,
            topic.as_str(),
            move |m| {
                let _ = tx.send(m);
            },
            &CancellationToken::new(),
        )
        .await?;

    let outcome = tokio::time::timeout(Duration::from_secs(wait), reply).await;
    conn.forget(id);
    conn.disconnect().await?;
    match outcome {
        Ok(Ok(msg)) if msg.is_undeliverable() => anyhow::bail!("no responder for '{topic}'"),
        Ok(Ok(msg)) => {
            print_message(&msg);
            Ok(())
        }
        Ok(Err(_)) => anyhow::bail!("connection closed before a reply arrived"),
        Err(_) => anyhow::bail!("no reply from '{topic}' within {wait}s"),
    }
}

fn print_message(msg: &Message) {
    println!(
        "{} seq={} flags={:?} {}",
        msg.topic,
        msg.sequence_number,
        msg.flags,
        String::from_utf8_lossy(&msg.payload)
    );
}
