mod identity;
mod relay_util;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use courier_core::{
    load_config, parse_pubkey, DmConfig, DmMessage, DmSync, DmSyncParams, DmUpdate,
    MessageProtocol, SendRequest, SqliteCache,
};
use nostr_sdk::prelude::*;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "courier")]
#[command(about = "Encrypted direct-message sync for Nostr (NIP-04 and NIP-17)")]
struct Cli {
    /// State directory (identity, config and DM cache persist here between runs)
    #[arg(long, default_value = ".courier")]
    state_dir: PathBuf,

    /// Relay websocket URLs; overrides the config file
    #[arg(long)]
    relay: Vec<String>,

    /// Secret key (hex or nsec); defaults to the identity stored in the state dir
    #[arg(long, env = "COURIER_NSEC", hide_env_values = true)]
    nsec: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show (or create) identity for this state dir
    Identity,

    /// Load cache, scan relays and print conversation summaries
    Sync,

    /// Print the newest page of one conversation
    Messages {
        /// Partner public key (hex or npub)
        #[arg(long)]
        peer: String,

        /// Number of pages to load, newest first
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },

    /// Send a direct message
    Send {
        /// Recipient public key (hex or npub)
        #[arg(long)]
        peer: String,

        /// Message content
        #[arg(long)]
        content: String,

        /// Send as a NIP-17 gift wrap instead of NIP-04
        #[arg(long)]
        nip17: bool,
    },

    /// Print new messages as JSON lines (runs until interrupted or --timeout)
    Listen {
        /// Timeout in seconds (0 = run forever)
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Drop the DM cache for this identity
    ClearCache {
        /// Defer the clear until the next start instead of clearing now
        #[arg(long)]
        next_start: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    courier_core::init_logging(&cli.state_dir);
    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("create state dir {}", cli.state_dir.display()))?;

    match &cli.cmd {
        Command::Identity => cmd_identity(&cli),
        Command::Sync => cmd_sync(&cli).await,
        Command::Messages { peer, pages } => cmd_messages(&cli, peer, *pages).await,
        Command::Send {
            peer,
            content,
            nip17,
        } => cmd_send(&cli, peer, content, *nip17).await,
        Command::Listen { timeout } => cmd_listen(&cli, *timeout).await,
        Command::ClearCache { next_start } => cmd_clear_cache(&cli, *next_start).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn keys(cli: &Cli) -> anyhow::Result<Keys> {
    match &cli.nsec {
        Some(secret) => Keys::parse(secret.trim()).context("parse --nsec"),
        None => identity::load_or_create_keys(&cli.state_dir.join("identity.json")),
    }
}

fn config(cli: &Cli) -> anyhow::Result<DmConfig> {
    let mut config = load_config(&cli.state_dir);
    if !cli.relay.is_empty() {
        relay_util::parse_relay_urls(&cli.relay)?;
        config.relay_urls = Some(cli.relay.clone());
    }
    Ok(config)
}

/// Engine plus the client backing it; callers shut the client down when done.
async fn open(cli: &Cli) -> anyhow::Result<(Keys, DmSync, Client)> {
    let keys = keys(cli)?;
    let config = config(cli)?;
    tracing::debug!(relays = ?config.relay_set(), "opening dm engine");
    let client = relay_util::connect_client(&keys, &config.relay_urls()).await?;
    let cache = SqliteCache::open(&cli.state_dir).context("open dm cache")?;
    let sync = DmSync::new(DmSyncParams {
        data_dir: cli.state_dir.clone(),
        config,
        identity: keys.public_key(),
        signer: Arc::new(keys.clone()),
        transport: Arc::new(client.clone()),
        cache: Arc::new(cache),
    });
    Ok((keys, sync, client))
}

async fn close(sync: &DmSync, client: &Client) {
    sync.shutdown().await;
    client.shutdown().await;
}

fn peer(input: &str) -> anyhow::Result<PublicKey> {
    parse_pubkey(input).ok_or_else(|| anyhow!("invalid public key: {input}"))
}

fn message_json(partner: &PublicKey, message: &DmMessage) -> serde_json::Value {
    json!({
        "partner": partner.to_hex(),
        "id": message.id,
        "from_pubkey": message.pubkey.to_hex(),
        "protocol": message.protocol.label(),
        "kind": message.kind.as_u16(),
        "created_at": message.created_at,
        "content": message.decrypted_content,
        "error": message.error.as_ref().map(|e| e.to_string()),
    })
}

fn print(v: serde_json::Value) {
    match serde_json::to_string_pretty(&v) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("json encode failed: {e}"),
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_identity(cli: &Cli) -> anyhow::Result<()> {
    let keys = keys(cli)?;
    print(json!({
        "pubkey": keys.public_key().to_hex(),
        "npub": keys.public_key().to_bech32().unwrap_or_default(),
    }));
    Ok(())
}

async fn cmd_sync(cli: &Cli) -> anyhow::Result<()> {
    let (_keys, sync, client) = open(cli).await?;
    sync.start().await;

    let conversations: Vec<serde_json::Value> = sync
        .conversations()
        .iter()
        .map(|c| {
            json!({
                "partner": c.partner.to_hex(),
                "last_activity": c.last_activity,
                "last_message": c.last_message.as_ref().map(|m| m.text().to_string()),
                "nip04": c.has_nip04,
                "nip17": c.has_nip17,
                "request": c.is_request,
            })
        })
        .collect();
    let status = sync.status();
    close(&sync, &client).await;

    print(json!({
        "conversations": conversations,
        "last_sync": {
            "nip04": status.last_sync.nip04,
            "nip17": status.last_sync.nip17,
        },
    }));
    Ok(())
}

async fn cmd_messages(cli: &Cli, peer_str: &str, pages: usize) -> anyhow::Result<()> {
    let partner = peer(peer_str)?;
    let (_keys, sync, client) = open(cli).await?;
    sync.start().await;

    let mut view = sync.new_view();
    view.select(Some(partner));
    for _ in 1..pages.max(1) {
        view.load_earlier();
    }
    let page = sync.page(&view);
    close(&sync, &client).await;

    print(json!({
        "partner": partner.to_hex(),
        "total": page.total_count,
        "has_more": page.has_more_messages,
        "messages": page
            .messages
            .iter()
            .map(|m| message_json(&partner, m))
            .collect::<Vec<_>>(),
    }));
    Ok(())
}

async fn cmd_send(cli: &Cli, peer_str: &str, content: &str, nip17: bool) -> anyhow::Result<()> {
    let recipient = peer(peer_str)?;
    let (_keys, sync, client) = open(cli).await?;
    let protocol = if nip17 {
        MessageProtocol::Nip17
    } else {
        MessageProtocol::Nip04
    };
    let result = sync
        .send_message(SendRequest::text(recipient, content).with_protocol(protocol))
        .await;
    close(&sync, &client).await;
    result.context("send message")?;

    print(json!({
        "recipient": recipient.to_hex(),
        "protocol": protocol.label(),
    }));
    Ok(())
}

async fn cmd_listen(cli: &Cli, timeout_sec: u64) -> anyhow::Result<()> {
    let (_keys, sync, client) = open(cli).await?;
    let updates = sync.updates();
    sync.start().await;

    let mut seen: HashSet<String> = sync
        .store()
        .snapshot()
        .values()
        .flat_map(|c| c.messages.iter().map(|m| m.dedup_key().to_string()))
        .collect();

    let deadline = (timeout_sec > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(timeout_sec));

    loop {
        let next = updates.recv_async();
        let update = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = async {
                match deadline {
                    Some(dl) => tokio::time::sleep_until(dl).await,
                    None => std::future::pending::<()>().await,
                }
            } => break,
            update = next => match update {
                Ok(update) => update,
                Err(_) => break,
            },
        };
        if !matches!(update, DmUpdate::ConversationsChanged { .. }) {
            continue;
        }
        for (partner, conversation) in sync.store().snapshot().iter() {
            for message in &conversation.messages {
                if message.is_sending || !seen.insert(message.dedup_key().to_string()) {
                    continue;
                }
                match serde_json::to_string(&message_json(partner, message)) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("json encode failed: {e}"),
                }
            }
        }
    }

    close(&sync, &client).await;
    Ok(())
}

async fn cmd_clear_cache(cli: &Cli, next_start: bool) -> anyhow::Result<()> {
    let (_keys, sync, client) = open(cli).await?;
    if next_start {
        sync.request_clear_on_next_start()
            .context("write clear marker")?;
    } else {
        sync.clear_cache().await;
    }
    client.shutdown().await;
    print(json!({ "cleared": !next_start, "deferred": next_start }));
    Ok(())
}
