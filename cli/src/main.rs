mod relay_util;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pika_relay_core::envelope::TIMESTAMP_WINDOW_SECS;
use pika_relay_core::{
    DirectMessageOptions, Event, EventBuilder, EventId, Filter, Keys, Kind, MessageCodec,
    PoolOptions, PrivateMessageOptions, PublicKey, QueryOptions, RelayPool, Timestamp,
    conversation_id, conversation_participants, extract_reply_to, extract_subject,
    private_message_rumor, unwrap_many, wrap_for_participants,
};
use pika_relay_profiles::{RelayProfile, app_profile, default_profile};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "pika-relay")]
#[command(about = "Relay pool and private messaging CLI")]
struct Cli {
    /// State directory (identity and pool options live here)
    #[arg(long, default_value = ".pika-relay", env = "PIKA_RELAY_STATE_DIR")]
    state_dir: PathBuf,

    /// Relay websocket URLs (overrides --relays-file and --profile)
    #[arg(long)]
    relay: Vec<String>,

    /// JSON list of relay configs
    #[arg(long)]
    relays_file: Option<PathBuf>,

    /// Built-in relay set used when no relays are given
    #[arg(long, value_enum, default_value_t = Profile::Pikachat)]
    profile: Profile,

    /// Seconds to wait for relays to connect
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Pikachat,
    Public,
}

impl Profile {
    fn relays(self) -> RelayProfile {
        match self {
            Profile::Pikachat => default_profile(),
            Profile::Public => app_profile(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show (or create) identity for this state dir
    Identity,

    /// Connect and print the status of every relay
    Relays,

    /// Query stored events
    Fetch {
        /// Event kind
        #[arg(long)]
        kind: Option<u16>,

        /// Author public key (hex)
        #[arg(long)]
        author: Option<String>,

        /// Max events per relay
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Query deadline in milliseconds
        #[arg(long)]
        max_wait_ms: Option<u64>,
    },

    /// Publish a kind 1 note
    PublishNote {
        #[arg(long)]
        content: String,
    },

    /// Send a private message to one or more peers
    SendDm {
        /// Recipient public key (hex), repeatable
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        /// Message content
        #[arg(long)]
        content: String,

        #[arg(long)]
        subject: Option<String>,

        /// Event id (hex) this message replies to
        #[arg(long)]
        reply_to: Option<String>,

        /// Send a kind 4 message instead of a gift wrap (single recipient only)
        #[arg(long)]
        legacy: bool,
    },

    /// Fetch and decrypt private messages addressed to or sent by this identity
    Inbox {
        /// Max events per relay and filter
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print incoming private messages (runs until interrupted or --timeout)
    Listen {
        /// Timeout in seconds (0 = run forever)
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
    pika_relay_core::init_rustls_crypto_provider();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("create state dir {}", cli.state_dir.display()))?;

    match &cli.cmd {
        Command::Identity => cmd_identity(&cli),
        Command::Relays => cmd_relays(&cli).await,
        Command::Fetch {
            kind,
            author,
            limit,
            max_wait_ms,
        } => cmd_fetch(&cli, *kind, author.as_deref(), *limit, *max_wait_ms).await,
        Command::PublishNote { content } => cmd_publish_note(&cli, content).await,
        Command::SendDm {
            to,
            content,
            subject,
            reply_to,
            legacy,
        } => {
            cmd_send_dm(
                &cli,
                to,
                content,
                subject.clone(),
                reply_to.as_deref(),
                *legacy,
            )
            .await
        }
        Command::Inbox { limit } => cmd_inbox(&cli, *limit).await,
        Command::Listen { timeout } => cmd_listen(&cli, *timeout).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    secret_key_hex: String,
    public_key_hex: String,
}

fn load_or_create_keys(identity_path: &Path) -> anyhow::Result<Keys> {
    if let Ok(raw) = std::fs::read_to_string(identity_path) {
        let f: IdentityFile = serde_json::from_str(&raw).context("parse identity json")?;
        let keys = Keys::parse(&f.secret_key_hex).context("parse secret key hex")?;
        return Ok(keys);
    }

    let keys = Keys::generate();
    let f = IdentityFile {
        secret_key_hex: keys.secret_key().to_secret_hex(),
        public_key_hex: keys.public_key().to_hex(),
    };
    if let Some(parent) = identity_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(
        identity_path,
        format!("{}\n", serde_json::to_string_pretty(&f)?),
    )
    .context("write identity json")?;
    Ok(keys)
}

fn identity(cli: &Cli) -> anyhow::Result<Keys> {
    load_or_create_keys(&cli.state_dir.join("identity.json"))
}

async fn pool(cli: &Cli) -> anyhow::Result<RelayPool> {
    let configs = relay_util::relay_configs(
        &cli.relay,
        cli.relays_file.as_deref(),
        cli.profile.relays(),
    )?;
    let options = PoolOptions::load_from_dir(&cli.state_dir);
    relay_util::connect_pool(&configs, options, Duration::from_secs(cli.connect_timeout)).await
}

fn parse_pubkeys(values: &[String]) -> anyhow::Result<Vec<PublicKey>> {
    values
        .iter()
        .map(|v| PublicKey::from_hex(v.trim()).with_context(|| format!("parse public key: {v}")))
        .collect()
}

fn print(v: serde_json::Value) {
    println!("{v:#}");
}

fn event_json(event: &Event) -> serde_json::Value {
    json!({
        "id": event.id.to_hex(),
        "pubkey": event.pubkey.to_hex(),
        "kind": event.kind.as_u16(),
        "created_at": event.created_at.as_secs(),
        "content": event.content,
    })
}

/// Decrypt whatever private messages `events` hold for `keys`, newest first.
/// Events that cannot be opened are counted, not fatal.
fn open_private_messages(keys: &Keys, events: &[Event]) -> (Vec<serde_json::Value>, usize) {
    let codec = MessageCodec::new(keys.clone());
    let mut rows: Vec<(u64, serde_json::Value)> = Vec::new();
    let mut failed = 0;

    let wraps: Vec<&Event> = events.iter().filter(|e| e.kind == Kind::GIFT_WRAP).collect();
    for (_, result) in unwrap_many(keys, wraps) {
        let Ok(gift) = result else {
            failed += 1;
            continue;
        };
        let rumor = gift.rumor;
        let participants = conversation_participants(&rumor);
        rows.push((
            rumor.created_at.as_secs(),
            json!({
                "scheme": "gift_wrap",
                "conversation_id": conversation_id(&participants),
                "message_id": rumor.id().to_hex(),
                "from_pubkey": gift.sender.to_hex(),
                "content": rumor.content,
                "subject": extract_subject(&rumor.tags),
                "reply_to": extract_reply_to(&rumor.tags).map(|id| id.to_hex()),
                "created_at": rumor.created_at.as_secs(),
            }),
        ));
    }

    for event in events
        .iter()
        .filter(|e| e.kind == Kind::ENCRYPTED_DIRECT_MESSAGE)
    {
        match codec.read_direct_message(event) {
            Ok(dm) => rows.push((
                dm.created_at.as_secs(),
                json!({
                    "scheme": "legacy",
                    "conversation_id": conversation_id([&dm.sender, &dm.recipient]),
                    "message_id": dm.id.to_hex(),
                    "from_pubkey": dm.sender.to_hex(),
                    "content": dm.content,
                    "subject": dm.subject,
                    "reply_to": dm.reply_to.map(|id| id.to_hex()),
                    "created_at": dm.created_at.as_secs(),
                }),
            )),
            Err(e) => {
                tracing::debug!(id = %event.id, "skipping direct message: {e}");
                failed += 1;
            }
        }
    }

    rows.sort_by(|a, b| b.0.cmp(&a.0));
    (rows.into_iter().map(|(_, row)| row).collect(), failed)
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_identity(cli: &Cli) -> anyhow::Result<()> {
    let keys = identity(cli)?;
    print(json!({
        "pubkey": keys.public_key().to_hex(),
    }));
    Ok(())
}

async fn cmd_relays(cli: &Cli) -> anyhow::Result<()> {
    let pool = pool(cli).await?;
    let relays: Vec<serde_json::Value> = pool
        .relays()
        .into_iter()
        .map(|r| {
            json!({
                "url": r.url.as_str(),
                "status": r.status.as_str(),
                "read": r.can_read,
                "write": r.can_write,
            })
        })
        .collect();
    pool.shutdown();
    print(json!({ "relays": relays }));
    Ok(())
}

async fn cmd_fetch(
    cli: &Cli,
    kind: Option<u16>,
    author: Option<&str>,
    limit: usize,
    max_wait_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut filter = Filter::new().limit(limit);
    if let Some(kind) = kind {
        filter = filter.kind(Kind::new(kind));
    }
    if let Some(author) = author {
        let author = PublicKey::from_hex(author.trim())
            .with_context(|| format!("parse author: {author}"))?;
        filter = filter.author(author);
    }

    let pool = pool(cli).await?;
    let mut opts = QueryOptions::new();
    if let Some(ms) = max_wait_ms {
        opts = opts.max_wait(Duration::from_millis(ms));
    }
    let out = pool.query(&pool.readable_relays(), vec![filter], opts).await;
    pool.shutdown();

    print(json!({
        "events": out.events.iter().map(event_json).collect::<Vec<_>>(),
        "completed": out.completed.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
        "timed_out": out.timed_out.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
    }));
    Ok(())
}

async fn cmd_publish_note(cli: &Cli, content: &str) -> anyhow::Result<()> {
    let keys = identity(cli)?;
    let event = EventBuilder::text_note(content)
        .sign_with_keys(&keys)
        .context("sign note")?;

    let pool = pool(cli).await?;
    let accepted = relay_util::publish_and_confirm(&pool, &event, "note").await;
    pool.shutdown();
    let accepted = accepted?;

    print(json!({
        "event_id": event.id.to_hex(),
        "accepted_by": accepted.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
    }));
    Ok(())
}

async fn cmd_send_dm(
    cli: &Cli,
    to: &[String],
    content: &str,
    subject: Option<String>,
    reply_to: Option<&str>,
    legacy: bool,
) -> anyhow::Result<()> {
    let keys = identity(cli)?;
    let recipients = parse_pubkeys(to)?;
    let reply_to = reply_to
        .map(|id| EventId::from_hex(id.trim()).with_context(|| format!("parse reply id: {id}")))
        .transpose()?;

    let events: Vec<Event> = if legacy {
        let [recipient] = recipients.as_slice() else {
            bail!("--legacy supports exactly one recipient");
        };
        let codec = MessageCodec::new(keys.clone());
        vec![
            codec
                .direct_message(recipient, content, DirectMessageOptions { subject, reply_to })
                .context("encrypt direct message")?,
        ]
    } else {
        let rumor = private_message_rumor(
            keys.public_key(),
            &recipients,
            content,
            PrivateMessageOptions {
                subject,
                reply_to,
                ..PrivateMessageOptions::default()
            },
        )
        .context("build private message")?;
        wrap_for_participants(&keys, &rumor)
            .context("gift wrap private message")?
            .into_iter()
            .map(|(_, wrap)| wrap)
            .collect()
    };

    let pool = pool(cli).await?;
    let mut published = Vec::new();
    let mut result = Ok(());
    for event in &events {
        match relay_util::publish_and_confirm(&pool, event, "private message").await {
            Ok(accepted) => published.push(json!({
                "event_id": event.id.to_hex(),
                "accepted_by": accepted.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
            })),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    pool.shutdown();
    result?;

    print(json!({
        "scheme": if legacy { "legacy" } else { "gift_wrap" },
        "recipients": recipients.iter().map(|p| p.to_hex()).collect::<Vec<_>>(),
        "events": published,
    }));
    Ok(())
}

async fn cmd_inbox(cli: &Cli, limit: usize) -> anyhow::Result<()> {
    let keys = identity(cli)?;
    let me = keys.public_key();
    let filters = vec![
        Filter::new().kind(Kind::GIFT_WRAP).pubkey(me).limit(limit),
        Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .pubkey(me)
            .limit(limit),
        Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .author(me)
            .limit(limit),
    ];

    let pool = pool(cli).await?;
    let out = pool
        .query(&pool.readable_relays(), filters, QueryOptions::new())
        .await;
    pool.shutdown();

    let (messages, failed) = open_private_messages(&keys, &out.events);
    print(json!({
        "messages": messages,
        "undecryptable": failed,
        "timed_out": out.timed_out.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
    }));
    Ok(())
}

async fn cmd_listen(cli: &Cli, timeout_sec: u64) -> anyhow::Result<()> {
    let keys = identity(cli)?;
    let me = keys.public_key();
    // Gift wrap timestamps are pushed into the past, so look back that far.
    let since = Timestamp::from_secs(Timestamp::now().as_secs().saturating_sub(TIMESTAMP_WINDOW_SECS));
    let filters = vec![
        Filter::new().kind(Kind::GIFT_WRAP).pubkey(me).since(since),
        Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .pubkey(me)
            .since(Timestamp::now()),
    ];

    let pool = pool(cli).await?;
    let sub = pool.subscribe(&pool.readable_relays(), filters);

    let deadline = async {
        if timeout_sec == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(timeout_sec)).await;
        }
    };
    tokio::pin!(deadline);

    loop {
        let item = tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            item = sub.recv() => item,
        };
        let Some(item) = item else {
            break;
        };
        let (rows, _) = open_private_messages(&keys, std::slice::from_ref(&item.event));
        for mut row in rows {
            row["relay"] = json!(item.relay.as_str());
            println!("{row}");
        }
    }

    drop(sub);
    pool.shutdown();
    if timeout_sec > 0 {
        tracing::info!("listen finished after {timeout_sec}s");
    }
    Ok(())
}
