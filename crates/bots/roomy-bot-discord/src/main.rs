use std::io;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;

use clap::Parser;
use roomy_bot_discord::{
    Bridge, BridgeConfig, BridgeError, DiscordApi as _, DiscordEvent, HttpDiscordApi,
};
use roomy_client::{MemoryTransport, Transport};
use roomy_core::{StreamId, UserDid};
use roomy_kv::KvStore;
use snafu::{ResultExt, Snafu};
use tokio::io::AsyncBufReadExt as _;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "roomy_bot_discord::main";

#[derive(Debug, Snafu)]
pub enum MainError {
    #[snafu(display("Bridge error: {source}"))]
    Bridge { source: BridgeError },
    #[snafu(display("Store error: {source}"))]
    Store { source: roomy_kv::KvError },
    #[snafu(display("Invalid space stream DID"))]
    SpaceId {
        source: roomy_core::id::DidParseError,
    },
    #[snafu(display("Invalid bot DID"))]
    BotId {
        source: roomy_core::id::DidParseError,
    },
    #[snafu(display("Logging initialization failed"))]
    Logging,
    #[snafu(display("Stdin read failed: {source}"))]
    Stdin { source: io::Error },
}

pub type MainResult<T> = std::result::Result<T, MainError>;

/// Discord ↔ Roomy bridge
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,

    /// Discord bot token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    pub discord_token: String,

    /// Discord guild to bridge
    #[arg(long)]
    pub guild_id: String,

    /// Space stream DID to bridge the guild with
    #[arg(long)]
    pub space_stream: String,

    /// The bridge bot's Discord user id
    #[arg(long, default_value = "0")]
    pub bot_user_id: String,

    /// DID the bridge writes stream events under
    #[arg(long, default_value = "did:web:bridge.roomy.space")]
    pub bot_did: String,

    /// Data dir for the bridge's durable state
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Verify Discord credentials by listing the guild's channels
    Check,
    /// Re-populate the channel id map from topic markers
    Recover,
    /// Run the bridge with gateway events read as JSON lines from
    /// stdin, appending to an in-process stream (gateway and leaf
    /// adapters are wired in by the embedding deployment)
    Simulate,
}

#[snafu::report]
#[tokio::main]
async fn main() -> MainResult<()> {
    init_logging()?;

    let opts = Opts::parse();

    let space_stream = StreamId::from_str(&opts.space_stream).context(SpaceIdSnafu)?;
    let bot_did = UserDid::from_str(&opts.bot_did).context(BotIdSnafu)?;
    let discord = Arc::new(HttpDiscordApi::new(&opts.discord_token));

    match opts.command {
        Command::Check => {
            let channels = discord
                .get_channels(&opts.guild_id)
                .await
                .map_err(|source| MainError::Bridge {
                    source: BridgeError::Discord {
                        source,
                        location: snafu::location!(),
                    },
                })?;
            println!("Guild {} has {} bridgeable channels:", opts.guild_id, channels.len());
            for channel in channels {
                println!("  {:>20}  {:?}  {}", channel.id, channel.kind, channel.name);
            }
            Ok(())
        }
        Command::Recover => {
            let bridge = build_bridge(
                &opts,
                space_stream,
                bot_did,
                discord,
                Arc::new(MemoryTransport::new(
                    UserDid::from_str("did:web:bridge.roomy.space").expect("valid"),
                )),
            )
            .await?;
            let recovered = bridge.recover_channels().await.context(BridgeSnafu)?;
            println!("Recovered {recovered} channel mappings");
            Ok(())
        }
        Command::Simulate => {
            let transport = Arc::new(MemoryTransport::new(bot_did.clone()));
            transport.register_stream(space_stream.clone());
            let bridge = Arc::new(
                build_bridge(&opts, space_stream.clone(), bot_did, discord, transport.clone())
                    .await?,
            );
            bridge.register().await.context(BridgeSnafu)?;

            info!(target: LOG_TARGET, "Reading gateway events from stdin (one JSON per line)");
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await.context(StdinSnafu)? {
                if line.trim().is_empty() {
                    continue;
                }
                let event: DiscordEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(err) => {
                        eprintln!("skipping unparsable event: {err}");
                        continue;
                    }
                };
                if let Err(err) = bridge.handle_discord_event(event).await {
                    eprintln!("event failed: {err}");
                }
            }

            let appended = transport.entry_count(&space_stream);
            println!("Appended {appended} stream events");
            Ok(())
        }
    }
}

async fn build_bridge(
    opts: &Opts,
    space_stream: StreamId,
    bot_did: UserDid,
    discord: Arc<HttpDiscordApi>,
    transport: Arc<dyn Transport>,
) -> MainResult<Bridge> {
    let kv = match &opts.data_dir {
        Some(data_dir) => Arc::new(
            KvStore::open(data_dir.join("bridge.redb"))
                .await
                .context(StoreSnafu)?,
        ),
        None => Arc::new(KvStore::open_in_memory().await.context(StoreSnafu)?),
    };
    let config = BridgeConfig {
        guild_id: opts.guild_id.clone(),
        space_stream,
        bot_user_id: opts.bot_user_id.clone(),
        bot_did,
    };
    Ok(Bridge::new(config, kv, discord, transport))
}

pub fn init_logging() -> MainResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| MainError::Logging)?;

    Ok(())
}
