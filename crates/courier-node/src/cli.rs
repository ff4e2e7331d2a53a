use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_cipher::{is_ciphertext_likely, CipherCodec};
use courier_notify::{
    FileMarkerStore, FilePreferenceStore, NotificationCoordinator, NotifyOnInsert,
};
use courier_proto::ConversationId;
use courier_realtime::{ChannelState, ChannelSubscriptionManager, Scheduler, TokioScheduler};
use tracing::{error, info, warn};

use crate::config::{LogFormat, NodeConfig};
use crate::handler::NodeHandler;
use crate::surface::StdoutSurface;
use crate::tcp_feed::TcpFeedTransport;

#[derive(Parser, Debug)]
#[command(name = "courier-node")]
#[command(about = "Courier message delivery and notification node", long_about = None)]
pub struct Cli {
    /// TOML or JSON configuration file.
    #[arg(short, long, env = "COURIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Shared cipher secret.
    #[arg(long, env = "COURIER_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow the feed and render notifications.
    Run {
        /// Feed address, `host:port`.
        #[arg(long)]
        feed: Option<String>,
        /// State directory shared by instances that should dedup together.
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Only deliver messages of this conversation.
        #[arg(long)]
        conversation: Option<String>,
        /// Signed-in user id.
        #[arg(long)]
        identity: Option<String>,
    },
    /// Encode plaintext for storage.
    Encode { conversation: String, text: String },
    /// Decode stored content for display.
    Decode { conversation: String, text: String },
    /// Report whether text looks like ciphertext.
    Check { text: String },
}

impl Cli {
    /// Resolves the effective configuration: file, then CLI overrides.
    pub fn resolve_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load_or_default(self.config.as_deref())?;
        if let Some(secret) = &self.secret {
            config.secret = Some(secret.clone());
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Command::Run {
            feed,
            state_dir,
            conversation,
            identity,
        } = &self.command
        {
            if let Some(feed) = feed {
                config.feed_addr = feed.clone();
            }
            if let Some(dir) = state_dir {
                config.state_dir = dir.clone();
            }
            if let Some(conversation) = conversation {
                config.realtime.conversation_filter = Some(ConversationId::from(conversation.as_str()));
            }
            if let Some(identity) = identity {
                config.identity = Some(identity.clone());
            }
        }
        Ok(config)
    }

    pub async fn run(self, config: NodeConfig) -> Result<()> {
        match &self.command {
            Command::Run { .. } => run_node(config).await,
            Command::Encode { conversation, text } => {
                let codec = codec(&config)?;
                println!("{}", codec.encode(text, &ConversationId::from(conversation.as_str())));
                Ok(())
            }
            Command::Decode { conversation, text } => {
                let codec = codec(&config)?;
                let plain = codec
                    .decode(text, &ConversationId::from(conversation.as_str()))
                    .context("text is not ciphertext for this conversation")?;
                println!("{}", plain);
                Ok(())
            }
            Command::Check { text } => {
                println!("{}", is_ciphertext_likely(text));
                Ok(())
            }
        }
    }
}

fn codec(config: &NodeConfig) -> Result<CipherCodec> {
    let secret = config
        .secret
        .as_deref()
        .context("no cipher secret: set COURIER_SECRET or --secret")?;
    Ok(CipherCodec::new(secret))
}

async fn run_node(config: NodeConfig) -> Result<()> {
    let codec = codec(&config)?;
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());

    let markers = FileMarkerStore::open(config.markers_dir())
        .with_context(|| format!("opening marker store in {}", config.state_dir.display()))?;
    let preferences = FilePreferenceStore::new(&config.state_dir, &config.notify.namespace);

    let mut builder = NotificationCoordinator::builder(codec, scheduler.clone())
        .config(config.notify.clone())
        .marker_store(Arc::new(markers))
        .preferences(Arc::new(preferences))
        .surface(Arc::new(StdoutSurface));
    if let Some(identity) = &config.identity {
        builder = builder.identity(identity.clone());
    }
    let coordinator = builder.build();

    let handler = Arc::new(NodeHandler::new(NotifyOnInsert::new(coordinator.clone())));
    let transport = Arc::new(TcpFeedTransport::new(&config.feed_addr, config.feed_buffer));
    let manager =
        ChannelSubscriptionManager::new(config.realtime.clone(), transport, handler, scheduler);

    info!(
        feed = %config.feed_addr,
        instance = %coordinator.instance_id(),
        state_dir = %config.state_dir.display(),
        "courier node starting"
    );
    if let Err(e) = manager.start().await {
        warn!(error = %e, "initial feed subscription failed, retrying in background");
    }

    let mut states = manager.state_changes();
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *states.borrow_and_update();
                info!(%state, "feed state changed");
                if state == ChannelState::Failed {
                    error!(attempts = manager.attempts(), "feed unreachable, giving up");
                    break Err(anyhow::anyhow!("feed at {} unreachable", config.feed_addr));
                }
            }
        }
    };

    manager.stop();
    coordinator.shutdown();
    let stats = manager.stats();
    info!(
        delivered = stats.events_delivered,
        dropped = stats.events_dropped,
        shown = coordinator.stats().shown,
        "courier node stopped"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "courier-node",
            "--secret",
            "s3cret",
            "--log-format",
            "json",
            "run",
            "--feed",
            "10.0.0.1:7400",
            "--conversation",
            "c9",
        ]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.feed_addr, "10.0.0.1:7400");
        assert_eq!(
            config.realtime.conversation_filter,
            Some(ConversationId::from("c9"))
        );
    }

    #[test]
    fn test_codec_requires_secret() {
        assert!(codec(&NodeConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_encode_decode_commands() {
        let config = NodeConfig {
            secret: Some("k".to_string()),
            ..NodeConfig::default()
        };
        let encode = Cli::parse_from(["courier-node", "encode", "c1", "oi"]);
        encode.run(config.clone()).await.unwrap();

        let sealed = codec(&config).unwrap().encode("oi", &"c1".into());
        let decode = Cli::parse_from(["courier-node", "decode", "c1", sealed.as_str()]);
        decode.run(config.clone()).await.unwrap();

        let bad = Cli::parse_from(["courier-node", "decode", "c1", "not base64!"]);
        assert!(bad.run(config).await.is_err());
    }
}
