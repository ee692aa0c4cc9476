use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use topic_messenger::config::MessengerConfig;
use topic_messenger::error::{MessengerError, Result};
use topic_messenger::{event_handler, GossipNodeFactory, TopicMessenger};

#[derive(Parser, Debug)]
#[command(name = "topic-messenger")]
#[command(about = "Publish and receive events over pub/sub content topics")]
struct Cli {
    /// JSON config file. Without it the WAKU_* environment is used.
    #[arg(long, env = "TOPIC_MESSENGER_CONFIG")]
    config: Option<String>,

    #[arg(long)]
    listen: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    Send {
        #[arg(long, default_value = "")]
        topic: String,

        #[arg(long)]
        room: String,

        #[arg(long)]
        body: String,
    },
    Listen {
        #[arg(long, default_value = "")]
        topic: String,
    },
    /// Answer every event on the default topic on the topic named by its room.
    Echo {
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
    },
}

fn load_config(cli: &Cli) -> Result<MessengerConfig> {
    let mut config = match &cli.config {
        Some(path) => MessengerConfig::from_file(path)?,
        None => MessengerConfig::from_env(),
    };
    if !cli.listen.is_empty() {
        config.listen_addrs = cli.listen.clone();
    }
    Ok(config)
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| MessengerError::Transport(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,topic_messenger=info,libp2p=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let factory = Arc::new(GossipNodeFactory::from_config(&config)?);
    let messenger = Arc::new(TopicMessenger::start(config, factory).await?);
    let _sweep = messenger.spawn_expiry_sweep();

    match cli.command {
        Commands::Send { topic, room, body } => {
            let body: Value = serde_json::from_str(&body)
                .map_err(|e| MessengerError::Serialization(e.to_string()))?;
            messenger.send_message(&body, &topic, &room).await;
        }
        Commands::Listen { topic } => {
            let handler = event_handler(|event| async move {
                let line = serde_json::to_string(&event)
                    .map_err(|e| MessengerError::Serialization(e.to_string()))?;
                println!("{line}");
                Ok(())
            });
            let subscribed = messenger.subscribe(&topic, handler).await?;
            info!(topic = %subscribed, "listening, press Ctrl-C to stop");
            wait_for_shutdown().await?;
            messenger.unsubscribe(&subscribed).await?;
        }
        Commands::Echo { delay_ms } => {
            let responder = messenger.clone();
            let handler = event_handler(move |event| {
                let responder = responder.clone();
                async move {
                    let reply = json!({
                        "received": event.body,
                        "timestamp": event.timestamp,
                    });
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    responder
                        .send_message(&reply, &event.room_id, &event.room_id)
                        .await;
                    Ok(())
                }
            });
            let subscribed = messenger.subscribe("", handler).await?;
            info!(topic = %subscribed, "echo responder running, press Ctrl-C to stop");
            wait_for_shutdown().await?;
            messenger.unsubscribe(&subscribed).await?;
        }
    }

    messenger.stop().await
}
