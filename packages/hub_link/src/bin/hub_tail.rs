use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use hub_link::adapters::{ChatChannel, LogToast, NotificationFeed};
use hub_link::config::{DEFAULT_CONFIG_FILE, Feature, HubFileConfig};
use hub_link::{Channel, ConnectionManager, ConnectionState, Credential, HubConnector, InboundEvent};

#[derive(Parser)]
#[command(name = "hub-tail")]
#[command(about = "Follow a real-time hub and print what it pushes")]
struct Cli {
    /// Config file (missing file means defaults + HUB_* env)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = Feature::Chat)]
    feature: Feature,

    /// Bearer token
    #[arg(long, env = "HUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Chat topic to join after every (re)connect
    #[arg(long)]
    topic: Option<String>,

    #[arg(long)]
    debug: bool,
}

enum Binding {
    Chat(ChatChannel),
    Notifications(NotificationFeed),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_directive = if args.debug {
        "hub_link=debug,hub_tail=debug,info"
    } else {
        "hub_link=info,hub_tail=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let Some(token) = args.token.clone() else {
        bail!("no credential: pass --token or set HUB_TOKEN");
    };

    let config = HubFileConfig::load(&args.config)?
        .manager_config(args.feature)
        .context("invalid hub configuration")?;
    info!(endpoint = %config.endpoint, feature = ?args.feature, "starting hub-tail");

    let manager = Arc::new(ConnectionManager::new(
        config,
        Arc::new(HubConnector::default()),
    ));

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let _state = manager.on_state_change(move |state| {
        println!("-- {state}");
        if *state == ConnectionState::Connected {
            let _ = connected_tx.send(());
        }
    });
    let _errors = manager.subscribe(Channel::Error, |event| {
        if let InboundEvent::ServerError(err) = event {
            println!("!! {}", err.message);
        }
    });

    let binding = match args.feature {
        Feature::Chat => {
            let chat = ChatChannel::new(manager.clone());
            chat.on_message(|m| {
                println!(
                    "[{}] {} ({}): {}",
                    m.topic_id.as_deref().unwrap_or("-"),
                    m.sender_id.as_deref().unwrap_or("?"),
                    m.sender_role.as_ref().map_or("unknown", |r| r.as_str()),
                    m.content.as_deref().unwrap_or_default()
                );
            });
            chat.on_typing(|t| println!("[{}] {} is typing", t.topic_id, t.sender_name));
            Binding::Chat(chat)
        }
        Feature::Notifications => {
            if args.topic.is_some() {
                warn!("--topic only applies to the chat feature");
            }
            let feed = NotificationFeed::new(manager.clone(), Arc::new(LogToast));
            feed.on_notification(|n| {
                println!(
                    "* {} {}",
                    n.title.as_deref().unwrap_or("notification"),
                    n.message.as_deref().unwrap_or_default()
                );
            });
            Binding::Notifications(feed)
        }
    };

    manager.set_authenticated(Some(Credential::new(token)));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                break;
            }
            Some(()) = connected_rx.recv() => {
                if let (Some(topic), Binding::Chat(chat)) = (&args.topic, &binding) {
                    let outcome = chat.join_topic(topic.as_str()).await;
                    info!(topic = %topic, ?outcome, "join topic");
                }
            }
        }
    }

    info!("shutting down");
    manager.set_authenticated(None);
    drop(binding);
    Ok(())
}
