mod config;
mod offline;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use interpretix_messaging::backend::MessageBackend;
use interpretix_messaging::notify::TracingNotifier;
use interpretix_messaging::view::{EVENT_DELETED, EVENT_INSERTED, EVENT_NOTIFICATION};
use interpretix_messaging::{ChannelView, ViewEvent};
use interpretix_realtime::RealtimeManager;
use interpretix_realtime::transport::MemoryTransport;
use interpretix_supabase::{SocketOptions, SupabaseBackend, SupabaseRealtime};
use interpretix_types::models::{Channel, ChannelKind, InterpreterStatus, Profile};

use config::Config;
use offline::OfflineBackend;

const DEFAULT_FILTER: &str =
    "interpretix=debug,interpretix_realtime=debug,interpretix_messaging=debug,interpretix_supabase=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .init();

    let config = Config::from_env()?;

    match &config.supabase {
        Some(supabase) => {
            info!("Connecting to {}", supabase.url);
            let transport = SupabaseRealtime::spawn(supabase.clone(), SocketOptions::default());
            let manager = RealtimeManager::new(Arc::new(transport), config.realtime());
            let backend = Arc::new(SupabaseBackend::new(supabase.clone()));
            monitor(&manager, backend, &config).await?;
            manager.shutdown();
        }
        None => {
            info!("Running offline with an in-memory feed");
            let transport = MemoryTransport::new();
            let manager = RealtimeManager::new(Arc::new(transport.clone()), config.realtime());
            let colleague = Uuid::new_v4();
            let backend = Arc::new(OfflineBackend::new(
                transport,
                vec![Profile {
                    id: colleague,
                    display_name: "Dispatch".into(),
                    avatar_url: None,
                }],
            ));
            let feed = offline::spawn_demo_feed(
                backend.clone(),
                config.channel_id,
                colleague,
                config.user_id,
                Duration::from_secs(5),
            );
            monitor(&manager, backend, &config).await?;
            feed.abort();
            manager.shutdown();
        }
    }

    Ok(())
}

async fn monitor<B: MessageBackend>(
    manager: &RealtimeManager,
    backend: Arc<B>,
    config: &Config,
) -> anyhow::Result<()> {
    if config.report_status {
        backend
            .update_status(config.user_id, InterpreterStatus::Available)
            .await?;
    }

    let channel = Channel {
        id: config.channel_id,
        name: config.channel_name.clone(),
        kind: ChannelKind::Group,
        members: Vec::new(),
    };
    let view = ChannelView::open(
        manager,
        backend.clone(),
        channel,
        config.user_id,
        Arc::new(TracingNotifier),
        config.view(),
    )
    .await?;

    let _inserted = view.on(EVENT_INSERTED, |event| {
        if let ViewEvent::Inserted(message) = event {
            info!("{}: {}", message.sender.display_name, message.content);
        }
        Ok(())
    });
    let _deleted = view.on(EVENT_DELETED, |event| {
        if let ViewEvent::Deleted(id) = event {
            info!("Message {} deleted", id);
        }
        Ok(())
    });
    let _notified = view.on(EVENT_NOTIFICATION, |event| {
        if let ViewEvent::Notification(n) = event {
            info!("Notification: {}", n.title());
        }
        Ok(())
    });

    let mut ticker = tokio::time::interval(config.monitor_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(manager, &view),
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutting down");
                break;
            }
        }
    }

    view.close().await;

    if config.report_status {
        if let Err(e) = backend
            .update_status(config.user_id, InterpreterStatus::Offline)
            .await
        {
            warn!("Failed to report offline status: {}", e);
        }
    }
    Ok(())
}

fn log_stats<B: MessageBackend>(manager: &RealtimeManager, view: &ChannelView<B>) {
    let state = view.state();
    info!(
        "Channel {}: {} messages, {} queued, retries {}, has_more {}",
        view.channel().name,
        view.messages().len(),
        view.queued(),
        view.retry_count(),
        state.has_more
    );
    for stats in manager.channel_stats() {
        info!(
            "  {} status={} refcount={} consumers={} idle={}ms",
            stats.name,
            stats.status,
            stats.refcount,
            stats.callback_count,
            stats.idle.as_millis()
        );
    }
}
