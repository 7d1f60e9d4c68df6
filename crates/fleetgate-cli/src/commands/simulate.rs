use super::CommandContext;
use anyhow::{Result, bail};
use fleetgate_access::config::RealtimeConfig;
use fleetgate_access::realtime::{ChannelRequest, InMemoryChangeFeed, InMemoryQueryCache, QueryKey, SubscriptionManager};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// `orders/open` becomes the composite key `[orders, open]`
fn parse_key(raw: &str) -> QueryKey {
    QueryKey::new(raw.split('/').filter(|token| !token.is_empty()))
}

pub async fn run_simulation(ctx: &CommandContext, resource: &str, keys: &[String], events: usize, multiplex: bool) -> Result<()> {
    if keys.is_empty() {
        bail!("at least one query key is required");
    }

    let realtime = RealtimeConfig {
        multiplex_channels: multiplex || ctx.config.access.realtime.multiplex_channels,
        ..ctx.config.access.realtime.clone()
    };
    let feed = Arc::new(InMemoryChangeFeed::new().with_default_schema(realtime.default_schema.clone()));
    let cache = Arc::new(InMemoryQueryCache::new());
    let manager = SubscriptionManager::with_config(feed.clone(), cache.clone(), realtime);

    let delivered = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for raw in keys {
        let key = parse_key(raw);
        cache.set(key.clone(), json!([]));

        let counter = delivered.clone();
        let request = ChannelRequest::new(resource, key).on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handles.push(manager.open(request).await?);
    }

    info!(resource = %resource, channels = handles.len(), feed_subscriptions = feed.subscription_count(), "Channels open");

    let expected = events * handles.len();
    for id in 0..events {
        // Backend payloads carry no schema; the feed fills in the configured one
        feed.emit_raw(&json!({ "eventType": "UPDATE", "table": resource, "new": { "id": id } }))?;
    }

    // Deliveries happen on the pump tasks
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while delivered.load(Ordering::SeqCst) < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let feed_subscriptions = feed.subscription_count();
    let stale: Vec<String> = keys.iter().map(|raw| parse_key(raw)).filter(|key| cache.is_stale(key) == Some(true)).map(|key| key.to_string()).collect();

    for handle in handles {
        handle.close();
    }

    let stats = cache.stats();
    if ctx.json() {
        return ctx.print_json(&json!({
            "resource": resource,
            "multiplexed": manager.is_multiplexed(),
            "feed_subscriptions": feed_subscriptions,
            "events_emitted": events,
            "deliveries": delivered.load(Ordering::SeqCst),
            "invalidations": stats.invalidations,
            "stale_keys": stale,
        }));
    }

    println!("Simulation for '{}'", resource);
    println!("==================");
    println!("Multiplexed: {}", manager.is_multiplexed());
    println!("Feed subscriptions: {}", feed_subscriptions);
    println!("Events emitted: {}", events);
    println!("Deliveries: {}", delivered.load(Ordering::SeqCst));
    println!("Invalidations: {}", stats.invalidations);
    println!("Stale keys: {}", stale.join(" "));

    Ok(())
}
