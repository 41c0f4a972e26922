// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic perms-storage usage example.
//!
//! Demonstrates:
//! 1. Split routing over two in-memory backends
//! 2. Loading users and groups, with lifecycle events
//! 3. Buffered saves and a manual flush
//! 4. A bulk update running as a phase
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use perms_storage::{
    BroadcastDispatcher, BulkAction, BulkTarget, BulkUpdate, Comparison, Constraint, CreationCause, LoadedEntities,
    MemoryDriver, Node, NodeField, Storage, StorageBuilder, StorageConfig,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           perms-storage: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure split storage
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring split storage...");

    let config = StorageConfig::from_toml_str(
        r#"
        buffer_flush_ms = 250

        [split.types]
        user = "sql"
        group = "mongo"
        track = "sql"
        uuid = "sql"
        log = "sql"
        "#,
    )?;

    let sql = Arc::new(MemoryDriver::named("H2"));
    let mongo = Arc::new(MemoryDriver::named("MongoDB"));
    let entities = Arc::new(LoadedEntities::new());
    let events = Arc::new(BroadcastDispatcher::new(64));
    let mut event_rx = events.subscribe();

    let storage = StorageBuilder::new(config)
        .backend("sql", sql.clone())
        .backend("mongo", mongo.clone())
        .entities(entities.clone())
        .events(events)
        .build()?;

    storage.init().await?;
    println!("   ✅ Storage ready: {}", storage.name());
    for (key, value) in storage.meta() {
        println!("   └─ {}: {}", key, value);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Load entities
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Creating groups and loading users...");

    let mut admin = storage
        .create_and_load_group("admin".into(), CreationCause::Command)
        .await?;
    admin.nodes.push(Node::new("essentials.fly").with_server("factions"));
    entities.insert_group(admin.clone());
    storage.save_group(admin).await?;

    let alice = Uuid::new_v4();
    entities.insert_user(storage.load_user(alice, Some("Alice".into())).await?);
    let mut user = storage.load_user(alice, None).await?;
    user.nodes.push(Node::new("group.admin"));
    storage.save_user(user).await?;
    storage.save_uuid_data(alice, "Alice".into()).await?;

    while let Ok(event) = event_rx.try_recv() {
        println!("   └─ event: {}", event);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Flush the write buffer
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏳ Flushing buffered writes...");
    storage.force_flush().await;
    println!("   └─ H2 holds user: {}", sql.stored_user(alice).is_some());
    println!("   └─ MongoDB holds admin: {}", mongo.stored_group("admin").is_some());
    println!("   └─ getUUID('alice'): {:?}", storage.get_uuid("alice".into()).await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Bulk update (runs as a phase on the group kind)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Moving group nodes from 'factions' to 'survival'...");
    let update = BulkUpdate::new(
        BulkTarget::Groups,
        BulkAction::Update { field: NodeField::Server, value: Some("survival".into()) },
    )
    .with_constraint(Constraint::new(NodeField::Server, Comparison::Equal, "factions"));
    storage.apply_bulk_update(update).await?;

    if let Some(group) = storage.load_group("admin".into()).await? {
        for node in &group.nodes {
            println!("   └─ {} @ {}", node.permission, node.server.as_deref().unwrap_or("global"));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Dump metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    storage.shutdown().await;
    println!("   ✅ Shutdown complete! H2 running: {}", sql.is_running());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={:.4}", samples.len(), sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
