//! Loopback Call Walkthrough
//!
//! This example drives a complete agent session against the in-process
//! loopback transport:
//! - initialize a session from a TOML configuration
//! - dial a number and watch the monitor pick up the answer
//! - hold, resume and send DTMF
//! - hang up and watch the automatic re-initialization
//!
//! Run with: cargo run --example loopback_call

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use call_session_core::duration::category;
use call_session_core::{
    setup_logging, CallStatus, CallUpdate, LoggingConfig, LoopbackTransport,
    ManagerSettings, SessionConfig, SessionManager,
};
use tracing::info;

const CONFIG: &str = r#"
username = "agent-42"
password = "s3cret"
realm = "voice.example.com"
signaling_url = "wss://voice.example.com/ws"
debug = false

[[ice_servers]]
urls = ["stun:stun.example.com:3478"]

[custom_headers]
X-Campaign-Id = 4711
X-Queue = "outbound-sales"
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SessionConfig::from_toml_str(CONFIG).context("parsing session config")?;
    setup_logging(LoggingConfig::from_verbosity(config.debug))?;

    println!("📞 Loopback Call Walkthrough");
    println!("============================\n");

    let transport = Arc::new(LoopbackTransport::new());
    let settings = ManagerSettings::default()
        .with_poll_interval(Duration::from_millis(200))
        .with_eviction_grace(Duration::from_secs(1));
    let manager = SessionManager::new(transport.clone(), settings);

    manager.subscribe(
        |call| println!("🔔 New call {} ({:?}) {}", call.id(), call.direction(), call.number()),
        |error| println!("⚠️  Session error: {}", error),
        || println!("👋 Session complete"),
    );

    manager.initialize(config).await?;
    println!("✅ Registered, availability: {}", *manager.availability().borrow());

    let call = manager.make_call("+1 (555) 123-4567").await?;
    call.subscribe(|update: &CallUpdate| println!("   ↳ {:?}", update));

    // The far end rings, then answers
    transport.set_status(call.id(), CallStatus::Ringing);
    tokio::time::sleep(Duration::from_millis(600)).await;
    transport.set_status(call.id(), CallStatus::Connected);
    tokio::time::sleep(Duration::from_millis(400)).await;
    info!(call_id = %call.id(), status = %call.status(), "Call answered");

    call.hold().await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    call.resume().await?;
    call.dtmf("1#").await?;

    call.hangup().await?;
    let info = call.info();
    println!("\n⏱️  Durations for {}:", info.call_id);
    for name in [category::RINGING, category::CONNECTED, category::HOLD] {
        let spent = info.durations.get(name).copied().unwrap_or_default();
        println!("   {:<10} {:>6} ms", name, spent.as_millis());
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.stats().reconnects == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("waiting for re-initialization")?;

    let stats = manager.stats();
    println!(
        "\n🔁 Re-initialized: reconnects={} connections={} total_calls={}",
        stats.reconnects,
        transport.connect_count(),
        stats.total_calls
    );

    manager.shutdown().await?;
    Ok(())
}
