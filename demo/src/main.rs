use anyhow::Result;
use audit_trail::broker::InMemoryBroker;
use audit_trail::store::{BackingStoreFactories, StoreContext};
use audit_trail::{AuditEvent, Auditor, AuditorSettings};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "DEMO_AUDIT";

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,audit_trail=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    // 未配置环境变量时使用内存存储，并缩短回放间隔便于观察
    let settings = match AuditorSettings::from_env(ENV_PREFIX) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::info!(error = %err, "falling back to demo settings");
            let mut settings = AuditorSettings::new("audit-demo");
            settings.trail.drain_interval = Duration::from_secs(1);
            settings
        }
    };

    let registry = Registry::new();
    let broker = InMemoryBroker::new(256);
    let auditor = Auditor::start(
        settings,
        Arc::new(broker.clone()),
        &StoreContext::new(registry.clone()),
        &BackingStoreFactories::new(),
    )
    .await?;

    let sender = auditor.sender();
    let record = |n: usize, phase: &str| {
        AuditEvent::new(format!("evt-{n:03}"))
            .with_field("action", "update")
            .with_field("phase", phase)
            .with_field("observer", serde_json::json!({"name": "demo", "id": "demo-1"}))
    };

    for n in 0..3 {
        sender.send(record(n, "online")).await?;
    }

    tracing::warn!("simulating broker outage");
    broker.set_available(false);
    for n in 3..8 {
        sender.send(record(n, "outage")).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    tracing::info!("broker recovered");
    broker.set_available(true);
    for n in 8..10 {
        sender.send(record(n, "recovered")).await?;
    }

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        while broker.published().len() < 10 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if delivered.is_err() {
        tracing::warn!(
            published = broker.published().len(),
            "not every event was delivered before shutdown"
        );
    }

    auditor.shutdown().await?;

    println!("published: {:?}", broker.published_ids());
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    println!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}
