//! BleLink demonstration
//!
//! Scans for the target firmware, connects to the first peripheral found, and
//! streams value updates until interrupted.

use blelink::{
    BtleplugTransport, Central, LinkState, Update, CHARACTERISTIC_UUID_B,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("🚀 Starting BleLink central demonstration...");

    #[cfg(feature = "config-file")]
    let config = blelink::config::load()?;
    #[cfg(not(feature = "config-file"))]
    let config = blelink::CentralConfig::default();

    let (transport, events) = BtleplugTransport::new().await?;
    let central = Central::spawn(transport, events, config);
    info!("✅ Central session spawned");

    central.start_scan().await?;
    info!("🔍 Scanning for peripherals...");
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    let snapshot = central.snapshot();
    if snapshot.devices.is_empty() {
        warn!("No matching peripherals found, exiting");
        return Ok(());
    }
    for device in &snapshot.devices {
        info!("   📱 {} (rssi: {:?})", device.label(), device.rssi);
    }

    let target = snapshot.devices[0].clone();
    info!("🔗 Connecting to {}", target.label());
    central.connect(target.id.clone()).await?;

    let mut updates = central.updates();
    let mut probed = false;
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(Update::Status { state, message }) => {
                    info!("📊 {}", message);
                    match state {
                        LinkState::Ready if !probed => {
                            probed = true;
                            probe_write(&central).await;
                        }
                        LinkState::Disconnected(reason) => {
                            info!("🔌 Link closed: {}", reason);
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(Update::Value { characteristic, value }) => {
                    info!("📥 {} = {}", characteristic, hex::encode(&value));
                }
                Ok(Update::DeviceDiscovered(device)) => {
                    info!("📱 Discovered {}", device.label());
                }
                Ok(Update::WriteCompleted { characteristic, seq, result }) => match result {
                    Ok(()) => info!("✅ Write #{} to {} confirmed", seq, characteristic),
                    Err(reason) => error!("❌ Write #{} to {} failed: {}", seq, characteristic, reason),
                },
                Err(e) => {
                    warn!("Update stream lagged or closed: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Interrupted, disconnecting");
                if let Err(e) = central.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
            }
        }
    }

    info!("🎉 Demonstration completed");
    Ok(())
}

/// Write a probe payload once the link is ready.
async fn probe_write(central: &Central) {
    match central
        .write_with_ack(CHARACTERISTIC_UUID_B, b"ping".to_vec())
        .await
    {
        Ok(seq) => info!("📤 Probe write submitted as #{}", seq),
        Err(e) => error!("❌ Probe write rejected: {}", e),
    }
}
