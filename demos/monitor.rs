//! Scan for a smart bottle, connect, and print telemetry as it arrives.
//!
//! Run with: cargo run --example monitor
//!
//! To reconnect to a bottle seen on a previous run:
//!   cargo run --example monitor -- --store bottle.json
//!
//! Without a Bluetooth adapter, a simulated bottle can be used:
//!   cargo run --example monitor -- --mock

use smart_bottle_ble::{
    ConnectionState, DeviceManager, MockTransport, Result, Transport,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smart_bottle_ble=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let use_mock = args.iter().any(|arg| arg == "--mock");
    let store_path = args
        .iter()
        .position(|arg| arg == "--store")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "smart-bottle.json".to_string());

    println!("Smart Bottle Monitor");
    println!("====================\n");

    let mock = MockTransport::new();
    let transport: Arc<dyn Transport> = if use_mock {
        mock.advertise("00:11:22:33:44:55", Some("Smart Bottle"));
        Arc::new(mock.clone())
    } else {
        Arc::new(smart_bottle_ble::BtleplugTransport::new().await?)
    };

    let manager = DeviceManager::persistent(transport, &store_path);

    let _state_handle = manager.on_state_changed(|state| {
        println!("[state] {}", state);
    });
    let _reading_handle = manager.on_reading(|reading| {
        println!(
            "[reading] {} ({:.1}°F)",
            reading,
            reading.temperature_fahrenheit()
        );
    });

    match manager.restore_last_device().await? {
        Some(identity) => println!("Reconnecting to remembered bottle {}\n", identity),
        None => {
            println!("Scanning for bottles...\n");
            manager.begin_scan().await?;

            let mut devices = manager.subscribe_devices();
            let device = tokio::time::timeout(Duration::from_secs(15), devices.recv()).await;
            let Ok(Ok(device)) = device else {
                println!("No bottles found.");
                manager.shutdown().await?;
                return Ok(());
            };

            println!("Found {} ({})\n", device.display_name(), device.identity);
            manager.connect(device.identity).await?;
        }
    }

    if use_mock {
        // Feed a couple of frames once the handshake is done.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let mut temperature = 18.0;
            loop {
                let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                let frame = format!("{{\"t\":{:.1},\"ts\":\"{}\",\"uv\":0}}\n", temperature, now);
                // Split mid-frame the way notifications arrive.
                let (head, tail) = frame.as_bytes().split_at(frame.len() / 2);
                mock.notify(head);
                mock.notify(tail);
                temperature += 0.3;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    println!("Press Ctrl+C to stop.\n");
    tokio::signal::ctrl_c().await.ok();

    if manager.connection_state() == ConnectionState::Connected {
        println!("\nLast {} readings:", manager.readings().len());
        for reading in manager.readings().iter().take(5) {
            println!("  {}", reading);
        }
    }

    manager.shutdown().await?;
    Ok(())
}
