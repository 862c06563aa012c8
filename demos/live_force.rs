use dynolink::{DeviceSession, ErrorKind, Result, SessionConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📈 Dynolink Live Force Example");
    info!("Searching for a dynamometer...");

    let session = DeviceSession::with_btleplug(SessionConfig::default()).await?;
    session
        .on_status_change(|status| info!("🔄 Status: {}", status))
        .await;
    session
        .on_disconnect(|| warn!("❌ Dynamometer disconnected"))
        .await;

    if let Err(e) = session.connect().await {
        error!("❌ Failed to connect: {}", e);
        return Err(e);
    }

    if let Some(device) = session.device().await {
        info!("✅ Connected to: {}", device);
    }
    if let Some(metadata) = session.metadata().await {
        info!("📊 Device Info:");
        info!("  Firmware: {}", metadata.firmware_version);
        info!("  Hardware: {}", metadata.hardware_version);
        match metadata.battery_level {
            Some(level) => info!("  Battery: {}%", level),
            None => info!("  Battery: unknown"),
        }
        if let Some(address) = metadata.mac_address {
            info!("  Address: {}", address);
        }
    }

    let reference = session.setup(None, None).await?;
    info!(
        "⚖️  Reference: {} kgf at {} counts",
        reference.weight, reference.adc_value
    );

    info!("🧘 Calibrating, keep the sensor unloaded...");
    let calibration = loop {
        match session.start_calibration().await {
            Ok(calibration) => break calibration,
            Err(e) if e.kind() == ErrorKind::CalibrationFailed => warn!("⚠️  {}, retrying", e),
            Err(e) => {
                error!("❌ Calibration failed: {}", e);
                session.disconnect().await?;
                return Err(e);
            }
        }
    };
    info!("✅ Zero offset: {} counts", calibration.zero_adc_value);

    let peak = Arc::new(Mutex::new(0.0_f64));
    let latest = Arc::new(Mutex::new(0.0_f64));
    let (peak_sink, latest_sink) = (peak.clone(), latest.clone());

    session
        .start_continuous_streaming(move |kgf| {
            *latest_sink.lock().map_err(|e| e.to_string())? = kgf;
            let mut peak = peak_sink.lock().map_err(|e| e.to_string())?;
            if kgf > *peak {
                *peak = kgf;
            }
            Ok(())
        })
        .await?;

    info!("🏋️ Streaming for 30 seconds, pull whenever you like");
    let mut display = interval(Duration::from_millis(500));
    let start_time = Instant::now();

    while start_time.elapsed() < Duration::from_secs(30) {
        display.tick().await;
        if !session.is_connected().await {
            break;
        }

        let current = latest.lock().map_or(0.0, |v| *v);
        let best = peak.lock().map_or(0.0, |v| *v);
        println!("  {current:7.2} kgf   (peak {best:7.2} kgf)");
    }

    if session.is_streaming().await {
        session.stop_streaming().await?;
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = session.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    } else {
        info!("✅ Disconnected successfully");
    }

    println!("\n📊 Peak force: {:.2} kgf", peak.lock().map_or(0.0, |v| *v));
    Ok(())
}
