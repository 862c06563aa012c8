use dynolink::{DeviceSession, RepCallbacks, Result, SessionConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💪 Dynolink Single Rep Example");

    let session = DeviceSession::with_btleplug(SessionConfig::default()).await?;

    if let Err(e) = session.connect().await {
        error!("❌ Failed to connect: {}", e);
        return Err(e);
    }

    // Optional custom reference: 20 kgf reads 1690 counts on this unit
    let reference_weight = std::env::args().nth(1).and_then(|w| w.parse().ok());
    let reference_adc = std::env::args().nth(2).and_then(|a| a.parse().ok());
    session.setup(reference_weight, reference_adc).await?;

    info!("🧘 Calibrating, keep the sensor unloaded...");
    session.start_calibration().await?;

    let callbacks = RepCallbacks::default()
        .on_start(|| info!("⬆️  Contraction detected"))
        .on_stop(|| info!("⬇️  Released"))
        .on_values(|batch| {
            if let Some(last) = batch.last() {
                println!("  {last:7.2} kgf");
            }
            Ok(())
        });

    info!("🏋️ Pull when ready");
    let summary = match session.measure_rep(callbacks).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("❌ Rep capture failed: {}", e);
            session.disconnect().await?;
            return Err(e);
        }
    };

    println!("\n📊 Rep Summary:");
    println!("  Samples: {}", summary.data.len());
    println!("  Peak:    {:.2} kgf", summary.max);
    println!("  Minimum: {:.2} kgf", summary.min);
    println!("  Mean:    {:.2} kgf", summary.avg);

    session.disconnect().await?;
    info!("✅ Done");
    Ok(())
}
