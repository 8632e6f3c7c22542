use futures::StreamExt;
use tracing::{info, warn};
use yalers::{decode_manufacturer_data, BtleplugTransport, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Yalers Advertisement Monitor");
    info!("Press Ctrl+C to stop monitoring");

    let transport = BtleplugTransport::new().await?;
    let mut advertisements = transport.advertisements().await?;

    while let Some(advertisement) = advertisements.next().await {
        // No offline key here, so encrypted broadcasts stay ambiguous
        let Some(decoded) = decode_manufacturer_data(&advertisement.manufacturer_data, None)
        else {
            continue;
        };
        match decoded.state() {
            Ok(state) => info!(
                "{} ({:?} dBm): {state}",
                advertisement.address, advertisement.rssi
            ),
            Err(e) => info!(
                "{} ({:?} dBm): {e}",
                advertisement.address, advertisement.rssi
            ),
        }
    }

    warn!("Advertisement stream ended");
    Ok(())
}
