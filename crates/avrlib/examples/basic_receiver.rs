//! Basic receiver control.
//!
//! Connects to a Denon/Marantz receiver, switches it on, reads its state,
//! nudges the volume and toggles mute twice.
//!
//! # Requirements
//!
//! - A receiver with Network Control enabled
//! - `AVR_HOST` set to its address (default `192.168.1.40`)
//!
//! # Usage
//!
//! ```sh
//! AVR_HOST=192.168.1.40 cargo run -p avrlib --example basic_receiver
//! ```

use avrlib::DenonBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host = std::env::var("AVR_HOST").unwrap_or_else(|_| "192.168.1.40".into());
    println!("Connecting to {}...", host);

    let avr = DenonBuilder::new(&host).polling(false).build().await?;

    avr.set_power(true).await?;
    println!("Power:  {}", if avr.query_power().await? { "ON" } else { "STANDBY" });

    let level = avr.adjust_volume_db(-2.0).await?;
    println!("Volume: {:.0}%", level * 100.0);

    let muted = avr.toggle_mute().await?;
    println!("Muted:  {}", muted);
    let muted = avr.toggle_mute().await?;
    println!("Muted:  {}", muted);

    println!("Source is TUNER: {}", avr.is_source("TUNER").await?);

    avr.shutdown();
    Ok(())
}
