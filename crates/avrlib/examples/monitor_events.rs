//! Monitor receiver events.
//!
//! Demonstrates subscribing to the receiver event stream and printing all
//! events as they arrive. The background poller queries power, mute,
//! volume and source every two seconds and announces every change.
//!
//! # Requirements
//!
//! - A receiver with Network Control enabled
//! - `AVR_HOST` set to its address (default `192.168.1.40`)
//!
//! # Usage
//!
//! ```sh
//! AVR_HOST=192.168.1.40 cargo run -p avrlib --example monitor_events
//! ```

use std::time::Duration;

use avrlib::{DenonBuilder, PollMode, ReceiverEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host = std::env::var("AVR_HOST").unwrap_or_else(|_| "192.168.1.40".into());
    let avr = DenonBuilder::new(&host).build().await?;

    let mut events = avr.subscribe();
    println!("Subscribed to {} events. Monitoring for 60 seconds...", host);
    println!("(Change the input, volume or mute on the remote to generate events)\n");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let start = tokio::time::Instant::now();

    println!("{:<12} Event", "Timestamp");
    println!("{:-<12} {:-<50}", "", "");

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let elapsed = start.elapsed();
                let timestamp = format!("{:>6}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis());

                match event {
                    ReceiverEvent::PowerChanged { on } => {
                        let state = if on { "ON" } else { "STANDBY" };
                        println!("{} PowerChanged     -> {}", timestamp, state);
                    }
                    ReceiverEvent::MuteChanged { muted } => {
                        let state = if muted { "ON" } else { "OFF" };
                        println!("{} MuteChanged      -> {}", timestamp, state);
                    }
                    ReceiverEvent::VolumeChanged { volume } => {
                        println!("{} VolumeChanged    -> {:.1}%", timestamp, volume * 100.0);
                    }
                    ReceiverEvent::SourceChanged { source } => {
                        println!("{} SourceChanged    -> {}", timestamp, source);
                    }
                    ReceiverEvent::PollModeChanged { mode } => {
                        let note = match mode {
                            PollMode::Fast => "receiver answering again",
                            PollMode::Slow => "receiver unreachable, backing off",
                        };
                        println!("{} PollModeChanged  -> {} ({})", timestamp, mode, note);
                    }
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                println!("(missed {} events)", n);
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
            Err(_) => break,
        }
    }

    let state = avr.state();
    println!("\nFinal state: {:?}", state);
    avr.shutdown();
    Ok(())
}
