// avrlib test application -- CLI tool for exercising a Denon/Marantz
// receiver (or the in-process mock) from the command line.
//
// Usage:
//   avrlib-test-app --host 192.168.1.40 status
//   avrlib-test-app --host 192.168.1.40 power on
//   avrlib-test-app --host 192.168.1.40 --power-command zm power toggle
//   avrlib-test-app --host 192.168.1.40 volume set 0.35
//   avrlib-test-app --host 192.168.1.40 volume adjust -- -3.5
//   avrlib-test-app --host 192.168.1.40 source BD
//   avrlib-test-app --host 192.168.1.40 raw PSMODE:MUSIC
//   avrlib-test-app --host 192.168.1.40 watch --duration 60
//   avrlib-test-app --mock stress --count 20

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use avrlib::{DenonBuilder, DenonReceiver, PowerCommand};
use avrlib_test_harness::MockReceiver;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// avrlib test application -- drives a receiver from the command line.
#[derive(Parser)]
#[command(name = "avrlib-test-app", version, about)]
struct Cli {
    /// Receiver host name or IP address. Required unless --mock is used.
    #[arg(long, env = "AVR_HOST")]
    host: Option<String>,

    /// Telnet port (default: 23).
    #[arg(long, default_value_t = avrlib::TELNET_PORT)]
    port: u16,

    /// Power command dialect: pw (PWON/PWSTANDBY) or zm (ZMON/ZMOFF).
    #[arg(long, env = "AVR_POWER_COMMAND", default_value = "pw", value_parser = parse_power_command)]
    power_command: PowerCommand,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Talk to an in-process mock receiver instead of a real one.
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

fn parse_power_command(s: &str) -> std::result::Result<PowerCommand, String> {
    s.parse().map_err(|e| format!("{e}"))
}

#[derive(Subcommand)]
enum Command {
    /// Query power, mute, volume and source once and print them.
    Status,

    /// Poll in the background and print every change event.
    Watch {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Power operations.
    Power {
        #[command(subcommand)]
        action: SwitchAction,
    },

    /// Mute operations.
    Mute {
        #[command(subcommand)]
        action: SwitchAction,
    },

    /// Volume operations.
    Volume {
        #[command(subcommand)]
        action: VolumeAction,
    },

    /// Select an input source (e.g. BD, TUNER, GAME), or print whether it
    /// is current with --check.
    Source {
        /// Source token as the receiver spells it.
        token: String,

        /// Only compare against the current source.
        #[arg(long)]
        check: bool,
    },

    /// Send an arbitrary command (without the trailing CR).
    Raw {
        /// Command text, e.g. PSMODE:MUSIC.
        command: String,

        /// Hold the socket and print whatever the receiver answers.
        #[arg(long)]
        read: bool,
    },

    /// Fire many requests from concurrent tasks and check that the queue
    /// serves them one socket at a time.
    Stress {
        /// Number of requests.
        #[arg(long, default_value_t = 20)]
        count: u32,
    },
}

#[derive(Subcommand)]
enum SwitchAction {
    /// Switch on.
    On,
    /// Switch off.
    Off,
    /// Flip the current state.
    Toggle,
}

#[derive(Subcommand)]
enum VolumeAction {
    /// Set an absolute level between 0.0 and 1.0.
    Set { level: f32 },
    /// Set an absolute level in dB (0.0 to 98.0).
    Db { db: f32 },
    /// One step up.
    Up,
    /// One step down.
    Down,
    /// Change by a number of dB relative to the current value.
    Adjust {
        #[arg(allow_hyphen_values = true)]
        delta_db: f32,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn on_off(value: bool) -> &'static str {
    if value { "ON" } else { "OFF" }
}

/// Build the receiver, starting a mock first when --mock is given.
///
/// The mock must outlive the receiver, so it is returned alongside.
async fn create_receiver(cli: &Cli, polling: bool) -> Result<(DenonReceiver, Option<MockReceiver>)> {
    let (host, port, mock) = if cli.mock {
        let mock = MockReceiver::start(cli.power_command)
            .await
            .context("failed to start mock receiver")?;
        info!(addr = mock.addr(), "started mock receiver");
        (mock.host().to_string(), mock.port(), Some(mock))
    } else {
        let Some(host) = cli.host.clone() else {
            bail!("--host (or AVR_HOST) is required unless --mock is used");
        };
        (host, cli.port, None)
    };

    let avr = DenonBuilder::new(&host)
        .port(port)
        .power_command(cli.power_command)
        .polling(polling)
        .build()
        .await
        .with_context(|| format!("failed to set up receiver at {host}:{port}"))?;

    Ok((avr, mock))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_status(avr: &DenonReceiver) -> Result<()> {
    let power = avr.query_power().await.context("power query failed")?;
    println!("Power:   {}", on_off(power));

    let muted = avr.query_mute().await.context("mute query failed")?;
    println!("Mute:    {}", on_off(muted));

    let level = avr.query_volume().await.context("volume query failed")?;
    println!("Volume:  {:.1}% ({:.1} dB)", level * 100.0, level * 98.0);

    let source = avr.query_source().await.context("source query failed")?;
    println!("Source:  {source}");
    Ok(())
}

async fn cmd_watch(avr: &DenonReceiver, duration_secs: u64) -> Result<()> {
    let mut events = avr.subscribe();
    let mut state = avr.watch_state();

    println!("Watching receiver events (Ctrl-C to stop)...");

    let deadline = if duration_secs > 0 {
        Some(Instant::now() + Duration::from_secs(duration_secs))
    } else {
        None
    };

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Watch duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, events.recv()) => match result {
                Ok(Ok(event)) => println!("[event] {event:?}"),
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                    println!("Event channel closed.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Watch duration elapsed.");
                    }
                    break;
                }
            },
            Ok(()) = state.changed() => {
                debug!(state = ?*state.borrow_and_update(), "cached state updated");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Final state: {:?}", avr.state());
    Ok(())
}

async fn cmd_power(avr: &DenonReceiver, action: &SwitchAction) -> Result<()> {
    let on = match action {
        SwitchAction::On => {
            avr.set_power(true).await?;
            true
        }
        SwitchAction::Off => {
            avr.set_power(false).await?;
            false
        }
        SwitchAction::Toggle => avr.toggle_power().await?,
    };
    println!("Power:   {}", on_off(on));
    Ok(())
}

async fn cmd_mute(avr: &DenonReceiver, action: &SwitchAction) -> Result<()> {
    let muted = match action {
        SwitchAction::On => {
            avr.set_mute(true).await?;
            true
        }
        SwitchAction::Off => {
            avr.set_mute(false).await?;
            false
        }
        SwitchAction::Toggle => avr.toggle_mute().await?,
    };
    println!("Mute:    {}", on_off(muted));
    Ok(())
}

async fn cmd_volume(avr: &DenonReceiver, action: &VolumeAction) -> Result<()> {
    match action {
        VolumeAction::Set { level } => {
            if !(0.0..=1.0).contains(level) {
                bail!("level must be between 0.0 and 1.0, got {level}");
            }
            avr.set_volume(*level).await?;
            println!("Volume set to {:.1}%", level * 100.0);
        }
        VolumeAction::Db { db } => {
            avr.set_volume_db(*db).await?;
            println!("Volume set to {db:.1} dB");
        }
        VolumeAction::Up => {
            avr.volume_up().await?;
            println!("Volume stepped up");
        }
        VolumeAction::Down => {
            avr.volume_down().await?;
            println!("Volume stepped down");
        }
        VolumeAction::Adjust { delta_db } => {
            let level = avr.adjust_volume_db(*delta_db).await?;
            println!("Volume now {:.1}% ({:.1} dB)", level * 100.0, level * 98.0);
        }
    }
    Ok(())
}

async fn cmd_source(avr: &DenonReceiver, token: &str, check: bool) -> Result<()> {
    if check {
        let current = avr.is_source(token).await?;
        println!("{token} is current: {current}");
    } else {
        avr.set_source(token).await?;
        println!("Source set to {token}");
    }
    Ok(())
}

async fn cmd_raw(avr: &DenonReceiver, command: &str, read: bool) -> Result<()> {
    if !read {
        avr.send_raw(command).await?;
        println!("Sent {command}");
        return Ok(());
    }

    let reply = avr.read(command).await?;
    for line in reply.text.split('\r').filter(|l| !l.is_empty()) {
        println!("< {line}");
    }
    reply.session.close().await;
    Ok(())
}

async fn cmd_stress(avr: DenonReceiver, count: u32) -> Result<()> {
    let avr = Arc::new(avr);
    let mut state = avr.subscribe_connection_state();
    let opened = Arc::new(AtomicU32::new(0));

    // Count idle -> active transitions of the single connection slot.
    let watcher = tokio::spawn({
        let opened = Arc::clone(&opened);
        async move {
            let mut active = false;
            while state.changed().await.is_ok() {
                let now = state.borrow_and_update().is_active();
                if now && !active {
                    opened.fetch_add(1, Ordering::Relaxed);
                }
                active = now;
            }
        }
    });

    println!("Stress test: {count} concurrent requests");
    let start = Instant::now();
    let mut tasks = Vec::with_capacity(count as usize);
    for i in 0..count {
        let avr = Arc::clone(&avr);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                avr.toggle_mute().await.map(|_| ())
            } else {
                avr.volume_up().await
            }
        }));
    }

    let mut failures = 0u32;
    for (i, task) in tasks.into_iter().enumerate() {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("[{}/{count}] request failed: {e}", i + 1);
                failures += 1;
            }
            Err(e) => {
                eprintln!("[{}/{count}] task panicked: {e}", i + 1);
                failures += 1;
            }
        }
    }
    let elapsed = start.elapsed();

    avr.shutdown();
    watcher.abort();

    println!();
    println!("Results:");
    println!("  Requests:       {count}");
    println!("  Failures:       {failures}");
    println!("  Sockets opened: {}", opened.load(Ordering::Relaxed));
    println!("  Elapsed:        {:.3} s", elapsed.as_secs_f64());
    println!(
        "  Per request:    {:.0} ms",
        elapsed.as_secs_f64() * 1000.0 / f64::from(count.max(1))
    );

    if failures > 0 {
        bail!("{failures} out of {count} requests failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Only `watch` needs the background poller.
    let polling = matches!(cli.command, Command::Watch { .. });
    let (avr, _mock) = create_receiver(&cli, polling).await?;

    let result = match &cli.command {
        Command::Status => cmd_status(&avr).await,
        Command::Watch { duration } => cmd_watch(&avr, *duration).await,
        Command::Power { action } => cmd_power(&avr, action).await,
        Command::Mute { action } => cmd_mute(&avr, action).await,
        Command::Volume { action } => cmd_volume(&avr, action).await,
        Command::Source { token, check } => cmd_source(&avr, token, *check).await,
        Command::Raw { command, read } => cmd_raw(&avr, command, *read).await,
        Command::Stress { count } => return cmd_stress(avr, *count).await,
    };

    avr.shutdown();
    result
}
