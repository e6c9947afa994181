//! DenonReceiver -- the device facade for Denon and Marantz receivers.
//!
//! Ties the command queue, the status poller and the state cache together.
//! Every capability operation turns into exactly one queued request:
//!
//! | Operation | Request |
//! |---|---|
//! | [`set_power`](DenonReceiver::set_power) | write `PWON` / `PW<off>` (cache updated on success) |
//! | [`set_volume`](DenonReceiver::set_volume) | write `MV<ddd>` |
//! | [`volume_up`](DenonReceiver::volume_up) / [`volume_down`](DenonReceiver::volume_down) | write `MVUP` / `MVDOWN` |
//! | [`set_mute`](DenonReceiver::set_mute) | write `MUON` / `MUOFF` |
//! | [`toggle_mute`](DenonReceiver::toggle_mute) | read `MU?`, write the opposite on the same socket |
//! | [`adjust_volume_db`](DenonReceiver::adjust_volume_db) | read `MV?`, write `MV<ddd>` on the same socket |
//!
//! Cached getters never touch the network; they return what the poller (or
//! an acknowledged power write) last stored.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use avrlib_core::error::{Error, Result};
use avrlib_core::events::ReceiverEvent;
use avrlib_core::types::{DeviceSettings, PollMode, ReceiverState};
use avrlib_text_io::{ConnectionState, DeviceIo, ReadReply};

use crate::cache::StatusCache;
use crate::commands;
use crate::poller::StatusPoller;

/// A networked Denon/Marantz receiver.
///
/// Constructed via [`DenonBuilder`](crate::builder::DenonBuilder). Dropping
/// the receiver tears it down: polling stops, queued requests are dropped
/// unanswered and any open socket is closed.
pub struct DenonReceiver {
    settings: DeviceSettings,
    io: Arc<DeviceIo>,
    cache: Arc<StatusCache>,
    poller: Option<StatusPoller>,
}

impl DenonReceiver {
    pub(crate) fn new(
        settings: DeviceSettings,
        io: Arc<DeviceIo>,
        cache: Arc<StatusCache>,
        poller: Option<StatusPoller>,
    ) -> Self {
        info!(
            addr = io.addr(),
            power_command = %settings.power_command,
            polling = poller.is_some(),
            "receiver initialized"
        );
        DenonReceiver {
            settings,
            io,
            cache,
            poller,
        }
    }

    /// The settings snapshot this receiver was built with.
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    // -----------------------------------------------------------------
    // Power
    // -----------------------------------------------------------------

    /// Switch the receiver on or off.
    ///
    /// The cached power state is updated as soon as the command was sent.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        debug!(on, "setting power");
        self.io
            .write(&commands::cmd_set_power(self.settings.power_command, on))
            .await?;
        self.cache.set_power(on);
        Ok(())
    }

    /// Ask the receiver for its power state and refresh the cache.
    pub async fn query_power(&self) -> Result<bool> {
        let dialect = self.settings.power_command;
        let message = self
            .io
            .read_text(
                &commands::cmd_query_power(dialect),
                &commands::power_matcher(dialect),
            )
            .await?;
        let on = commands::parse_power_response(&message, dialect)?;
        self.cache.set_power(on);
        Ok(on)
    }

    /// Flip the power state based on a live query. Returns the new state.
    pub async fn toggle_power(&self) -> Result<bool> {
        let on = !self.query_power().await?;
        self.set_power(on).await?;
        Ok(on)
    }

    // -----------------------------------------------------------------
    // Volume
    // -----------------------------------------------------------------

    /// Set the master volume to a level in `0.0..=1.0` (clamped).
    ///
    /// The cached volume is refreshed by the next poll cycle.
    pub async fn set_volume(&self, level: f32) -> Result<()> {
        let command = commands::cmd_set_volume(level)?;
        self.io.write(&command).await
    }

    /// Set the master volume in dB (`0.0..=98.0`, half-dB resolution).
    pub async fn set_volume_db(&self, db: f32) -> Result<()> {
        let command = commands::cmd_set_volume_db(db)?;
        self.io.write(&command).await
    }

    /// Ask the receiver for its volume and refresh the cache.
    ///
    /// Returns the level in `0.0..=1.0`.
    pub async fn query_volume(&self) -> Result<f32> {
        let message = self
            .io
            .read_text(&commands::cmd_query_volume(), &commands::volume_matcher())
            .await?;
        let level = commands::volume_units_to_level(commands::parse_volume_response(&message)?);
        self.cache.set_volume(level);
        Ok(level)
    }

    /// Step the volume up by one receiver increment.
    pub async fn volume_up(&self) -> Result<()> {
        self.io.write(&commands::cmd_volume_step(true)).await
    }

    /// Step the volume down by one receiver increment.
    pub async fn volume_down(&self) -> Result<()> {
        self.io.write(&commands::cmd_volume_step(false)).await
    }

    /// Change the volume by `delta_db` relative to the live value.
    ///
    /// Reads the current volume and writes the new one on the same
    /// connection. Returns the new level in `0.0..=1.0`.
    pub async fn adjust_volume_db(&self, delta_db: f32) -> Result<f32> {
        if !delta_db.is_finite() {
            return Err(Error::InvalidParameter(format!(
                "volume change {delta_db} dB is not a number"
            )));
        }

        let reply = self.io.read(&commands::cmd_query_volume()).await?;
        let current = match parse_held(&reply, &commands::volume_matcher(), |m| {
            commands::parse_volume_response(m)
        }) {
            Ok(current) => current,
            Err(e) => {
                reply.session.close().await;
                return Err(e);
            }
        };

        let target = commands::adjust_volume_units(current, delta_db);
        debug!(current, delta_db, target, "adjusting volume");
        let written = reply
            .session
            .write(&commands::cmd_set_volume_units(target))
            .await;
        reply.session.close().await;
        written?;

        Ok(commands::volume_units_to_level(target))
    }

    // -----------------------------------------------------------------
    // Mute
    // -----------------------------------------------------------------

    /// Mute or unmute.
    ///
    /// The cached mute state is refreshed by the next poll cycle.
    pub async fn set_mute(&self, muted: bool) -> Result<()> {
        self.io.write(&commands::cmd_set_mute(muted)).await
    }

    /// Ask the receiver for its mute state and refresh the cache.
    pub async fn query_mute(&self) -> Result<bool> {
        let message = self
            .io
            .read_text(&commands::cmd_query_mute(), &commands::mute_matcher())
            .await?;
        let muted = commands::parse_mute_response(&message)?;
        self.cache.set_muted(muted);
        Ok(muted)
    }

    /// Flip the mute state on a single connection. Returns the new state.
    pub async fn toggle_mute(&self) -> Result<bool> {
        let reply = self.io.read(&commands::cmd_query_mute()).await?;
        let muted = match parse_held(&reply, &commands::mute_matcher(), |m| {
            commands::parse_mute_response(m)
        }) {
            Ok(muted) => muted,
            Err(e) => {
                reply.session.close().await;
                return Err(e);
            }
        };

        let written = reply.session.write(&commands::cmd_set_mute(!muted)).await;
        reply.session.close().await;
        written?;

        Ok(!muted)
    }

    // -----------------------------------------------------------------
    // Source
    // -----------------------------------------------------------------

    /// Select an input source by its protocol token (e.g. `"BD"`, `"TUNER"`).
    pub async fn set_source(&self, token: &str) -> Result<()> {
        let command = commands::cmd_set_source(token)?;
        self.io.write(&command).await
    }

    /// Ask the receiver for its current source token and refresh the cache.
    pub async fn query_source(&self) -> Result<String> {
        let message = self
            .io
            .read_text(&commands::cmd_query_source(), &commands::source_matcher())
            .await?;
        let current = commands::parse_source_response(&message)?;
        self.cache.observe_source(current.clone());
        Ok(current)
    }

    /// Check with a live query whether `token` is the current source.
    pub async fn is_source(&self, token: &str) -> Result<bool> {
        Ok(self.query_source().await? == token)
    }

    // -----------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------

    /// Send an arbitrary command, closing the socket afterwards.
    pub async fn send_raw(&self, command: &str) -> Result<()> {
        commands::validate_command_text(command)?;
        if command.is_empty() {
            return Err(Error::InvalidParameter("empty command".into()));
        }
        info!(command, "sending custom command");
        self.io.write(command).await
    }

    /// Queue a write-close request.
    pub async fn write(&self, command: &str) -> Result<()> {
        self.io.write(command).await
    }

    /// Queue a read-hold request. Close the returned session promptly.
    pub async fn read(&self, command: &str) -> Result<ReadReply> {
        self.io.read(command).await
    }

    // -----------------------------------------------------------------
    // Cached state
    // -----------------------------------------------------------------

    /// Last known power state.
    pub fn power(&self) -> Option<bool> {
        self.cache.snapshot().power
    }

    /// Last known mute state.
    pub fn muted(&self) -> Option<bool> {
        self.cache.snapshot().muted
    }

    /// Last known volume in `0.0..=1.0`.
    pub fn volume(&self) -> Option<f32> {
        self.cache.snapshot().volume
    }

    /// Last known source token.
    pub fn source(&self) -> Option<String> {
        self.cache.snapshot().source
    }

    /// Snapshot of all cached values.
    pub fn state(&self) -> ReceiverState {
        self.cache.snapshot()
    }

    /// Watch the cached values.
    pub fn watch_state(&self) -> watch::Receiver<ReceiverState> {
        self.cache.watch()
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.cache.subscribe()
    }

    /// Current polling cadence; `None` when polling is disabled.
    pub fn poll_mode(&self) -> Option<PollMode> {
        self.poller.as_ref().map(StatusPoller::mode)
    }

    /// Current state of the connection slot.
    pub fn connection_state(&self) -> ConnectionState {
        self.io.connection_state()
    }

    /// Watch connection slot transitions.
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.io.subscribe_state()
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Tear the receiver down.
    ///
    /// Polling stops, queued and in-flight requests are dropped without
    /// being answered (their callers get [`Error::DeviceRemoved`]) and the
    /// open socket, if any, is closed.
    pub fn shutdown(&self) {
        if let Some(poller) = &self.poller {
            poller.stop();
        }
        self.io.shutdown();
    }

    /// `true` once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.io.is_shut_down()
    }
}

impl Drop for DenonReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pick and parse the answering message of a held reply.
fn parse_held<T>(
    reply: &ReadReply,
    matcher: &avrlib_text_io::ResponseMatcher,
    parse: impl FnOnce(&str) -> Result<T>,
) -> Result<T> {
    let message = reply.extract(matcher).ok_or_else(|| {
        Error::Unparsable(format!("no {} reply: {:?}", matcher.prefix, reply.text))
    })?;
    parse(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DenonBuilder;
    use avrlib_core::types::PowerCommand;
    use avrlib_test_harness::{ConnectionScript, MockConnector};
    use std::time::Duration;

    async fn receiver(mock: &MockConnector) -> DenonReceiver {
        DenonBuilder::new("192.168.1.40")
            .polling(false)
            .build_with_connector(Arc::new(mock.clone()))
            .await
            .unwrap()
    }

    async fn receiver_zm(mock: &MockConnector) -> DenonReceiver {
        DenonBuilder::new("192.168.1.40")
            .power_command(PowerCommand::Zm)
            .polling(false)
            .build_with_connector(Arc::new(mock.clone()))
            .await
            .unwrap()
    }

    // -----------------------------------------------------------------
    // Power
    // -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn set_power_updates_cache_optimistically() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PWON\r"));
        mock.push(ConnectionScript::new().expect(b"PWSTANDBY\r"));
        let avr = receiver(&mock).await;

        assert_eq!(avr.power(), None);
        avr.set_power(true).await.unwrap();
        assert_eq!(avr.power(), Some(true));
        avr.set_power(false).await.unwrap();
        assert_eq!(avr.power(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_power_write_keeps_cache() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::stall());
        let avr = receiver(&mock).await;

        let result = avr.set_power(true).await;
        assert!(matches!(result, Err(Error::ConnectTimeout)));
        assert_eq!(avr.power(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn zm_dialect_power() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"ZMOFF\r"));
        let avr = receiver_zm(&mock).await;

        avr.set_power(false).await.unwrap();
        assert_eq!(mock.sent_commands(), vec!["ZMOFF"]);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_power_queries_then_writes() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PW?\r").reply(b"PWSTANDBY\r"));
        mock.push(ConnectionScript::new().expect(b"PWON\r"));
        let avr = receiver(&mock).await;

        assert!(avr.toggle_power().await.unwrap());
        assert_eq!(avr.power(), Some(true));
        assert_eq!(mock.sent_commands(), vec!["PW?", "PWON"]);
    }

    #[tokio::test(start_paused = true)]
    async fn query_power_ignores_other_zone_lines() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"PW?\r")
                .reply(b"Z2ON\rPWON\r"),
        );
        let avr = receiver(&mock).await;

        assert!(avr.query_power().await.unwrap());
    }

    // -----------------------------------------------------------------
    // Volume
    // -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn set_volume_scales_and_pads() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MV490\r"));
        mock.push(ConnectionScript::new().expect(b"MV000\r"));
        mock.push(ConnectionScript::new().expect(b"MV980\r"));
        let avr = receiver(&mock).await;

        avr.set_volume(0.5).await.unwrap();
        avr.set_volume(-1.0).await.unwrap();
        avr.set_volume(1.0).await.unwrap();
        // Not optimistic.
        assert_eq!(avr.volume(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_steps() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MVUP\r"));
        mock.push(ConnectionScript::new().expect(b"MVDOWN\r"));
        let avr = receiver(&mock).await;

        avr.volume_up().await.unwrap();
        avr.volume_down().await.unwrap();
        assert_eq!(mock.sent_commands(), vec!["MVUP", "MVDOWN"]);
    }

    #[tokio::test(start_paused = true)]
    async fn adjust_volume_normalises_two_digit_reply() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"MV?\r")
                .reply(b"MV45\rMVMAX 98\r")
                .expect(b"MV475\r"),
        );
        let avr = receiver(&mock).await;

        let level = avr.adjust_volume_db(2.5).await.unwrap();
        assert_eq!(level, 475.0 / 980.0);
        assert_eq!(mock.connect_count(), 1);
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn adjust_volume_never_goes_negative() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"MV?\r")
                .reply(b"MV055\r")
                .expect(b"MV000\r"),
        );
        let avr = receiver(&mock).await;

        assert_eq!(avr.adjust_volume_db(-10.0).await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn adjust_volume_without_value_releases_socket() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MV?\r").reply(b"MVMAX 98\r"));
        let avr = receiver(&mock).await;

        let result = avr.adjust_volume_db(1.0).await;
        assert!(matches!(result, Err(Error::Unparsable(_))));
        assert_eq!(mock.open_connections(), 0);
    }

    // -----------------------------------------------------------------
    // Mute
    // -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn set_mute_writes_keyword() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MUON\r"));
        let avr = receiver(&mock).await;

        avr.set_mute(true).await.unwrap();
        assert_eq!(avr.muted(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_mute_uses_one_connection() {
        let mock = MockConnector::new();
        mock.push(
            ConnectionScript::new()
                .expect(b"MU?\r")
                .reply(b"MUON\r")
                .expect(b"MUOFF\r"),
        );
        let avr = receiver(&mock).await;

        assert!(!avr.toggle_mute().await.unwrap());
        assert_eq!(mock.connect_count(), 1);
        assert_eq!(mock.sent_commands(), vec!["MU?", "MUOFF"]);
    }

    #[tokio::test(start_paused = true)]
    async fn live_queries_refresh_cache() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MU?\r").reply(b"MUON\r"));
        mock.push(
            ConnectionScript::new()
                .expect(b"MV?\r")
                .reply(b"MV49\rMVMAX 98\r"),
        );
        let avr = receiver(&mock).await;

        assert!(avr.query_mute().await.unwrap());
        assert_eq!(avr.query_volume().await.unwrap(), 0.5);
        assert_eq!(avr.muted(), Some(true));
        assert_eq!(avr.volume(), Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_reply_surfaces() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MU?\r").reply(b"SSINFAI\r"));
        let avr = receiver(&mock).await;

        let result = avr.query_mute().await;
        assert!(matches!(result, Err(Error::DeviceReported(_))));
        assert_eq!(avr.muted(), None);
    }

    // -----------------------------------------------------------------
    // Source and raw
    // -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn set_and_check_source() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"SIBD\r"));
        mock.push(
            ConnectionScript::new()
                .expect(b"SI?\r")
                .reply(b"SIBD\rSVOFF\r"),
        );
        let avr = receiver(&mock).await;

        avr.set_source("BD").await.unwrap();
        assert!(avr.is_source("BD").await.unwrap());
        assert_eq!(avr.source().as_deref(), Some("BD"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commands_never_reach_the_queue() {
        let mock = MockConnector::new();
        let avr = receiver(&mock).await;

        assert!(matches!(
            avr.send_raw("PW\rON").await,
            Err(Error::InvalidParameter(_))
        ));
        assert!(avr.send_raw("").await.is_err());
        assert!(avr.set_source("").await.is_err());
        assert!(avr.set_volume(f32::NAN).await.is_err());
        assert!(avr.adjust_volume_db(f32::NAN).await.is_err());
        assert_eq!(mock.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_raw_passes_through() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"PSMODE:MUSIC\r"));
        let avr = receiver(&mock).await;

        avr.send_raw("PSMODE:MUSIC").await.unwrap();
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_requests() {
        let mock = MockConnector::new();
        mock.push(ConnectionScript::new().expect(b"MU?\r"));
        let avr = Arc::new(receiver(&mock).await);

        let pending = tokio::spawn({
            let avr = Arc::clone(&avr);
            async move { avr.toggle_mute().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        avr.shutdown();

        assert!(matches!(pending.await.unwrap(), Err(Error::DeviceRemoved)));
        assert!(avr.is_shut_down());
        assert!(matches!(avr.set_mute(true).await, Err(Error::DeviceRemoved)));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_disabled_has_no_mode() {
        let mock = MockConnector::new();
        let avr = receiver(&mock).await;
        assert_eq!(avr.poll_mode(), None);
        assert_eq!(avr.connection_state(), ConnectionState::Idle);
    }
}
