//! Last-known receiver state and change notifications.
//!
//! Values are only ever replaced by a successfully parsed reply (or an
//! acknowledged write); failures leave the previous value in place. Every
//! replacement of a known value by a different one is announced on the
//! event channel. The first observation of a value is never announced:
//! there is nothing it changed from.

use tokio::sync::{broadcast, watch};
use tracing::debug;

use avrlib_core::events::ReceiverEvent;
use avrlib_core::types::{PollMode, ReceiverState};

pub(crate) struct StatusCache {
    state: watch::Sender<ReceiverState>,
    events: broadcast::Sender<ReceiverEvent>,
}

impl StatusCache {
    pub(crate) fn new(event_capacity: usize) -> Self {
        let (state, _) = watch::channel(ReceiverState::default());
        let (events, _) = broadcast::channel(event_capacity.max(1));
        StatusCache { state, events }
    }

    pub(crate) fn snapshot(&self) -> ReceiverState {
        self.state.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ReceiverState> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ReceiverEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Store `value` in the field chosen by `field`; returns the previous
    /// value if it was known and different.
    fn replace<T: Clone + PartialEq>(
        &self,
        value: T,
        field: impl Fn(&mut ReceiverState) -> &mut Option<T>,
    ) -> Option<T> {
        let mut changed_from = None;
        self.state.send_if_modified(|state| {
            let slot = field(state);
            if slot.as_ref() == Some(&value) {
                return false;
            }
            changed_from = slot.replace(value.clone());
            true
        });
        changed_from
    }

    pub(crate) fn set_power(&self, on: bool) {
        if self.replace(on, |s| &mut s.power).is_some() {
            debug!(on, "power changed");
            self.emit(ReceiverEvent::PowerChanged { on });
        }
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        if self.replace(muted, |s| &mut s.muted).is_some() {
            debug!(muted, "mute changed");
            self.emit(ReceiverEvent::MuteChanged { muted });
        }
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        if self.replace(volume, |s| &mut s.volume).is_some() {
            debug!(volume, "volume changed");
            self.emit(ReceiverEvent::VolumeChanged { volume });
        }
    }

    pub(crate) fn observe_source(&self, source: String) {
        if let Some(previous) = self.replace(source.clone(), |s| &mut s.source) {
            debug!(from = %previous, to = %source, "source changed");
            self.emit(ReceiverEvent::SourceChanged { source });
        }
    }

    pub(crate) fn poll_mode_changed(&self, mode: PollMode) {
        self.emit(ReceiverEvent::PollModeChanged { mode });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_silent() {
        let cache = StatusCache::new(8);
        let mut events = cache.subscribe();

        cache.observe_source("TUNER".into());
        cache.set_power(true);
        cache.set_muted(false);
        cache.set_volume(0.5);

        assert!(events.try_recv().is_err());
        let state = cache.snapshot();
        assert_eq!(state.source.as_deref(), Some("TUNER"));
        assert_eq!(state.power, Some(true));
        assert_eq!(state.muted, Some(false));
        assert_eq!(state.volume, Some(0.5));
    }

    #[test]
    fn change_is_announced_once() {
        let cache = StatusCache::new(8);
        let mut events = cache.subscribe();

        cache.observe_source("TUNER".into());
        cache.observe_source("BD".into());
        cache.observe_source("BD".into());

        assert_eq!(
            events.try_recv().unwrap(),
            ReceiverEvent::SourceChanged {
                source: "BD".into()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn power_mute_volume_events() {
        let cache = StatusCache::new(8);
        cache.set_power(false);
        cache.set_muted(false);
        cache.set_volume(0.2);
        let mut events = cache.subscribe();

        cache.set_power(true);
        cache.set_muted(true);
        cache.set_volume(0.3);

        assert_eq!(events.try_recv().unwrap(), ReceiverEvent::PowerChanged { on: true });
        assert_eq!(events.try_recv().unwrap(), ReceiverEvent::MuteChanged { muted: true });
        assert_eq!(events.try_recv().unwrap(), ReceiverEvent::VolumeChanged { volume: 0.3 });
    }

    #[test]
    fn watchers_see_updates() {
        let cache = StatusCache::new(8);
        let mut rx = cache.watch();
        assert!(!rx.has_changed().unwrap());

        cache.set_power(true);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().power, Some(true));

        cache.set_power(true);
        assert!(!rx.has_changed().unwrap());
    }
}
