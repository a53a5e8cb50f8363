//! Clock provider adapter
//!
//! The hub never owns time itself. It reads tempo, transport, beat and phase
//! from a [`ClockProvider`] and forwards client clock commands to it. Value
//! changes come back as [`ClockEvent`]s pushed into a channel the hub drains
//! on its own task, so provider threads never touch hub state.
//!
//! [`SoftwareClock`] is the bundled provider: a single-host beat timeline
//! without network peers. Network-synchronized providers plug in through the
//! same trait.

use beatbridge_core::time::{self, Timestamp};
use beatbridge_core::ClockState;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Value change reported by a clock provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    TempoChanged(f64),
    TransportChanged(bool),
    PeersChanged(u32),
}

/// Where a provider delivers its change notifications
pub type ClockEventSink = mpsc::UnboundedSender<ClockEvent>;

/// External time-sync capability.
///
/// Implementations are driven from several tasks at once and must not block.
/// Notifications go to the sink installed with [`set_event_sink`]; pushing
/// into it never blocks.
///
/// [`set_event_sink`]: ClockProvider::set_event_sink
pub trait ClockProvider: Send + Sync {
    fn enable(&self, on: bool);
    fn enable_start_stop_sync(&self, on: bool);

    fn tempo(&self) -> f64;
    fn set_tempo(&self, tempo: f64);

    fn is_playing(&self) -> bool;
    fn set_is_playing(&self, playing: bool);

    fn beat(&self) -> f64;
    /// Position within `quantum`, in `[0, quantum)`
    fn phase(&self, quantum: f64) -> f64;
    fn num_peers(&self) -> u32;

    /// Align a transport start with the next quantum boundary
    fn request_quantized_start(&self, quantum: f64);
    /// Hard-set the beat reached at host time `time` (microseconds)
    fn force_beat_at_time(&self, beat: f64, time: Timestamp, quantum: f64);

    /// Install (`Some`) or detach (`None`) the change notification sink
    fn set_event_sink(&self, sink: Option<ClockEventSink>);
}

/// Hub-side wrapper around the injected provider.
///
/// While inactive, reads return the idle defaults and writes are dropped, so
/// callers never need to know whether the provider is running.
pub struct ClockAdapter {
    provider: Arc<dyn ClockProvider>,
    active: RwLock<bool>,
    default_tempo: f64,
    quantum: u32,
}

impl ClockAdapter {
    pub fn new(provider: Arc<dyn ClockProvider>, default_tempo: f64, quantum: u32) -> Self {
        Self {
            provider,
            active: RwLock::new(false),
            default_tempo,
            quantum,
        }
    }

    /// Enable the provider and register for its notifications
    pub fn activate(&self, sink: ClockEventSink) {
        let mut active = self.active.write();
        if *active {
            return;
        }
        self.provider.enable(true);
        self.provider.enable_start_stop_sync(true);
        self.provider.set_event_sink(Some(sink));
        *active = true;
        debug!("Clock provider enabled. peers: {}", self.provider.num_peers());
    }

    /// Detach notifications and disable the provider
    pub fn deactivate(&self) {
        let mut active = self.active.write();
        if !*active {
            return;
        }
        *active = false;
        self.provider.set_event_sink(None);
        self.provider.enable(false);
        debug!("Clock provider disabled");
    }

    pub fn is_active(&self) -> bool {
        *self.active.read()
    }

    /// Configured bar length
    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    /// Current clock view, or the idle defaults when inactive
    pub fn state(&self) -> ClockState {
        let active = self.active.read();
        if !*active {
            return ClockState::inactive(self.default_tempo, self.quantum);
        }
        ClockState {
            tempo: self.provider.tempo(),
            is_playing: self.provider.is_playing(),
            beat: self.provider.beat(),
            phase: self.provider.phase(f64::from(self.quantum)),
            quantum: self.quantum,
            num_peers: self.provider.num_peers(),
        }
    }

    pub fn tempo(&self) -> f64 {
        if self.is_active() {
            self.provider.tempo()
        } else {
            self.default_tempo
        }
    }

    /// Apply a tempo change; returns false when inactive or the value is unusable
    pub fn set_tempo(&self, tempo: f64) -> bool {
        if !tempo.is_finite() || tempo <= 0.0 {
            return false;
        }
        self.with_provider(|p| p.set_tempo(tempo))
    }

    pub fn set_is_playing(&self, playing: bool) -> bool {
        self.with_provider(|p| p.set_is_playing(playing))
    }

    pub fn request_quantized_start(&self, quantum: f64) -> bool {
        self.with_provider(|p| p.request_quantized_start(quantum))
    }

    pub fn force_beat_at_time(&self, beat: f64, time: Timestamp, quantum: f64) -> bool {
        self.with_provider(|p| p.force_beat_at_time(beat, time, quantum))
    }

    fn with_provider(&self, f: impl FnOnce(&dyn ClockProvider)) -> bool {
        let active = self.active.read();
        if !*active {
            return false;
        }
        f(self.provider.as_ref());
        true
    }
}

// ============================================================================
// Software clock
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Timeline {
    tempo: f64,
    /// Beat reached at `origin_time`
    origin_beat: f64,
    origin_time: Timestamp,
}

impl Timeline {
    fn beat_at(&self, at: Timestamp) -> f64 {
        self.origin_beat + time::beats_in(at - self.origin_time, self.tempo)
    }

    fn time_at(&self, beat: f64) -> Timestamp {
        self.origin_time + time::micros_for(beat - self.origin_beat, self.tempo)
    }

    /// Keep the beat continuous across a change made at `at`
    fn rebase(&mut self, at: Timestamp) {
        self.origin_beat = self.beat_at(at);
        self.origin_time = at;
    }
}

#[derive(Debug)]
struct SoftwareClockState {
    enabled: bool,
    start_stop_sync: bool,
    is_playing: bool,
    timeline: Timeline,
}

/// Local beat timeline with no network peers.
///
/// Beat advances with host time whether or not the transport is playing.
/// Every local call that actually changes tempo or transport is reported to
/// the installed sink.
pub struct SoftwareClock {
    state: Mutex<SoftwareClockState>,
    sink: Mutex<Option<ClockEventSink>>,
}

impl SoftwareClock {
    pub fn new(tempo: f64) -> Self {
        let tempo = if tempo.is_finite() && tempo > 0.0 {
            tempo
        } else {
            beatbridge_core::DEFAULT_TEMPO
        };
        Self {
            state: Mutex::new(SoftwareClockState {
                enabled: false,
                start_stop_sync: false,
                is_playing: false,
                timeline: Timeline {
                    tempo,
                    origin_beat: 0.0,
                    origin_time: time::now(),
                },
            }),
            sink: Mutex::new(None),
        }
    }

    /// Beat reached at host time `at` (microseconds)
    pub fn beat_at_time(&self, at: Timestamp) -> f64 {
        self.state.lock().timeline.beat_at(at)
    }

    /// Host time at which `beat` is reached
    pub fn time_at_beat(&self, beat: f64) -> Timestamp {
        self.state.lock().timeline.time_at(beat)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn emit(&self, event: ClockEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    /// Change the transport; returns the event to report, if any
    fn apply_playing(state: &mut SoftwareClockState, playing: bool) -> Option<ClockEvent> {
        if state.is_playing == playing {
            return None;
        }
        state.is_playing = playing;
        state
            .start_stop_sync
            .then_some(ClockEvent::TransportChanged(playing))
    }
}

impl ClockProvider for SoftwareClock {
    fn enable(&self, on: bool) {
        self.state.lock().enabled = on;
    }

    fn enable_start_stop_sync(&self, on: bool) {
        self.state.lock().start_stop_sync = on;
    }

    fn tempo(&self) -> f64 {
        self.state.lock().timeline.tempo
    }

    fn set_tempo(&self, tempo: f64) {
        if !tempo.is_finite() || tempo <= 0.0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.timeline.tempo == tempo {
                return;
            }
            state.timeline.rebase(time::now());
            state.timeline.tempo = tempo;
        }
        self.emit(ClockEvent::TempoChanged(tempo));
    }

    fn is_playing(&self) -> bool {
        self.state.lock().is_playing
    }

    fn set_is_playing(&self, playing: bool) {
        let event = Self::apply_playing(&mut self.state.lock(), playing);
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn beat(&self) -> f64 {
        self.beat_at_time(time::now())
    }

    fn phase(&self, quantum: f64) -> f64 {
        if !quantum.is_finite() || quantum <= 0.0 {
            return 0.0;
        }
        self.beat().rem_euclid(quantum)
    }

    fn num_peers(&self) -> u32 {
        0
    }

    fn request_quantized_start(&self, quantum: f64) {
        if !quantum.is_finite() || quantum <= 0.0 {
            return;
        }
        let event = {
            let mut state = self.state.lock();
            let now = time::now();
            let beat = state.timeline.beat_at(now);
            let boundary = (beat / quantum).ceil() * quantum;
            // Beat 0 lands on the next bar line; phase is unchanged
            state.timeline = Timeline {
                tempo: state.timeline.tempo,
                origin_beat: 0.0,
                origin_time: state.timeline.time_at(boundary),
            };
            Self::apply_playing(&mut state, true)
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn force_beat_at_time(&self, beat: f64, time: Timestamp, _quantum: f64) {
        if !beat.is_finite() {
            return;
        }
        let mut state = self.state.lock();
        state.timeline.origin_beat = beat;
        state.timeline.origin_time = time;
    }

    fn set_event_sink(&self, sink: Option<ClockEventSink>) {
        *self.sink.lock() = sink;
    }
}
