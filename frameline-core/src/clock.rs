//! Playback clock
//!
//! The audio hardware clock is the master; video presentation time is
//! derived from it, never from wall time. Starting playback schedules the
//! audio a small lookahead into the future, and presentation time stays
//! pinned at the anchor until the hardware clock passes that scheduled
//! start, so the first video frames cannot run ahead of audible audio.

use crate::session::DEFAULT_SCHEDULE_LOOKAHEAD_SECS;

/// Boundary to the audio device layer.
///
/// `now` is the device clock in seconds; it keeps its value across
/// suspend/resume and never goes backwards. `restart_sources` rebuilds the
/// output chain so that audible audio begins at `at_ms` of media time.
pub trait AudioOutput: Send {
    fn now(&self) -> f64;
    fn resume(&self);
    fn suspend(&self);
    fn restart_sources(&self, at_ms: f64);
}

/// What to do when presentation time reaches the end of media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAction {
    Loop,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub presentation_time_ms: f64,
    pub total_duration_ms: f64,
}

/// Anchor pair taken when playback (re)starts.
struct Anchor {
    /// Media position at the anchor, in ms
    presentation_anchor_ms: f64,
    /// Device time at which the scheduled audio becomes audible
    schedule_time: f64,
}

pub struct PlaybackClock {
    audio: Box<dyn AudioOutput>,
    total_duration_ms: f64,
    lookahead_secs: f64,
    playing: bool,
    current_ms: f64,
    /// Media position the audio sources were last built for
    sources_at_ms: f64,
    anchor: Option<Anchor>,
    on_ended: Option<Box<dyn FnMut() -> EndAction + Send>>,
}

impl PlaybackClock {
    /// `audio` is assumed to have its sources built for position 0.
    pub fn new(audio: Box<dyn AudioOutput>, total_duration_ms: f64) -> Self {
        Self::with_lookahead(audio, total_duration_ms, DEFAULT_SCHEDULE_LOOKAHEAD_SECS)
    }

    pub fn with_lookahead(
        audio: Box<dyn AudioOutput>,
        total_duration_ms: f64,
        lookahead_secs: f64,
    ) -> Self {
        Self {
            audio,
            total_duration_ms,
            lookahead_secs,
            playing: false,
            current_ms: 0.0,
            sources_at_ms: 0.0,
            anchor: None,
            on_ended: None,
        }
    }

    /// Called when presentation time reaches the end of media; the return
    /// value picks looping or stopping. Without a callback the clock stops.
    pub fn on_ended(&mut self, callback: impl FnMut() -> EndAction + Send + 'static) {
        self.on_ended = Some(Box::new(callback));
    }

    /// No-op when already playing.
    pub fn play(&mut self) {
        if self.playing {
            return;
        }
        if self.current_ms != self.sources_at_ms {
            self.audio.restart_sources(self.current_ms);
            self.sources_at_ms = self.current_ms;
        }
        self.audio.resume();
        self.anchor = Some(self.make_anchor());
        self.playing = true;
        tracing::debug!(position_ms = self.current_ms, "playback started");
    }

    /// No-op when already paused. Captures the derived time, then suspends
    /// the audio output.
    pub fn pause(&mut self) {
        if !self.playing {
            return;
        }
        self.current_ms = self.derive_time().min(self.total_duration_ms);
        self.audio.suspend();
        self.anchor = None;
        self.playing = false;
        tracing::debug!(position_ms = self.current_ms, "playback paused");
    }

    /// Seek. While playing this rebuilds the audio sources at the new
    /// position and re-anchors; while paused it only moves the position.
    pub fn set_time(&mut self, ms: f64) {
        let ms = ms.clamp(0.0, self.total_duration_ms);
        self.current_ms = ms;
        if self.playing {
            self.audio.restart_sources(ms);
            self.sources_at_ms = ms;
            self.anchor = Some(self.make_anchor());
        }
    }

    /// Advance the clock and return the current presentation time in ms.
    /// Detects end of media and applies the configured end action.
    pub fn tick(&mut self) -> f64 {
        if !self.playing {
            return self.current_ms;
        }
        let derived = self.derive_time();
        if derived >= self.total_duration_ms {
            return self.finish();
        }
        self.current_ms = derived;
        derived
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn current_time_ms(&self) -> f64 {
        self.current_ms
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            is_playing: self.playing,
            presentation_time_ms: self.current_ms,
            total_duration_ms: self.total_duration_ms,
        }
    }

    fn make_anchor(&self) -> Anchor {
        Anchor {
            presentation_anchor_ms: self.current_ms,
            schedule_time: self.audio.now() + self.lookahead_secs,
        }
    }

    fn derive_time(&self) -> f64 {
        let Some(anchor) = &self.anchor else {
            return self.current_ms;
        };
        let now = self.audio.now();
        if now < anchor.schedule_time {
            // Audio not audible yet; hold at the anchor.
            anchor.presentation_anchor_ms
        } else {
            anchor.presentation_anchor_ms + (now - anchor.schedule_time) * 1000.0
        }
    }

    fn finish(&mut self) -> f64 {
        let action = match self.on_ended.as_mut() {
            Some(callback) => callback(),
            None => EndAction::Stop,
        };
        match action {
            EndAction::Loop => {
                tracing::debug!("end of media, looping");
                self.current_ms = 0.0;
                self.audio.restart_sources(0.0);
                self.sources_at_ms = 0.0;
                self.anchor = Some(self.make_anchor());
                self.current_ms
            }
            EndAction::Stop => {
                tracing::debug!("end of media, stopping");
                self.playing = false;
                self.anchor = None;
                self.audio.suspend();
                self.current_ms = self.total_duration_ms;
                self.current_ms
            }
        }
    }
}
