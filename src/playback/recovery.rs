use std::time::{Duration, Instant};

use crate::core::VideoItem;
use crate::playback::{MediaElement, MediaEvent};

/// How long a stall must persist before recovery kicks in
pub const STALL_CONFIRMATION: Duration = Duration::from_millis(1000);

/// Buffered-ahead seconds considered enough to keep playing
pub const HEALTHY_BUFFER_SECONDS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Loading,
    Ready,
    Playing,
    Stalled,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub phase: PlaybackPhase,
    pub is_loading: bool,
    pub error: Option<String>,
    pub is_stalled: bool,
    pub is_looping: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            phase: PlaybackPhase::Loading,
            is_loading: true,
            error: None,
            is_stalled: false,
            is_looping: false,
        }
    }
}

/// Raised towards the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// Natural end of a non-looping item
    Ended,
}

/// Drives one item's media element: load, gated play, stall recovery,
/// error classification and end-of-media handling.
pub struct PlaybackController<M: MediaElement> {
    media: M,
    item: VideoItem,
    is_active: bool,
    has_interacted: bool,
    state: PlaybackState,
    stall_since: Option<Instant>,
    recoveries: u32,
}

impl<M: MediaElement> PlaybackController<M> {
    /// Assign the item's source and start loading. The item starts inactive.
    pub fn new(mut media: M, item: VideoItem, has_interacted: bool) -> Self {
        let mut state = PlaybackState::default();

        media.set_source(&item.video_url);
        if let Err(e) = media.load() {
            log::warn!("Video loading error for {}: {}", item.video_url, e);
            state.phase = PlaybackPhase::Error;
            state.is_loading = false;
            state.error = Some(format!("Failed to load video ({})", e));
        }

        Self {
            media,
            item,
            is_active: false,
            has_interacted,
            state,
            stall_since: None,
            recoveries: 0,
        }
    }

    pub fn item(&self) -> &VideoItem {
        &self.item
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }

    pub fn set_active(&mut self, active: bool) {
        if active == self.is_active {
            return;
        }
        self.is_active = active;

        if active {
            log::debug!("Activating {}", self.item.video_url);
            self.attempt_play();
        } else {
            log::debug!("Deactivating {}", self.item.video_url);
            self.media.pause();
            self.stall_since = None;
            self.state = PlaybackState::default();
        }
    }

    pub fn set_user_interacted(&mut self, interacted: bool) {
        if interacted && !self.has_interacted {
            self.has_interacted = true;
            if self.is_active {
                self.attempt_play();
            }
        }
    }

    /// Process pending media events and timers. Call once per frame.
    pub fn update(&mut self, now: Instant) -> Option<PlaybackSignal> {
        let mut signal = None;
        for event in self.media.drain_events() {
            if let Some(s) = self.handle_event(event, now) {
                signal = Some(s);
            }
        }
        self.tick(now);
        signal
    }

    pub fn handle_event(&mut self, event: MediaEvent, now: Instant) -> Option<PlaybackSignal> {
        if self.state.phase == PlaybackPhase::Error {
            log::debug!("Ignoring {:?} for failed video {}", event, self.item.video_url);
            return None;
        }

        match event {
            MediaEvent::LoadedData => {
                log::debug!("Video loaded: {}", self.item.video_url);
                self.state.is_loading = false;
                self.state.error = None;
                self.state.is_stalled = false;
                if self.state.phase != PlaybackPhase::Playing {
                    self.state.phase = PlaybackPhase::Ready;
                }
                if self.is_active && self.media.is_paused() {
                    self.attempt_play();
                }
            }
            MediaEvent::CanPlay => {
                self.state.is_loading = false;
                self.state.is_stalled = false;
                if matches!(self.state.phase, PlaybackPhase::Loading | PlaybackPhase::Stalled) {
                    self.state.phase = PlaybackPhase::Ready;
                }
            }
            MediaEvent::Waiting => {
                self.state.is_loading = true;
            }
            MediaEvent::Stalled => {
                log::debug!("Video stalled: {}", self.item.video_url);
                // A fresh stall signal restarts the confirmation window.
                self.stall_since = Some(now);
            }
            MediaEvent::Progress => {
                if self.media.buffered_ahead() >= HEALTHY_BUFFER_SECONDS {
                    self.state.is_stalled = false;
                    self.state.is_loading = false;
                }
            }
            MediaEvent::Playing => {
                self.state.is_loading = false;
                self.state.is_stalled = false;
                self.state.phase = PlaybackPhase::Playing;
                self.stall_since = None;
            }
            MediaEvent::Paused => {
                if self.state.phase == PlaybackPhase::Playing {
                    self.state.phase = PlaybackPhase::Ready;
                }
            }
            MediaEvent::Ended => {
                if !self.is_active {
                    return None;
                }
                if self.state.is_looping {
                    if let Err(e) = self.media.seek(0.0) {
                        log::warn!("Failed to rewind looping video: {}", e);
                    }
                    self.attempt_play();
                } else {
                    self.state.phase = PlaybackPhase::Ready;
                    return Some(PlaybackSignal::Ended);
                }
            }
            MediaEvent::Error { kind, detail } => {
                let format = self.item.video_format();
                let mut message = kind.describe(format.as_deref());
                if !detail.is_empty() {
                    message = format!("{} ({})", message, detail);
                }
                log::warn!("Video loading error: {} [{}]", message, self.item.video_url);

                self.state.phase = PlaybackPhase::Error;
                self.state.error = Some(message);
                self.state.is_loading = false;
                self.state.is_stalled = false;
                self.stall_since = None;
            }
        }
        None
    }

    /// Confirm a stall once it has lasted long enough, then recover.
    pub fn tick(&mut self, now: Instant) {
        let Some(since) = self.stall_since else {
            return;
        };
        if now.duration_since(since) < STALL_CONFIRMATION {
            return;
        }
        self.stall_since = None;

        if !self.is_active {
            return;
        }

        log::warn!("Video stalled: {}", self.item.video_url);
        self.state.phase = PlaybackPhase::Stalled;
        self.state.is_stalled = true;
        self.state.is_loading = true;
        self.recover_from_stall();
    }

    /// Click on the video surface
    pub fn toggle_playback(&mut self) {
        if !self.has_interacted || self.state.phase == PlaybackPhase::Error {
            return;
        }

        if self.media.is_paused() {
            self.attempt_play();
        } else {
            self.media.pause();
            if self.state.phase == PlaybackPhase::Playing {
                self.state.phase = PlaybackPhase::Ready;
            }
        }
    }

    pub fn toggle_loop(&mut self) {
        self.state.is_looping = !self.state.is_looping;
        log::debug!("Looping {} for {}", if self.state.is_looping { "on" } else { "off" }, self.item.video_url);
    }

    fn attempt_play(&mut self) -> bool {
        if !self.is_active || !self.has_interacted {
            return false;
        }
        if self.state.phase == PlaybackPhase::Error {
            return false;
        }

        match self.media.play() {
            Ok(()) => {
                log::debug!("Video playing successfully");
                if self.state.phase != PlaybackPhase::Stalled {
                    self.state.phase = PlaybackPhase::Playing;
                }
                true
            }
            Err(e) => {
                log::warn!("Play attempt failed: {}", e);
                false
            }
        }
    }

    fn recover_from_stall(&mut self) {
        if !self.is_active {
            return;
        }
        self.recoveries += 1;

        let position = self.media.current_time();
        let was_playing = !self.media.is_paused();
        log::info!("Recovering from stall at {:.2}s (was playing: {})", position, was_playing);

        let reloaded = {
            let media = &mut self.media;
            media.set_source(&self.item.video_url);
            media.load().and_then(|()| media.seek(position))
        };

        match reloaded {
            Ok(()) => {
                self.state.is_stalled = false;
                self.state.is_loading = false;
                self.state.phase = PlaybackPhase::Ready;
                if was_playing {
                    self.attempt_play();
                }
            }
            Err(e) => {
                log::warn!("Failed to recover from stall: {}", e);
            }
        }
    }
}
