/// Classification of an unrecoverable media failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    Aborted,
    Network,
    Decode,
    UnsupportedFormat,
}

impl MediaErrorKind {
    /// Human-readable message for display. `format` is the file extension of
    /// the source, used for unsupported formats.
    pub fn describe(&self, format: Option<&str>) -> String {
        match self {
            MediaErrorKind::Aborted => "Video loading aborted".to_string(),
            MediaErrorKind::Network => "Network error while loading video".to_string(),
            MediaErrorKind::Decode => "Video decoding failed - the video might be corrupted".to_string(),
            MediaErrorKind::UnsupportedFormat => match format {
                Some(format) => format!("Video format not supported ({})", format),
                None => "Video format not supported".to_string(),
            },
        }
    }
}

/// Notifications from a media element, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Enough data to show the first frame
    LoadedData,
    CanPlay,
    /// Playback is waiting for data
    Waiting,
    /// Data stopped arriving
    Stalled,
    /// Buffer grew; the element reports how many seconds are buffered ahead
    Progress,
    Playing,
    Paused,
    Ended,
    Error { kind: MediaErrorKind, detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("no source assigned")]
    NoSource,
    #[error("failed to start decoder: {0}")]
    Spawn(String),
    #[error("media backend is gone")]
    Disconnected,
}

/// The operations the playback controller needs from a media backend.
///
/// Commands are fire-and-forget; their asynchronous outcome shows up later
/// as [`MediaEvent`]s from [`drain_events`](MediaElement::drain_events).
pub trait MediaElement {
    fn set_source(&mut self, url: &str);
    fn load(&mut self) -> Result<(), MediaError>;
    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self);
    fn seek(&mut self, seconds: f64) -> Result<(), MediaError>;
    fn current_time(&self) -> f64;
    /// Seconds of media buffered beyond the current position
    fn buffered_ahead(&self) -> f64;
    fn is_paused(&self) -> bool;
    fn drain_events(&mut self) -> Vec<MediaEvent>;
}
