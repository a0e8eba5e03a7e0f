// =============================================================================
// FFMPEG MEDIA - MediaElement BACKED BY FFMPEG PROCESSES
// =============================================================================
//
// A dedicated playback thread owns everything that blocks:
// - ffprobe validates a source on load and classifies failures
// - one ffmpeg process decodes RGBA frames at a fixed size and rate (stdout)
// - a second ffmpeg process decodes f32le stereo audio into a rodio sink
// - frames are released by timestamp; an empty buffer freezes the clock and
//   is reported as waiting, then stalled
//
// The GUI side only sends commands and drains status/frames each frame.
//
// =============================================================================

use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use egui::{Context, TextureHandle};
use rodio::{OutputStream, OutputStreamHandle, Sink};

use crate::core::PlaybackConfig;
use crate::playback::audio::{audio_reader_thread, AudioBuffer, StreamingAudioSource, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::playback::{MediaElement, MediaError, MediaErrorKind, MediaEvent};

const OUTPUT_FRAME_RATE: f64 = 30.0;
/// ~3 seconds of decoded video
const MAX_BUFFERED_FRAMES: usize = 90;
const WAITING_AFTER: Duration = Duration::from_millis(150);
const STALLED_AFTER: Duration = Duration::from_secs(2);
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}

impl MediaSettings {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone().unwrap_or_else(|| PathBuf::from("ffmpeg")),
            ffprobe: config.ffprobe_path.clone().unwrap_or_else(|| PathBuf::from("ffprobe")),
            frame_width: config.frame_width,
            frame_height: config.frame_height,
        }
    }

    fn frame_size(&self) -> usize {
        (self.frame_width * self.frame_height * 4) as usize
    }

    /// Letterbox into the fixed output size
    fn scale_filter(&self) -> String {
        let (w, h) = (self.frame_width, self.frame_height);
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black"
        )
    }
}

/// Decoded RGBA frame
#[derive(Debug)]
pub struct VideoFrame {
    pub image_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: f64,
}

#[derive(Debug)]
enum PlayerCommand {
    SetSource(String),
    Load,
    Play,
    Pause,
    Seek(f64),
    Shutdown,
}

#[derive(Debug)]
enum PlayerStatus {
    Event(MediaEvent),
    Position(f64),
    Buffered(f64),
}

/// Map ffmpeg/ffprobe error output to a media error class.
pub fn classify_ffmpeg_error(stderr: &str) -> MediaErrorKind {
    let text = stderr.to_lowercase();

    const ABORTED: [&str; 3] = ["received signal", "immediate exit requested", "interrupted"];
    const NETWORK: [&str; 10] = [
        "connection refused", "connection reset", "timed out", "network is unreachable",
        "failed to resolve", "name or service not known", "server returned", "http error",
        "input/output error", "no route to host",
    ];
    const UNSUPPORTED: [&str; 6] = [
        "invalid data found when processing input", "unknown format", "not supported",
        "no decoder", "could not find codec", "no video stream",
    ];

    if ABORTED.iter().any(|p| text.contains(p)) {
        MediaErrorKind::Aborted
    } else if NETWORK.iter().any(|p| text.contains(p)) {
        MediaErrorKind::Network
    } else if UNSUPPORTED.iter().any(|p| text.contains(p)) {
        MediaErrorKind::UnsupportedFormat
    } else {
        MediaErrorKind::Decode
    }
}

/// Last non-empty line of tool output, which is usually the actual error
fn error_detail(stderr: &str) -> String {
    stderr.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("unknown error")
        .to_string()
}

/// Run a short-lived tool to completion. Returns `None` if `cancel` was
/// raised first; the child is killed and its output discarded.
fn run_cancellable(command: &mut Command, cancel: &AtomicBool) -> std::io::Result<Option<Output>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_reader = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            bytes
        })
    });
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            bytes
        })
    });

    let status = loop {
        if cancel.load(Ordering::SeqCst) {
            let _ = child.kill();
            let _ = child.wait();
            // Readers finish on their own once the pipes close.
            return Ok(None);
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(Duration::from_millis(10)),
        }
    };

    let stdout = stdout_reader.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr_reader.and_then(|h| h.join().ok()).unwrap_or_default();
    Ok(Some(Output { status, stdout, stderr }))
}

#[derive(Debug, Clone, PartialEq)]
struct ProbeInfo {
    codec: String,
    duration: Option<f64>,
}

fn parse_probe_output(stdout: &str) -> Option<ProbeInfo> {
    let mut codec = None;
    let mut duration = None;

    for line in stdout.lines() {
        match line.trim().split_once('=') {
            Some(("codec_name", value)) if !value.is_empty() => codec = Some(value.to_string()),
            Some(("duration", value)) => duration = value.parse::<f64>().ok(),
            _ => {}
        }
    }

    codec.map(|codec| ProbeInfo { codec, duration })
}

fn probe_source(
    settings: &MediaSettings,
    url: &str,
    cancel: &AtomicBool,
) -> Result<ProbeInfo, (MediaErrorKind, String)> {
    let mut command = Command::new(&settings.ffprobe);
    command.args([
        "-v", "error",
        "-select_streams", "v:0",
        "-show_entries", "stream=codec_name:format=duration",
        "-of", "default=noprint_wrappers=1",
        url,
    ]);
    let output = run_cancellable(&mut command, cancel)
        .map_err(|e| (MediaErrorKind::Decode, format!("Failed to run ffprobe: {}", e)))?
        .ok_or_else(|| (MediaErrorKind::Aborted, "cancelled".to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err((classify_ffmpeg_error(&stderr), error_detail(&stderr)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout)
        .ok_or_else(|| (MediaErrorKind::UnsupportedFormat, "no video stream".to_string()))
}

fn extract_frame(
    settings: &MediaSettings,
    url: &str,
    timestamp: f64,
    cancel: &AtomicBool,
) -> Result<VideoFrame, String> {
    let mut command = Command::new(&settings.ffmpeg);
    command
        .args(["-nostdin", "-loglevel", "error"])
        .args(["-ss", &format!("{:.3}", timestamp)])
        .args(["-i", url])
        .args(["-frames:v", "1", "-vf", &settings.scale_filter()])
        .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"]);
    let output = run_cancellable(&mut command, cancel)
        .map_err(|e| format!("FFmpeg execution failed: {}", e))?
        .ok_or_else(|| "cancelled".to_string())?;

    if !output.status.success() {
        return Err(error_detail(&String::from_utf8_lossy(&output.stderr)));
    }
    if output.stdout.len() != settings.frame_size() {
        return Err(format!("Unexpected frame size: {} (expected {})", output.stdout.len(), settings.frame_size()));
    }

    Ok(VideoFrame {
        image_data: output.stdout,
        width: settings.frame_width,
        height: settings.frame_height,
        timestamp,
    })
}

fn spawn_video_decoder(settings: &MediaSettings, url: &str, start: f64) -> std::io::Result<Child> {
    Command::new(&settings.ffmpeg)
        .args(["-nostdin", "-loglevel", "error"])
        .args(["-ss", &format!("{:.3}", start)])
        .args(["-i", url])
        .args(["-map", "0:v:0", "-an", "-vf", &settings.scale_filter()])
        .args(["-r", &format!("{}", OUTPUT_FRAME_RATE)])
        .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn spawn_audio_decoder(settings: &MediaSettings, url: &str, start: f64) -> std::io::Result<Child> {
    Command::new(&settings.ffmpeg)
        .args(["-nostdin", "-loglevel", "quiet"])
        .args(["-ss", &format!("{:.3}", start)])
        .args(["-i", url])
        .args(["-vn", "-f", "f32le"])
        .args(["-ac", &AUDIO_CHANNELS.to_string(), "-ar", &AUDIO_SAMPLE_RATE.to_string()])
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
}

fn video_reader_thread(
    mut stdout: ChildStdout,
    frames: Arc<Mutex<VecDeque<VideoFrame>>>,
    stop_flag: Arc<AtomicBool>,
    eof: Arc<AtomicBool>,
    start_position: f64,
    width: u32,
    height: u32,
) {
    let frame_size = (width * height * 4) as usize;
    let mut frame_index = 0u64;

    log::debug!("Video reader started at {:.2}s", start_position);

    'read: while !stop_flag.load(Ordering::Relaxed) {
        // Hold the decoder back through the pipe while the buffer is full.
        loop {
            if stop_flag.load(Ordering::Relaxed) {
                break 'read;
            }
            let len = frames.lock().map(|f| f.len()).unwrap_or(0);
            if len < MAX_BUFFERED_FRAMES {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let mut buffer = vec![0u8; frame_size];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = VideoFrame {
                    image_data: buffer,
                    width,
                    height,
                    timestamp: start_position + frame_index as f64 / OUTPUT_FRAME_RATE,
                };
                if let Ok(mut frames) = frames.lock() {
                    frames.push_back(frame);
                }
                frame_index += 1;
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    log::debug!("Video reader error: {}", e);
                }
                break;
            }
        }
    }

    eof.store(true, Ordering::SeqCst);
    log::debug!("Video reader stopped (read {} frames)", frame_index);
}

/// Running decoder processes and their reader threads
struct Pipeline {
    video: Child,
    audio: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    frames: Arc<Mutex<VecDeque<VideoFrame>>>,
    eof: Arc<AtomicBool>,
    stderr_text: Arc<Mutex<String>>,
    sink: Option<Sink>,
}

impl Pipeline {
    fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }

        let _ = self.video.kill();
        let _ = self.video.wait();
        if let Some(mut audio) = self.audio.take() {
            let _ = audio.kill();
            let _ = audio.wait();
        }

        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
        log::debug!("Decoder pipeline stopped");
    }

    fn stderr_text(&self) -> String {
        self.stderr_text.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

/// Starvation bookkeeping for one decoder run
#[derive(Debug, Default)]
struct StarvationTracker {
    starving_since: Option<Instant>,
    waiting_reported: bool,
    stall_reported: bool,
    announced_playing: bool,
}

/// Outcome of one pacing step
#[derive(Debug, Default, PartialEq)]
struct PaceStep {
    events: Vec<MediaEvent>,
    /// Nothing to show; the clock must hold still
    starving: bool,
    end_of_stream: bool,
}

impl StarvationTracker {
    fn step(&mut self, released_frame: bool, buffer_empty: bool, eof: bool, now: Instant) -> PaceStep {
        let mut step = PaceStep::default();

        if released_frame {
            if !self.announced_playing || self.starving_since.is_some() {
                step.events.push(MediaEvent::Playing);
            }
            self.announced_playing = true;
            self.starving_since = None;
            self.waiting_reported = false;
            self.stall_reported = false;
        }

        if buffer_empty && eof {
            step.end_of_stream = true;
            return step;
        }

        if buffer_empty && !released_frame {
            step.starving = true;
            let since = *self.starving_since.get_or_insert(now);
            let starving = now.duration_since(since);
            if starving >= WAITING_AFTER && !self.waiting_reported {
                self.waiting_reported = true;
                step.events.push(MediaEvent::Waiting);
            }
            if starving >= STALLED_AFTER && !self.stall_reported {
                self.stall_reported = true;
                step.events.push(MediaEvent::Stalled);
            }
        }

        step
    }
}

/// Event for a decoder that has delivered its last frame
fn end_of_stream_event(exit_success: bool, stderr: &str) -> MediaEvent {
    if !exit_success && !stderr.trim().is_empty() {
        MediaEvent::Error {
            kind: classify_ffmpeg_error(stderr),
            detail: error_detail(stderr),
        }
    } else {
        MediaEvent::Ended
    }
}

struct PlayerState {
    source: Option<String>,
    duration: Option<f64>,
    position: f64,
    loaded: bool,
    is_playing: bool,
    pipeline: Option<Pipeline>,
    audio_buffer: Arc<Mutex<AudioBuffer>>,

    // Clock runs only while frames are available
    clock_start: Option<Instant>,
    clock_origin: f64,

    starvation: StarvationTracker,
    last_progress: Instant,
}

impl PlayerState {
    fn new() -> Self {
        Self {
            source: None,
            duration: None,
            position: 0.0,
            loaded: false,
            is_playing: false,
            pipeline: None,
            audio_buffer: Arc::new(Mutex::new(AudioBuffer::new(
                AUDIO_SAMPLE_RATE as usize * AUDIO_CHANNELS as usize * 2,
            ))),
            clock_start: None,
            clock_origin: 0.0,
            starvation: StarvationTracker::default(),
            last_progress: Instant::now(),
        }
    }

    fn clock(&self) -> f64 {
        match self.clock_start {
            Some(start) => {
                let position = self.clock_origin + start.elapsed().as_secs_f64();
                match self.duration {
                    Some(duration) => position.min(duration),
                    None => position,
                }
            }
            None => self.position,
        }
    }

    fn resume_clock(&mut self, now: Instant) {
        if self.clock_start.is_none() {
            self.clock_origin = self.position;
            self.clock_start = Some(now);
        }
    }

    fn freeze_clock(&mut self, current: f64) {
        if self.clock_start.take().is_some() {
            self.position = current;
        }
    }

    fn stop_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
        self.is_playing = false;
        self.clock_start = None;
        if let Ok(mut buffer) = self.audio_buffer.lock() {
            buffer.clear();
        }
    }

    fn start_pipeline(
        &mut self,
        settings: &MediaSettings,
        stream_handle: Option<&OutputStreamHandle>,
    ) -> Result<(), String> {
        let url = self.source.clone().ok_or_else(|| "no source".to_string())?;
        let start = self.position;

        let mut video = spawn_video_decoder(settings, &url, start)
            .map_err(|e| format!("Failed to spawn FFmpeg: {}", e))?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        let eof = Arc::new(AtomicBool::new(false));
        let stderr_text = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();

        if let Some(stdout) = video.stdout.take() {
            let frames = frames.clone();
            let stop_flag = stop_flag.clone();
            let eof = eof.clone();
            let (width, height) = (settings.frame_width, settings.frame_height);
            readers.push(thread::spawn(move || {
                video_reader_thread(stdout, frames, stop_flag, eof, start, width, height);
            }));
        }

        if let Some(mut stderr) = video.stderr.take() {
            let stderr_text = stderr_text.clone();
            readers.push(thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                if let Ok(mut shared) = stderr_text.lock() {
                    *shared = text;
                }
            }));
        }

        if let Ok(mut buffer) = self.audio_buffer.lock() {
            buffer.clear();
        }

        let audio = match spawn_audio_decoder(settings, &url, start) {
            Ok(mut child) => {
                if let Some(stdout) = child.stdout.take() {
                    let buffer = self.audio_buffer.clone();
                    let stop_flag = stop_flag.clone();
                    readers.push(thread::spawn(move || {
                        audio_reader_thread(stdout, buffer, stop_flag);
                    }));
                }
                Some(child)
            }
            Err(e) => {
                log::warn!("Failed to start audio decoder, playing without sound: {}", e);
                None
            }
        };

        let sink = stream_handle
            .and_then(|handle| Sink::try_new(handle).ok())
            .map(|sink| {
                sink.append(StreamingAudioSource {
                    buffer: self.audio_buffer.clone(),
                    stop_flag: stop_flag.clone(),
                });
                sink.play();
                sink
            });

        self.pipeline = Some(Pipeline {
            video,
            audio,
            readers,
            stop_flag,
            frames,
            eof,
            stderr_text,
            sink,
        });

        self.is_playing = true;
        self.clock_start = None;
        self.clock_origin = start;
        self.starvation = StarvationTracker::default();
        self.last_progress = Instant::now();
        Ok(())
    }
}

fn playback_thread(
    settings: MediaSettings,
    cancel: Arc<AtomicBool>,
    cmd_rx: mpsc::Receiver<PlayerCommand>,
    status_tx: mpsc::Sender<PlayerStatus>,
    frame_tx: mpsc::Sender<VideoFrame>,
) {
    let mut state = PlayerState::new();
    let emit = |event: MediaEvent| {
        let _ = status_tx.send(PlayerStatus::Event(event));
    };

    // The output stream must stay on this thread and alive while playing.
    let (_audio_stream, stream_handle): (Option<OutputStream>, Option<OutputStreamHandle>) =
        match OutputStream::try_default() {
            Ok((stream, handle)) => (Some(stream), Some(handle)),
            Err(e) => {
                log::warn!("Failed to create audio output: {}. Video will play without audio.", e);
                (None, None)
            }
        };

    loop {
        let timeout = if state.is_playing {
            Duration::from_millis(8)
        } else {
            Duration::from_millis(50)
        };

        match cmd_rx.recv_timeout(timeout) {
            Ok(PlayerCommand::SetSource(url)) => {
                state.stop_pipeline();
                log::debug!("Source set to {}", url);
                state.source = Some(url);
                state.loaded = false;
                state.duration = None;
                state.position = 0.0;
            }

            Ok(PlayerCommand::Load) => {
                state.stop_pipeline();
                state.loaded = false;
                state.position = 0.0;

                let Some(url) = state.source.clone() else {
                    emit(MediaEvent::Error { kind: MediaErrorKind::Aborted, detail: "no source".into() });
                    continue;
                };

                match probe_source(&settings, &url, &cancel) {
                    Ok(info) => {
                        log::info!("Loaded {} ({}, {:?}s)", url, info.codec, info.duration);
                        state.duration = info.duration;
                        state.loaded = true;

                        match extract_frame(&settings, &url, 0.0, &cancel) {
                            Ok(frame) => {
                                let _ = frame_tx.send(frame);
                            }
                            Err(e) => log::debug!("No poster frame for {}: {}", url, e),
                        }
                        emit(MediaEvent::LoadedData);
                        emit(MediaEvent::CanPlay);
                    }
                    Err((kind, detail)) => {
                        emit(MediaEvent::Error { kind, detail });
                    }
                }
            }

            Ok(PlayerCommand::Play) => {
                if !state.loaded || state.is_playing {
                    log::debug!("Ignoring play (loaded: {}, playing: {})", state.loaded, state.is_playing);
                    continue;
                }

                log::info!("Starting playback from {:.2}s", state.position);
                if let Err(e) = state.start_pipeline(&settings, stream_handle.as_ref()) {
                    log::error!("Failed to start FFmpeg: {}", e);
                    emit(MediaEvent::Error { kind: MediaErrorKind::Decode, detail: e });
                }
            }

            Ok(PlayerCommand::Pause) => {
                if !state.is_playing {
                    continue;
                }
                state.position = state.clock();
                log::info!("Pausing playback at {:.2}s", state.position);
                state.stop_pipeline();
                let _ = status_tx.send(PlayerStatus::Position(state.position));
                emit(MediaEvent::Paused);
            }

            Ok(PlayerCommand::Seek(timestamp)) => {
                if !state.loaded {
                    continue;
                }
                let clamped = match state.duration {
                    Some(duration) => timestamp.clamp(0.0, duration),
                    None => timestamp.max(0.0),
                };
                log::debug!("Seeking to {:.2}s", clamped);

                let was_playing = state.is_playing;
                state.stop_pipeline();
                state.position = clamped;

                if let Some(ref url) = state.source {
                    if let Ok(frame) = extract_frame(&settings, url, clamped, &cancel) {
                        let _ = frame_tx.send(frame);
                    }
                }
                let _ = status_tx.send(PlayerStatus::Position(clamped));

                if was_playing {
                    if let Err(e) = state.start_pipeline(&settings, stream_handle.as_ref()) {
                        log::error!("Failed to restart FFmpeg after seek: {}", e);
                        emit(MediaEvent::Error { kind: MediaErrorKind::Decode, detail: e });
                    }
                }
            }

            Ok(PlayerCommand::Shutdown) => {
                log::debug!("Playback thread shutting down");
                break;
            }

            Err(mpsc::RecvTimeoutError::Timeout) => {
                if state.is_playing {
                    pace_playback(&mut state, &status_tx, &frame_tx);
                }
            }

            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::debug!("Command channel disconnected, shutting down");
                break;
            }
        }
    }

    state.stop_pipeline();
    log::debug!("Playback thread exited");
}

/// One pacing step while playing: release due frames, track starvation,
/// detect the end of the stream, report position and buffer.
fn pace_playback(
    state: &mut PlayerState,
    status_tx: &mpsc::Sender<PlayerStatus>,
    frame_tx: &mpsc::Sender<VideoFrame>,
) {
    let now = Instant::now();
    let emit = |event: MediaEvent| {
        let _ = status_tx.send(PlayerStatus::Event(event));
    };

    let Some(pipeline) = state.pipeline.as_ref() else {
        return;
    };
    let frames = pipeline.frames.clone();
    let eof = pipeline.eof.load(Ordering::SeqCst);

    let (has_frames, newest_pts) = match frames.lock() {
        Ok(f) => (!f.is_empty(), f.back().map(|frame| frame.timestamp)),
        Err(_) => return,
    };

    if has_frames {
        state.resume_clock(now);
    }

    let current = state.clock();
    state.position = current;

    // Release the newest frame that is due, dropping older ones.
    let mut due = None;
    if let Ok(mut f) = frames.lock() {
        while f.front().map_or(false, |frame| frame.timestamp <= current) {
            due = f.pop_front();
        }
    }

    let released = due.is_some();
    if let Some(frame) = due {
        let _ = frame_tx.send(frame);
    }

    let buffer_empty = frames.lock().map(|f| f.is_empty()).unwrap_or(true);
    let step = state.starvation.step(released, buffer_empty, eof, now);
    for event in step.events {
        emit(event);
    }

    if step.end_of_stream {
        let Some(pipeline) = state.pipeline.as_mut() else {
            return;
        };
        match pipeline.video.try_wait() {
            Ok(Some(status)) => {
                let event = end_of_stream_event(status.success(), &pipeline.stderr_text());
                state.stop_pipeline();

                if let MediaEvent::Error { ref detail, .. } = event {
                    log::warn!("Decoder failed: {}", detail);
                } else {
                    state.position = state.duration.unwrap_or(current);
                    let _ = status_tx.send(PlayerStatus::Position(state.position));
                }
                emit(event);
            }
            Ok(None) => {}
            Err(e) => log::debug!("Failed to query decoder status: {}", e),
        }
        return;
    }

    if step.starving {
        state.freeze_clock(current);
    }

    if now.duration_since(state.last_progress) >= PROGRESS_INTERVAL {
        state.last_progress = now;
        let ahead = newest_pts.map_or(0.0, |pts| (pts - current).max(0.0));
        let _ = status_tx.send(PlayerStatus::Buffered(ahead));
        emit(MediaEvent::Progress);
    }

    let _ = status_tx.send(PlayerStatus::Position(current));
}

/// ffmpeg-backed [`MediaElement`]. Owns its playback thread.
pub struct FfmpegMedia {
    command_sender: mpsc::Sender<PlayerCommand>,
    status_receiver: mpsc::Receiver<PlayerStatus>,
    frame_receiver: mpsc::Receiver<VideoFrame>,
    thread_handle: Option<JoinHandle<()>>,
    /// Kills in-flight ffprobe/ffmpeg calls on drop
    cancel: Arc<AtomicBool>,

    source: Option<String>,
    position: f64,
    buffered_ahead: f64,
    is_paused: bool,
    texture_handle: Option<TextureHandle>,
}

impl FfmpegMedia {
    pub fn new(settings: MediaSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (status_tx, status_rx) = mpsc::channel();
        let (frame_tx, frame_rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let thread_cancel = cancel.clone();
        let thread_handle = thread::spawn(move || {
            playback_thread(settings, thread_cancel, cmd_rx, status_tx, frame_tx);
        });

        Self {
            command_sender: cmd_tx,
            status_receiver: status_rx,
            frame_receiver: frame_rx,
            thread_handle: Some(thread_handle),
            cancel,
            source: None,
            position: 0.0,
            buffered_ahead: 0.0,
            is_paused: true,
            texture_handle: None,
        }
    }

    fn send(&self, command: PlayerCommand) -> Result<(), MediaError> {
        self.command_sender.send(command).map_err(|_| MediaError::Disconnected)
    }

    /// Latest decoded frame as a texture (call from the GUI loop)
    pub fn frame_texture(&mut self, ctx: &Context) -> Option<TextureHandle> {
        let mut latest_frame: Option<VideoFrame> = None;
        while let Ok(frame) = self.frame_receiver.try_recv() {
            latest_frame = Some(frame);
        }

        if let Some(frame) = latest_frame {
            if frame.image_data.len() == (frame.width * frame.height * 4) as usize {
                let color_image = egui::ColorImage::from_rgba_unmultiplied(
                    [frame.width as usize, frame.height as usize],
                    &frame.image_data,
                );
                self.texture_handle = Some(ctx.load_texture(
                    "video_frame",
                    color_image,
                    egui::TextureOptions::LINEAR,
                ));
            }
        }

        self.texture_handle.clone()
    }
}

impl MediaElement for FfmpegMedia {
    fn set_source(&mut self, url: &str) {
        self.source = Some(url.to_string());
        self.position = 0.0;
        self.buffered_ahead = 0.0;
        self.is_paused = true;
        if let Err(e) = self.send(PlayerCommand::SetSource(url.to_string())) {
            log::error!("Failed to set source: {}", e);
        }
    }

    fn load(&mut self) -> Result<(), MediaError> {
        if self.source.is_none() {
            return Err(MediaError::NoSource);
        }
        self.send(PlayerCommand::Load)
    }

    fn play(&mut self) -> Result<(), MediaError> {
        if self.source.is_none() {
            return Err(MediaError::NoSource);
        }
        self.send(PlayerCommand::Play)?;
        self.is_paused = false;
        Ok(())
    }

    fn pause(&mut self) {
        self.is_paused = true;
        if let Err(e) = self.send(PlayerCommand::Pause) {
            log::warn!("Failed to pause: {}", e);
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<(), MediaError> {
        self.send(PlayerCommand::Seek(seconds))?;
        self.position = seconds;
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.position
    }

    fn buffered_ahead(&self) -> f64 {
        self.buffered_ahead
    }

    fn is_paused(&self) -> bool {
        self.is_paused
    }

    fn drain_events(&mut self) -> Vec<MediaEvent> {
        let mut events = Vec::new();
        while let Ok(status) = self.status_receiver.try_recv() {
            match status {
                PlayerStatus::Position(position) => self.position = position,
                PlayerStatus::Buffered(ahead) => self.buffered_ahead = ahead,
                PlayerStatus::Event(event) => {
                    if matches!(event, MediaEvent::Ended | MediaEvent::Error { .. }) {
                        self.is_paused = true;
                    }
                    events.push(event);
                }
            }
        }
        events
    }
}

impl Drop for FfmpegMedia {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.command_sender.send(PlayerCommand::Shutdown);

        // Joined off the GUI thread; the player stops its own children.
        if let Some(handle) = self.thread_handle.take() {
            let reaper = thread::Builder::new()
                .name("playback-reaper".to_string())
                .spawn(move || {
                    if handle.join().is_err() {
                        log::warn!("Playback thread panicked");
                    }
                });
            if let Err(e) = reaper {
                log::debug!("Detaching playback thread: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ffmpeg_errors() {
        assert_eq!(
            classify_ffmpeg_error("[tcp @ 0x55] Connection to tcp://cdn:443 failed: Connection refused"),
            MediaErrorKind::Network
        );
        assert_eq!(
            classify_ffmpeg_error("https://cdn/x.mp4: Server returned 403 Forbidden (access denied)"),
            MediaErrorKind::Network
        );
        assert_eq!(
            classify_ffmpeg_error("https://cdn/x.mkv: Invalid data found when processing input"),
            MediaErrorKind::UnsupportedFormat
        );
        assert_eq!(
            classify_ffmpeg_error("Exiting normally, received signal 15."),
            MediaErrorKind::Aborted
        );
        assert_eq!(
            classify_ffmpeg_error("[h264 @ 0x7f] error while decoding MB 12 7, bytestream -5"),
            MediaErrorKind::Decode
        );
    }

    #[test]
    fn test_error_detail_uses_last_line() {
        let stderr = "[https @ 0x1] Opening...\n\nhttps://cdn/x.mp4: Server returned 404 Not Found\n";
        assert_eq!(error_detail(stderr), "https://cdn/x.mp4: Server returned 404 Not Found");
        assert_eq!(error_detail("  \n"), "unknown error");
    }

    #[test]
    fn test_parse_probe_output() {
        let info = parse_probe_output("codec_name=h264\nduration=12.480000\n").unwrap();
        assert_eq!(info.codec, "h264");
        assert_eq!(info.duration, Some(12.48));

        let live = parse_probe_output("codec_name=vp9\nduration=N/A\n").unwrap();
        assert_eq!(live.duration, None);

        assert!(parse_probe_output("duration=3.0\n").is_none());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = PlaybackConfig::default();
        config.ffmpeg_path = Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        config.frame_width = 360;
        config.frame_height = 640;

        let settings = MediaSettings::from_config(&config);
        assert_eq!(settings.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(settings.ffprobe, PathBuf::from("ffprobe"));
        assert_eq!(settings.frame_size(), 360 * 640 * 4);
        assert_eq!(
            settings.scale_filter(),
            "scale=360:640:force_original_aspect_ratio=decrease,pad=360:640:(ow-iw)/2:(oh-ih)/2:color=black"
        );
    }

    #[test]
    fn test_clock_is_frozen_without_start() {
        let mut state = PlayerState::new();
        state.position = 4.0;
        assert_eq!(state.clock(), 4.0);

        state.duration = Some(5.0);
        state.clock_origin = 4.9;
        state.clock_start = Some(Instant::now() - Duration::from_secs(1));
        assert_eq!(state.clock(), 5.0);
    }

    #[test]
    fn test_commands_require_source() {
        let mut media = FfmpegMedia::new(MediaSettings::default());
        assert!(matches!(media.load(), Err(MediaError::NoSource)));
        assert!(matches!(media.play(), Err(MediaError::NoSource)));
        assert!(media.is_paused());
        assert!(media.drain_events().is_empty());
    }

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn test_first_frame_announces_playing_once() {
        let mut tracker = StarvationTracker::default();
        let t0 = Instant::now();

        let first = tracker.step(true, false, false, t0);
        assert_eq!(first.events, vec![MediaEvent::Playing]);
        assert!(!first.starving);

        let second = tracker.step(true, false, false, at(t0, 33));
        assert!(second.events.is_empty());
    }

    #[test]
    fn test_starvation_reports_waiting_then_stalled_once() {
        let mut tracker = StarvationTracker::default();
        let t0 = Instant::now();
        tracker.step(true, false, false, t0);

        let start = tracker.step(false, true, false, at(t0, 10));
        assert!(start.starving);
        assert!(start.events.is_empty());

        assert!(tracker.step(false, true, false, at(t0, 100)).events.is_empty());
        assert_eq!(tracker.step(false, true, false, at(t0, 160)).events, vec![MediaEvent::Waiting]);
        assert!(tracker.step(false, true, false, at(t0, 1000)).events.is_empty());
        assert_eq!(tracker.step(false, true, false, at(t0, 2010)).events, vec![MediaEvent::Stalled]);

        let later = tracker.step(false, true, false, at(t0, 5000));
        assert!(later.starving);
        assert!(later.events.is_empty());
    }

    #[test]
    fn test_resumed_frame_emits_playing_and_starts_new_episode() {
        let mut tracker = StarvationTracker::default();
        let t0 = Instant::now();
        tracker.step(true, false, false, t0);
        tracker.step(false, true, false, at(t0, 10));
        tracker.step(false, true, false, at(t0, 200));

        let resumed = tracker.step(true, false, false, at(t0, 300));
        assert_eq!(resumed.events, vec![MediaEvent::Playing]);
        assert!(!resumed.starving);

        // A new starvation waits the full delay again.
        tracker.step(false, true, false, at(t0, 400));
        assert!(tracker.step(false, true, false, at(t0, 500)).events.is_empty());
        assert_eq!(tracker.step(false, true, false, at(t0, 560)).events, vec![MediaEvent::Waiting]);
    }

    #[test]
    fn test_frame_released_from_emptied_buffer_is_not_starvation() {
        let mut tracker = StarvationTracker::default();
        let t0 = Instant::now();

        let step = tracker.step(true, true, false, t0);
        assert!(!step.starving);
        assert!(!step.end_of_stream);
    }

    #[test]
    fn test_drained_buffer_at_eof_ends_stream() {
        let mut tracker = StarvationTracker::default();
        let t0 = Instant::now();
        tracker.step(true, false, false, t0);

        let step = tracker.step(false, true, true, at(t0, 3000));
        assert!(step.end_of_stream);
        assert!(!step.starving);
        assert!(step.events.is_empty());

        // Frames still queued: not the end yet.
        assert!(!tracker.step(true, false, true, at(t0, 3010)).end_of_stream);
    }

    #[test]
    fn test_end_of_stream_event() {
        assert_eq!(end_of_stream_event(true, ""), MediaEvent::Ended);
        // Killed decoders exit non-zero without an error message.
        assert_eq!(end_of_stream_event(false, "  \n"), MediaEvent::Ended);
        assert_eq!(
            end_of_stream_event(false, "https://cdn/x.mp4: Server returned 404 Not Found\n"),
            MediaEvent::Error {
                kind: MediaErrorKind::Network,
                detail: "https://cdn/x.mp4: Server returned 404 Not Found".to_string(),
            }
        );
    }

    #[test]
    fn test_clock_freezes_while_starving_and_resumes_from_position() {
        let mut state = PlayerState::new();
        state.position = 2.0;
        let now = Instant::now();

        state.resume_clock(now - Duration::from_millis(500));
        let running = state.clock();
        assert!(running >= 2.5);

        state.freeze_clock(running);
        assert_eq!(state.clock(), running);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(state.clock(), running);

        state.resume_clock(Instant::now());
        assert!(state.clock() >= running);
        assert_eq!(state.clock_origin, running);
    }

    #[cfg(unix)]
    #[test]
    fn test_cancelled_tool_is_killed() {
        let cancel = AtomicBool::new(true);
        let started = Instant::now();

        let output = run_cancellable(Command::new("sleep").arg("3"), &cancel).unwrap();
        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_output_is_collected() {
        let cancel = AtomicBool::new(false);
        let output = run_cancellable(
            Command::new("sh").args(["-c", "printf frame; printf oops >&2; exit 3"]),
            &cancel,
        )
        .unwrap()
        .unwrap();

        assert_eq!(output.stdout, b"frame");
        assert_eq!(output.stderr, b"oops");
        assert_eq!(output.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_drop_returns_while_probe_is_running() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("swipe-feed-slow-probe-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("ffprobe");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = MediaSettings { ffprobe: script, ..MediaSettings::default() };
        let mut media = FfmpegMedia::new(settings);
        media.set_source("https://cdn.example.com/slow.mp4");
        media.load().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        drop(media);
        assert!(started.elapsed() < Duration::from_millis(50));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
