use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rodio::Source;

pub const AUDIO_SAMPLE_RATE: u32 = 48000;
pub const AUDIO_CHANNELS: u16 = 2;

/// Fixed-capacity ring of interleaved f32 samples
pub struct AudioBuffer {
    samples: Vec<f32>,
    read_pos: usize,
    write_pos: usize,
    capacity: usize,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            read_pos: 0,
            write_pos: 0,
            capacity,
        }
    }

    /// Write as many samples as fit; returns how many were written.
    pub fn write(&mut self, data: &[f32]) -> usize {
        let mut written = 0;
        for &sample in data {
            let next_write = (self.write_pos + 1) % self.capacity;
            if next_write == self.read_pos {
                break;
            }
            self.samples[self.write_pos] = sample;
            self.write_pos = next_write;
            written += 1;
        }
        written
    }

    pub fn read(&mut self) -> Option<f32> {
        if self.read_pos == self.write_pos {
            return None;
        }
        let sample = self.samples[self.read_pos];
        self.read_pos = (self.read_pos + 1) % self.capacity;
        Some(sample)
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.capacity - self.read_pos + self.write_pos
        }
    }
}

/// rodio source that plays whatever the reader thread put in the buffer,
/// with silence on underrun.
pub struct StreamingAudioSource {
    pub buffer: Arc<Mutex<AudioBuffer>>,
    pub stop_flag: Arc<AtomicBool>,
}

impl Iterator for StreamingAudioSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop_flag.load(Ordering::Relaxed) {
            return None;
        }

        match self.buffer.lock() {
            Ok(mut buffer) => buffer.read().or(Some(0.0)),
            Err(_) => Some(0.0),
        }
    }
}

impl Source for StreamingAudioSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        AUDIO_CHANNELS
    }

    fn sample_rate(&self) -> u32 {
        AUDIO_SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Pump f32le samples from a decoder pipe into the ring buffer. Waits for
/// room instead of dropping samples so the decoder is held back by the pipe.
pub fn audio_reader_thread<R: Read>(
    mut pipe: R,
    audio_buffer: Arc<Mutex<AudioBuffer>>,
    stop_flag: Arc<AtomicBool>,
) {
    let mut byte_buffer = vec![0u8; 4096];
    let mut carry: Vec<u8> = Vec::with_capacity(8);
    let mut total_samples = 0u64;

    log::debug!("Audio reader started");

    'read: while !stop_flag.load(Ordering::Relaxed) {
        let bytes_read = match pipe.read(&mut byte_buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    log::debug!("Audio reader error: {}", e);
                }
                break;
            }
        };

        // Reads may split a sample; keep the tail for the next round.
        carry.extend_from_slice(&byte_buffer[..bytes_read]);
        let whole = carry.len() - carry.len() % 4;
        let samples: Vec<f32> = carry[..whole]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        carry.drain(..whole);

        let mut offset = 0;
        while offset < samples.len() {
            if stop_flag.load(Ordering::Relaxed) {
                break 'read;
            }
            let written = match audio_buffer.lock() {
                Ok(mut buffer) => buffer.write(&samples[offset..]),
                Err(_) => break 'read,
            };
            offset += written;
            if offset < samples.len() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        total_samples += samples.len() as u64;
    }

    log::debug!("Audio reader stopped (read {} samples)", total_samples);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_buffer() {
        let mut buffer = AudioBuffer::new(10);

        assert_eq!(buffer.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(buffer.available(), 3);

        assert_eq!(buffer.read(), Some(1.0));
        assert_eq!(buffer.read(), Some(2.0));
        assert_eq!(buffer.available(), 1);

        buffer.clear();
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.read(), None);
    }

    #[test]
    fn test_audio_buffer_full() {
        let mut buffer = AudioBuffer::new(4);
        // One slot stays free to tell full from empty.
        assert_eq!(buffer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3);
        assert_eq!(buffer.read(), Some(1.0));
        assert_eq!(buffer.write(&[6.0, 7.0]), 1);
        assert_eq!(buffer.available(), 3);
    }

    #[test]
    fn test_reader_decodes_f32le() {
        let samples = [0.5f32, -0.25, 1.0, 0.0];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let buffer = Arc::new(Mutex::new(AudioBuffer::new(64)));

        audio_reader_thread(std::io::Cursor::new(bytes), buffer.clone(), Arc::new(AtomicBool::new(false)));

        let mut buffer = buffer.lock().unwrap();
        assert_eq!(buffer.available(), 4);
        assert_eq!(buffer.read(), Some(0.5));
        assert_eq!(buffer.read(), Some(-0.25));
    }

    #[test]
    fn test_source_stops_on_flag() {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut source = StreamingAudioSource {
            buffer: Arc::new(Mutex::new(AudioBuffer::new(8))),
            stop_flag: stop_flag.clone(),
        };

        assert_eq!(source.next(), Some(0.0));
        stop_flag.store(true, Ordering::SeqCst);
        assert_eq!(source.next(), None);
    }
}
