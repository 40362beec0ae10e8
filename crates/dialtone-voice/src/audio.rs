//! Audio chunks exchanged with the telephony leg.
//!
//! The phone network side speaks 8 kHz mono G.711 mu-law, one byte per sample, so
//! byte counts map directly to playback time.

use std::time::Duration;

/// Bytes in one 20ms telephony frame (8000 samples/s * 0.02s).
pub const TELEPHONY_FRAME_BYTES: usize = 160;

/// Encoding of raw audio bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// G.711 mu-law, 8 kHz, mono
    Mulaw8k,
}

impl AudioEncoding {
    /// Samples per second
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioEncoding::Mulaw8k => 8000,
        }
    }

    /// Name used in provider query strings (`encoding=mulaw`)
    pub fn wire_name(&self) -> &'static str {
        match self {
            AudioEncoding::Mulaw8k => "mulaw",
        }
    }

    /// Bytes per sample
    pub fn sample_width(&self) -> usize {
        match self {
            AudioEncoding::Mulaw8k => 1,
        }
    }

    /// Playback time of `len` bytes in this encoding
    pub fn duration_of(&self, len: usize) -> Duration {
        let samples = (len / self.sample_width()) as u64;
        Duration::from_micros(samples * 1_000_000 / self.sample_rate() as u64)
    }
}

impl Default for AudioEncoding {
    fn default() -> Self {
        AudioEncoding::Mulaw8k
    }
}

/// A chunk of raw audio. `sequence` is diagnostic only; streams are already ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub payload: Vec<u8>,
    pub encoding: AudioEncoding,
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            payload,
            encoding: AudioEncoding::Mulaw8k,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// How long this chunk takes to play at the far end
    pub fn duration(&self) -> Duration {
        self.encoding.duration_of(self.payload.len())
    }
}

/// Split synthesized audio into frames of at most `frame_bytes`, numbering them from
/// `first_sequence`. The last frame may be short; nothing is padded or dropped.
pub fn split_frames(audio: &[u8], frame_bytes: usize, first_sequence: u64) -> Vec<AudioChunk> {
    let frame_bytes = frame_bytes.max(1);
    audio
        .chunks(frame_bytes)
        .enumerate()
        .map(|(i, frame)| AudioChunk::new(frame.to_vec(), first_sequence + i as u64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_frame_is_twenty_ms() {
        let chunk = AudioChunk::new(vec![0xFF; TELEPHONY_FRAME_BYTES], 0);
        assert_eq!(chunk.duration(), Duration::from_millis(20));
        assert_eq!(AudioEncoding::Mulaw8k.sample_rate(), 8000);
        assert_eq!(AudioEncoding::Mulaw8k.wire_name(), "mulaw");
    }

    #[test]
    fn split_keeps_every_byte_in_order() {
        let audio: Vec<u8> = (0..=255u8).cycle().take(500).collect();
        let frames = split_frames(&audio, 160, 7);

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].sequence, 7);
        assert_eq!(frames[3].sequence, 10);
        assert_eq!(frames[3].len(), 20);

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(joined, audio);
    }

    #[test]
    fn split_empty_audio_yields_nothing() {
        assert!(split_frames(&[], 160, 0).is_empty());
    }
}
