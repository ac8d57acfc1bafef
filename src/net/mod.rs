mod jitter;
mod stats;

pub use jitter::{AdaptiveJitterBuffer, ChunkOutcome, JitterBufferConfig};
pub use stats::{NetworkQualityEstimator, NetworkStats};

use std::time::{Duration, Instant};

use crate::audio::PLAYBACK_SAMPLE_RATE;

/// One synthesized-audio chunk off the wire, PCM16 at the playback rate.
#[derive(Clone, Debug)]
pub struct InboundChunk {
    pub payload: Vec<u8>,
    pub arrival: Instant,
}

impl InboundChunk {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            arrival: Instant::now(),
        }
    }

    /// A zero-length payload marks the end of an utterance.
    pub fn is_completion_signal(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A contiguous run of chunks concatenated for playback.
#[derive(Clone, Debug)]
pub struct PlaybackUnit {
    pub pcm: Vec<u8>,
    pub chunk_count: usize,
}

impl PlaybackUnit {
    /// Estimated play time from the sample count at the playback rate.
    pub fn duration(&self) -> Duration {
        let samples = self.pcm.len() / 2;
        Duration::from_secs_f64(samples as f64 / PLAYBACK_SAMPLE_RATE as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_signal() {
        assert!(InboundChunk::new(vec![]).is_completion_signal());
        assert!(!InboundChunk::new(vec![0, 1]).is_completion_signal());
    }

    #[test]
    fn test_unit_duration() {
        // 22050 samples of PCM16 = one second
        let unit = PlaybackUnit {
            pcm: vec![0; 22_050 * 2],
            chunk_count: 3,
        };
        let ms = unit.duration().as_millis();
        assert!((999..=1001).contains(&ms));
    }
}
