mod capture;
mod framer;
mod playback;
mod vad;

pub use capture::CaptureService;
pub use framer::AudioFramer;
pub use playback::{PlaybackPoll, PlaybackScheduler};
pub use vad::{EnergyVad, VadConfig};

/// Samples per captured frame (device rate, pre-decimation)
pub const FRAME_SIZE: usize = 1024;
/// Wire sample rate for outbound speech
pub const WIRE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of inbound synthesized speech
pub const PLAYBACK_SAMPLE_RATE: u32 = 22_050;
/// Channels (mono for voice)
pub const CHANNELS: u16 = 1;
/// Opus bitrate (64kbps good for voice)
pub const OPUS_BITRATE: i32 = 64000;

/// One wire-ready frame of captured speech: PCM16 mono at the wire rate.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub sequence: u64,
}

impl AudioFrame {
    /// Little-endian PCM16 bytes, the network payload format.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}

/// Per-frame capture event: the frame plus the VAD verdict at emission time.
#[derive(Clone, Debug)]
pub struct FrameEvent {
    pub frame: AudioFrame,
    pub voice_active: bool,
    /// Rolling RMS energy the VAD decided on
    pub energy: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_le_encoding() {
        let frame = AudioFrame {
            samples: vec![0, 1, -1, i16::MAX, i16::MIN],
            sample_rate: WIRE_SAMPLE_RATE,
            sequence: 0,
        };
        let bytes = frame.to_le_bytes();
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[0..2], &[0x00, 0x00]);
        assert_eq!(&bytes[2..4], &[0x01, 0x00]);
        assert_eq!(&bytes[4..6], &[0xff, 0xff]);
        assert_eq!(&bytes[6..8], &[0xff, 0x7f]);
        assert_eq!(&bytes[8..10], &[0x00, 0x80]);
    }
}
