//! Lossless audio codec for CD audio blocks.
//!
//! CD audio sectors are 2352 bytes of interleaved 16-bit little-endian
//! stereo PCM at 44.1 kHz (588 samples per channel per sector). The sink
//! owns its sample buffer and hands back the finished FLAC stream on
//! [`AudioSink::finalize`]; there is no close-then-reopen dance against a
//! seekable file.

use flacenc::bitsink::ByteSink;
use flacenc::component::BitRepr;
use flacenc::error::Verify;

use super::CodecError;

const CHANNELS: usize = 2;
const BITS_PER_SAMPLE: usize = 16;
const SAMPLE_RATE: usize = 44_100;

/// Accumulates raw CD audio sector bytes and encodes them as one FLAC
/// stream when the containing block closes.
#[derive(Debug, Default)]
pub struct AudioSink {
    samples: Vec<i32>,
}

impl AudioSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append one or more raw audio sectors. `pcm` must be a multiple of
    /// 4 bytes (one stereo 16-bit sample pair).
    pub fn feed(&mut self, pcm: &[u8]) -> Result<(), CodecError> {
        if pcm.len() % 4 != 0 {
            return Err(CodecError::Compression(format!(
                "audio payload of {} bytes is not sample-aligned",
                pcm.len()
            )));
        }
        self.samples.reserve(pcm.len() / 2);
        for pair in pcm.chunks_exact(2) {
            self.samples
                .push(i32::from(i16::from_le_bytes([pair[0], pair[1]])));
        }
        Ok(())
    }

    /// Encode everything fed so far and return ownership of the finished
    /// FLAC bytes.
    pub fn finalize(self) -> Result<Vec<u8>, CodecError> {
        let config = flacenc::config::Encoder::default()
            .into_verified()
            .map_err(|_| CodecError::Compression("invalid flac encoder config".into()))?;
        let source = flacenc::source::MemSource::from_samples(
            &self.samples,
            CHANNELS,
            BITS_PER_SAMPLE,
            SAMPLE_RATE,
        );
        let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
            .map_err(|e| CodecError::Compression(format!("flac encode failed: {e:?}")))?;
        let mut sink = ByteSink::new();
        stream
            .write(&mut sink)
            .map_err(|_| CodecError::Compression("flac stream serialization failed".into()))?;
        Ok(sink.as_slice().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_payload() {
        let mut sink = AudioSink::new();
        assert!(sink.feed(&[0u8; 7]).is_err());
    }

    #[test]
    fn silence_compresses_well() {
        let mut sink = AudioSink::new();
        sink.feed(&vec![0u8; 2352 * 16]).unwrap();
        let flac = sink.finalize().unwrap();
        assert!(!flac.is_empty());
        assert!(flac.len() < 2352 * 16);
        // FLAC stream marker.
        assert_eq!(&flac[..4], b"fLaC");
    }
}
