//! Frame-at-a-time PCM decoding.
//!
//! [`FrameSource`] is the contract the decode worker drives. Containers are a
//! closed set dispatched through [`Decoder`]; each variant owns its parser and
//! cursor state.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use cadence_core::{Error, Result, TrackMetadata};
use tracing::{debug, trace};

use crate::format::{SampleFormat, StreamFormat};
use crate::io::DataSource;
use crate::wav::WavParser;

/// Result of one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// One full frame was written to the caller's buffer.
    Frame,
    /// The cursor has passed the end of the sample data.
    EndOfStream,
}

/// Source of fixed-size PCM frames with frame-addressable seeking.
pub trait FrameSource: Send {
    /// Decode the frame at the cursor into `frame` and advance.
    ///
    /// `frame` must be exactly `format().frame_size()` bytes long. A read that
    /// ends partway through a frame is an [`Error::Io`].
    fn decode_frame(&mut self, frame: &mut [u8]) -> Result<DecodeStatus>;

    /// Move the cursor to frame `floor(seconds * rate)`, clamped to the last frame.
    fn seek_to(&mut self, seconds: f64) -> Result<()>;

    /// Total number of decodable frames.
    fn num_frames(&self) -> u64;

    /// Device format of the decoded frames.
    fn format(&self) -> StreamFormat;

    fn metadata(&self) -> TrackMetadata;
}

/// WAV/PCM passthrough decoder.
pub struct WavDecoder {
    source: Box<dyn DataSource>,
    parser: WavParser,
    format: StreamFormat,
    /// Cursor relative to the start of sample data.
    position: u64,
}

impl WavDecoder {
    /// Parse the container and position the cursor at the first frame.
    pub fn new(mut source: Box<dyn DataSource>) -> Result<Self> {
        let parser = WavParser::parse(source.as_mut())?;
        let sample_format = SampleFormat::from_wav(parser.format(), parser.bit_depth())?;
        let format = StreamFormat::new(parser.channels(), sample_format, parser.sample_rate())?;

        source.seek(parser.sample_data_offset())?;
        debug!(
            rate = format.sample_rate(),
            bits = parser.bit_depth(),
            channels = format.channels(),
            frames = parser.num_frames(),
            "Opened WAV stream"
        );

        Ok(Self {
            source,
            parser,
            format,
            position: 0,
        })
    }

    pub const fn parser(&self) -> &WavParser {
        &self.parser
    }

    fn data_end(&self) -> u64 {
        self.parser.num_frames() * self.format.frame_size() as u64
    }
}

impl FrameSource for WavDecoder {
    fn decode_frame(&mut self, frame: &mut [u8]) -> Result<DecodeStatus> {
        let frame_size = self.format.frame_size();
        debug_assert_eq!(frame.len(), frame_size);

        if self.position + frame_size as u64 > self.data_end() {
            return Ok(DecodeStatus::EndOfStream);
        }

        let read = self.source.read_fully(frame)?;
        if read < frame_size {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "sample data ended {read} bytes into a {frame_size}-byte frame at offset {}",
                    self.position
                ),
            )));
        }
        self.position += frame_size as u64;
        Ok(DecodeStatus::Frame)
    }

    fn seek_to(&mut self, seconds: f64) -> Result<()> {
        let last_frame = self.parser.num_frames().saturating_sub(1);
        let frame_index = self.format.frame_index_at(seconds).min(last_frame);
        let position = frame_index * self.format.frame_size() as u64;

        self.source
            .seek(self.parser.sample_data_offset() + position)?;
        self.position = position;
        trace!("Seeked to frame {} ({} s)", frame_index, seconds);
        Ok(())
    }

    fn num_frames(&self) -> u64 {
        self.parser.num_frames()
    }

    fn format(&self) -> StreamFormat {
        self.format
    }

    fn metadata(&self) -> TrackMetadata {
        self.parser.track_metadata()
    }
}

/// Every container the pipeline can play.
pub enum Decoder {
    Wav(WavDecoder),
}

impl Decoder {
    /// Sniff the container type and build the matching decoder.
    pub fn open(mut source: Box<dyn DataSource>) -> Result<Self> {
        let mut magic = [0u8; 12];
        source.seek(0)?;
        let read = source.read_fully(&mut magic)?;

        if read == magic.len() && &magic[0..4] == b"RIFF" && &magic[8..12] == b"WAVE" {
            return Ok(Self::Wav(WavDecoder::new(source)?));
        }
        Err(Error::invalid_format("Unrecognized audio container"))
    }
}

impl FrameSource for Decoder {
    fn decode_frame(&mut self, frame: &mut [u8]) -> Result<DecodeStatus> {
        match self {
            Self::Wav(wav) => wav.decode_frame(frame),
        }
    }

    fn seek_to(&mut self, seconds: f64) -> Result<()> {
        match self {
            Self::Wav(wav) => wav.seek_to(seconds),
        }
    }

    fn num_frames(&self) -> u64 {
        match self {
            Self::Wav(wav) => wav.num_frames(),
        }
    }

    fn format(&self) -> StreamFormat {
        match self {
            Self::Wav(wav) => wav.format(),
        }
    }

    fn metadata(&self) -> TrackMetadata {
        match self {
            Self::Wav(wav) => wav.metadata(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryDataSource;
    use crate::wav::tests::{fmt_pcm, riff};

    /// Stereo 16-bit WAV whose left sample holds the frame index.
    fn counting_wav(rate: u32, frames: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(frames as usize * 4);
        for i in 0..frames {
            let value = (i % 32_768) as i16;
            data.extend_from_slice(&value.to_le_bytes());
            data.extend_from_slice(&(-value).to_le_bytes());
        }
        riff(&[(b"fmt ", fmt_pcm(1, 2, rate, 16)), (b"data", data)])
    }

    fn open(bytes: Vec<u8>) -> Decoder {
        Decoder::open(Box::new(MemoryDataSource::from_bytes(bytes))).unwrap()
    }

    fn left_sample(frame: &[u8]) -> i16 {
        i16::from_le_bytes([frame[0], frame[1]])
    }

    #[test]
    fn test_ten_seconds_of_cd_audio() {
        let decoder = open(riff(&[
            (b"fmt ", fmt_pcm(1, 2, 44_100, 16)),
            (b"data", vec![0u8; 1_764_000]),
        ]));
        assert_eq!(decoder.num_frames(), 441_000);
        assert_eq!(decoder.format().frame_size(), 4);
    }

    #[test]
    fn test_decode_in_order_then_end_of_stream() {
        let mut decoder = open(counting_wav(8_000, 3));
        let mut frame = [0u8; 4];

        for expected in 0..3 {
            assert_eq!(decoder.decode_frame(&mut frame).unwrap(), DecodeStatus::Frame);
            assert_eq!(left_sample(&frame), expected);
        }
        assert_eq!(decoder.decode_frame(&mut frame).unwrap(), DecodeStatus::EndOfStream);
        assert_eq!(decoder.decode_frame(&mut frame).unwrap(), DecodeStatus::EndOfStream);
    }

    #[test]
    fn test_seek_is_relative_to_sample_data() {
        let mut decoder = open(counting_wav(1_000, 5_000));
        let mut frame = [0u8; 4];

        decoder.seek_to(2.5).unwrap();
        decoder.decode_frame(&mut frame).unwrap();
        assert_eq!(left_sample(&frame), 2_500);

        decoder.seek_to(0.0).unwrap();
        decoder.decode_frame(&mut frame).unwrap();
        assert_eq!(left_sample(&frame), 0);
    }

    #[test]
    fn test_seek_past_end_clamps_to_last_frame() {
        let mut decoder = open(counting_wav(1_000, 100));
        let mut frame = [0u8; 4];

        decoder.seek_to(60.0).unwrap();
        assert_eq!(decoder.decode_frame(&mut frame).unwrap(), DecodeStatus::Frame);
        assert_eq!(left_sample(&frame), 99);
        assert_eq!(decoder.decode_frame(&mut frame).unwrap(), DecodeStatus::EndOfStream);
    }

    #[test]
    fn test_metadata_passthrough() {
        let mut list = b"INFO".to_vec();
        list.extend_from_slice(b"IART");
        list.extend_from_slice(&4u32.to_le_bytes());
        list.extend_from_slice(b"Duo\0");
        let decoder = open(riff(&[
            (b"fmt ", fmt_pcm(1, 1, 8_000, 8)),
            (b"LIST", list),
            (b"data", vec![0x80; 8]),
        ]));

        assert_eq!(decoder.metadata().artist, "Duo");
        assert_eq!(decoder.format().sample_format(), SampleFormat::U8);
    }

    #[test]
    fn test_rejects_unknown_container_and_format() {
        let result = Decoder::open(Box::new(MemoryDataSource::from_bytes(b"ID3\x03 not a wav".to_vec())));
        assert!(matches!(result, Err(Error::InvalidFormat(_))));

        let float64 = riff(&[(b"fmt ", fmt_pcm(3, 2, 44_100, 64)), (b"data", vec![0; 16])]);
        let result = Decoder::open(Box::new(MemoryDataSource::from_bytes(float64)));
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    /// Data source whose reads start failing past a byte limit.
    struct FailingSource {
        inner: MemoryDataSource,
        fail_after: u64,
    }

    impl DataSource for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.inner.tell()? >= self.fail_after {
                return Err(Error::Io(std::io::Error::other("device removed")));
            }
            self.inner.read(buf)
        }

        fn seek(&mut self, position: u64) -> Result<()> {
            self.inner.seek(position)
        }

        fn tell(&mut self) -> Result<u64> {
            self.inner.tell()
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }
    }

    #[test]
    fn test_read_failure_is_io_error() {
        let bytes = counting_wav(8_000, 10);
        let source = FailingSource {
            inner: MemoryDataSource::from_bytes(bytes),
            fail_after: 44 + 8,
        };
        let mut decoder = Decoder::open(Box::new(source)).unwrap();
        let mut frame = [0u8; 4];

        decoder.decode_frame(&mut frame).unwrap();
        decoder.decode_frame(&mut frame).unwrap();
        assert!(matches!(decoder.decode_frame(&mut frame), Err(Error::Io(_))));
    }
}
