//! RIFF/WAVE container parsing.
//!
//! Only the header is parsed here: format, sample-data byte range and INFO
//! tags. Sample data itself is left in the source for the decoder to stream.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::HashMap;

use cadence_core::{Error, Result, TrackMetadata};
use tracing::{debug, trace};

use crate::io::DataSource;

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Sample encoding declared by the `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavFormat {
    Pcm,
    IeeeFloat,
    /// Extensible header whose sub-format could not be resolved.
    Extensible,
    Unknown,
}

impl WavFormat {
    /// Map a WAVE format code.
    pub const fn from_code(code: u16) -> Self {
        match code {
            WAVE_FORMAT_PCM => Self::Pcm,
            WAVE_FORMAT_IEEE_FLOAT => Self::IeeeFloat,
            WAVE_FORMAT_EXTENSIBLE => Self::Extensible,
            _ => Self::Unknown,
        }
    }
}

/// Well-known INFO list tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTag {
    Title,
    Artist,
    Album,
    Comment,
    Year,
    Genre,
    TrackNumber,
}

impl InfoTag {
    /// The four-character chunk id of this tag.
    pub const fn fourcc(self) -> &'static str {
        match self {
            Self::Title => "INAM",
            Self::Artist => "IART",
            Self::Album => "IPRD",
            Self::Comment => "ICMT",
            Self::Year => "ICRD",
            Self::Genre => "IGNR",
            Self::TrackNumber => "ITRK",
        }
    }
}

/// Parsed WAV header.
#[derive(Debug, Clone)]
pub struct WavParser {
    channels: u16,
    bit_depth: u16,
    sample_rate: u32,
    format: WavFormat,
    sample_data_offset: u64,
    sample_data_size: u64,
    info_tags: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct FmtChunk {
    channels: u16,
    bit_depth: u16,
    sample_rate: u32,
    format: Option<WavFormat>,
}

impl WavParser {
    /// Parse the header of a WAV stream from the start of `source`.
    ///
    /// On success the source cursor is left at an unspecified position; the
    /// decoder repositions it before reading samples.
    pub fn parse(source: &mut dyn DataSource) -> Result<Self> {
        source.seek(0)?;

        let mut riff = [0u8; 12];
        if source.read_fully(&mut riff)? < riff.len() || &riff[0..4] != b"RIFF" {
            return Err(Error::invalid_format("File does not start with RIFF chunk"));
        }
        if &riff[8..12] != b"WAVE" {
            return Err(Error::invalid_format("RIFF form type is not WAVE"));
        }

        let mut fmt = FmtChunk::default();
        let mut data: Option<(u64, u64)> = None;
        let mut info_tags = HashMap::new();

        while !source.end_of_file()? {
            let mut header = [0u8; 8];
            if source.read_fully(&mut header)? < header.len() {
                trace!("Ignoring truncated trailing chunk header");
                break;
            }
            let id = [header[0], header[1], header[2], header[3]];
            let size = u64::from(le_u32(&header[4..8]));
            let body_start = source.tell()?;

            match &id {
                b"fmt " => fmt = parse_fmt_chunk(source, size)?,
                b"data" => {
                    let available = source.size().saturating_sub(body_start);
                    data = Some((body_start, size.min(available)));
                }
                b"LIST" => parse_list_chunk(source, size, &mut info_tags)?,
                _ => trace!("Skipping chunk {:?} ({} bytes)", String::from_utf8_lossy(&id), size),
            }

            // Chunks are word aligned: odd sizes carry one pad byte.
            source.seek(body_start + size + (size % 2))?;
        }

        let format = fmt
            .format
            .ok_or_else(|| Error::invalid_format("WAV file has no fmt chunk"))?;
        let (sample_data_offset, sample_data_size) =
            data.ok_or_else(|| Error::invalid_format("WAV file has no data chunk"))?;

        if fmt.channels == 0 {
            return Err(Error::invalid_format("WAV file declares zero channels"));
        }
        if fmt.sample_rate == 0 {
            return Err(Error::invalid_format("WAV file declares a zero sample rate"));
        }
        if fmt.bit_depth == 0 || fmt.bit_depth % 8 != 0 {
            return Err(Error::invalid_format(format!(
                "Unsupported bit depth {}",
                fmt.bit_depth
            )));
        }

        debug!(
            "Parsed WAV header: {:?}, {} Hz, {} bit, {} channels, {} data bytes at {}",
            format, fmt.sample_rate, fmt.bit_depth, fmt.channels, sample_data_size, sample_data_offset
        );

        Ok(Self {
            channels: fmt.channels,
            bit_depth: fmt.bit_depth,
            sample_rate: fmt.sample_rate,
            format,
            sample_data_offset,
            sample_data_size,
            info_tags,
        })
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }

    pub const fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn format(&self) -> WavFormat {
        self.format
    }

    /// Absolute byte position where sample data begins.
    pub const fn sample_data_offset(&self) -> u64 {
        self.sample_data_offset
    }

    /// Length of the sample data in bytes.
    pub const fn sample_data_size(&self) -> u64 {
        self.sample_data_size
    }

    /// Bytes per frame (one sample for every channel).
    pub fn frame_size(&self) -> u64 {
        u64::from(self.bit_depth / 8) * u64::from(self.channels)
    }

    /// Number of whole frames in the sample data.
    pub fn num_frames(&self) -> u64 {
        self.sample_data_size / self.frame_size()
    }

    /// Value of an INFO tag by its four-character id, or `""` if absent.
    pub fn metadata(&self, tag: &str) -> &str {
        self.info_tags.get(tag).map_or("", String::as_str)
    }

    /// Value of a well-known INFO tag, or `""` if absent.
    pub fn tag(&self, tag: InfoTag) -> &str {
        self.metadata(tag.fourcc())
    }

    /// Collect the well-known tags.
    pub fn track_metadata(&self) -> TrackMetadata {
        TrackMetadata {
            title: self.tag(InfoTag::Title).to_string(),
            artist: self.tag(InfoTag::Artist).to_string(),
            album: self.tag(InfoTag::Album).to_string(),
            comment: self.tag(InfoTag::Comment).to_string(),
            year: self.tag(InfoTag::Year).to_string(),
            genre: self.tag(InfoTag::Genre).to_string(),
            track_number: self.tag(InfoTag::TrackNumber).to_string(),
        }
    }
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_fmt_chunk(source: &mut dyn DataSource, size: u64) -> Result<FmtChunk> {
    if !matches!(size, 16 | 18 | 40) {
        return Err(Error::invalid_format("Malformed fmt chunk in WAV file"));
    }

    let mut body = [0u8; 40];
    let body = &mut body[..size as usize];
    if source.read_fully(body)? < body.len() {
        return Err(Error::invalid_format("Truncated fmt chunk in WAV file"));
    }

    let code = le_u16(&body[0..2]);
    let mut format = WavFormat::from_code(code);

    // cbSize > 0 means the extensible block follows; its GUID starts with the real code.
    if size == 40 && le_u16(&body[16..18]) >= 22 && format == WavFormat::Extensible {
        let sub_format = le_u16(&body[24..26]);
        format = match WavFormat::from_code(sub_format) {
            WavFormat::Extensible => WavFormat::Unknown,
            resolved => resolved,
        };
    }

    Ok(FmtChunk {
        format: Some(format),
        channels: le_u16(&body[2..4]),
        sample_rate: le_u32(&body[4..8]),
        bit_depth: le_u16(&body[14..16]),
    })
}

fn parse_list_chunk(
    source: &mut dyn DataSource,
    size: u64,
    tags: &mut HashMap<String, String>,
) -> Result<()> {
    let mut list_type = [0u8; 4];
    if size < 4 || source.read_fully(&mut list_type)? < 4 || &list_type != b"INFO" {
        return Ok(());
    }

    let mut consumed = 4u64;
    while consumed + 8 <= size {
        let mut header = [0u8; 8];
        if source.read_fully(&mut header)? < header.len() {
            break;
        }
        let tag_size = u64::from(le_u32(&header[4..8]));
        if consumed + 8 + tag_size > size {
            return Err(Error::invalid_format("INFO entry overruns its LIST chunk"));
        }
        let available = source.size().saturating_sub(source.tell()?);
        if tag_size > available {
            return Err(Error::invalid_format(format!(
                "INFO entry of {tag_size} bytes overruns the file ({available} bytes left)"
            )));
        }

        let mut value = vec![0u8; tag_size as usize];
        source.read_fully(&mut value)?;
        let id = String::from_utf8_lossy(&header[0..4]).into_owned();
        let text = String::from_utf8_lossy(&value)
            .trim_end_matches('\0')
            .to_string();
        tags.insert(id, text);

        let padded = tag_size + (tag_size % 2);
        if padded > tag_size {
            source.skip(1)?;
        }
        consumed += 8 + padded;
    }

    Ok(())
}
