//! RIFF/WAVE parsing and PCM resampling
//!
//! The TTS server answers with WAV containers, some of them streamed
//! with sloppy chunk sizes, so the parser is a plain chunk walker
//! instead of a full decoder. Only the pieces the pipeline needs are
//! extracted: channel count, sample rate and the location of the `data`
//! payload.

/// Failure modes of the WAV walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WavError {
    /// Fewer than the 12 header bytes.
    #[error("wav data too short")]
    TooShort,
    /// Leading `RIFF` magic missing.
    #[error("missing RIFF header")]
    MissingRiff,
    /// `WAVE` form type missing.
    #[error("missing WAVE form type")]
    MissingWave,
    /// No `data` chunk found.
    #[error("missing data chunk")]
    MissingData,
}

/// Extracted facts about a WAV buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    /// Channel count from the `fmt ` chunk (0 if absent).
    pub channels: u16,
    /// Sample rate from the `fmt ` chunk (0 if absent).
    pub sample_rate: u32,
    /// Byte offset of the `data` chunk payload.
    pub data_offset: usize,
    /// Payload length, clamped to the buffer.
    pub data_len: usize,
}

/// Walk a RIFF/WAVE buffer and locate the PCM payload.
///
/// Chunks are `{id(4), size(4 LE), payload}` starting at offset 12, with
/// odd-sized payloads padded to a word boundary.
pub fn parse_wav(bytes: &[u8]) -> Result<WavInfo, WavError> {
    if bytes.len() < 12 {
        return Err(WavError::TooShort);
    }
    if &bytes[0..4] != b"RIFF" {
        return Err(WavError::MissingRiff);
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(WavError::MissingWave);
    }

    let mut channels = 0u16;
    let mut sample_rate = 0u32;
    let mut pos = 12usize;

    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_size = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        let payload = pos + 8;

        if chunk_id == b"data" {
            let available = bytes.len().saturating_sub(payload);
            return Ok(WavInfo {
                channels,
                sample_rate,
                data_offset: payload,
                data_len: chunk_size.min(available),
            });
        }

        if chunk_id == b"fmt " && payload + 8 <= bytes.len() {
            channels = u16::from_le_bytes([bytes[payload + 2], bytes[payload + 3]]);
            sample_rate = u32::from_le_bytes([
                bytes[payload + 4],
                bytes[payload + 5],
                bytes[payload + 6],
                bytes[payload + 7],
            ]);
        }

        // Word alignment: odd payloads carry one pad byte.
        pos = payload + chunk_size + (chunk_size & 1);
    }

    Err(WavError::MissingData)
}

/// Linear-interpolation resample of mono 16-bit LE PCM.
///
/// Destination length is `floor(src_samples * dst_rate / src_rate)`; the
/// last source sample is held at the tail. Returns the input unchanged
/// when the rates already match.
pub fn resample_linear(pcm: &[u8], src_rate: u32, dst_rate: u32) -> Vec<u8> {
    if src_rate == dst_rate || src_rate == 0 || dst_rate == 0 {
        return pcm.to_vec();
    }

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    if samples.is_empty() {
        return Vec::new();
    }

    let dst_len = (samples.len() as u64 * dst_rate as u64 / src_rate as u64) as usize;
    let ratio = src_rate as f64 / dst_rate as f64;
    let mut out = Vec::with_capacity(dst_len * 2);

    for i in 0..dst_len {
        let src_pos = i as f64 * ratio;
        let idx0 = src_pos.floor() as usize;
        let idx1 = (idx0 + 1).min(samples.len() - 1);
        let frac = (src_pos - idx0 as f64) as f32;

        let sample = samples[idx0] as f32 * (1.0 - frac) + samples[idx1] as f32 * frac;
        out.extend_from_slice(&(sample as i16).to_le_bytes());
    }

    out
}
