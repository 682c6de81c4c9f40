#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::fmt::Display;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Sampling rate the Voxtral feature extractor expects.
pub const SAMPLE_RATE: u32 = 16_000;

const RESAMPLE_CHUNK_SIZE: usize = 1024;

/// The audio file could not be read or decoded.
#[derive(Debug)]
pub struct InvalidAudio {
    pub path: PathBuf,
    pub reason: String,
}

impl Display for InvalidAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid audio file {}: {}", self.path.display(), self.reason)
    }
}

impl std::error::Error for InvalidAudio {}

/// Decoded mono audio at [`SAMPLE_RATE`], along with the file it was read from.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub path: PathBuf,
    pub samples: Vec<f32>,
}

impl AudioClip {
    /// Reads and decodes the file, downmixing to mono and resampling when needed.
    #[tracing::instrument(level = "info")]
    pub fn load(path: &Path) -> Result<Self> {
        let invalid = |reason: String| InvalidAudio {
            path: path.to_path_buf(),
            reason,
        };
        let (pcm, sample_rate) = pcm_decode(path).map_err(|e| invalid(format!("{e:#}")))?;
        if pcm.is_empty() {
            return Err(invalid("no samples".into()).into());
        }
        let samples = if sample_rate == SAMPLE_RATE {
            pcm
        } else {
            resample(&pcm, sample_rate, SAMPLE_RATE)?
        };
        debug!("pcm data loaded {}", samples.len());

        Ok(Self {
            path: path.to_path_buf(),
            samples,
        })
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(SAMPLE_RATE)
    }
}

// Adapted from https://github.com/huggingface/candle/blob/main/candle-examples/src/audio.rs
/// Decodes the first audio track of a file into mono f32 samples and its sampling rate.
pub fn pcm_decode(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = File::open(path)?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }
    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let Some(track) = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
    else {
        bail!("No supported audio track found")
    };
    let track_id = track.id;
    let Some(sample_rate) = track.codec_params.sample_rate else {
        bail!("Audio track has no sampling rate")
    };
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut pcm_data = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(err) => return Err(err.into()),
        };
        while !format.metadata().is_latest() {
            format.metadata().pop();
        }
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        let channels = decoded.spec().channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        pcm_data.extend(
            buffer
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    Ok((pcm_data, sample_rate))
}

/// Sinc resampling of mono audio between two rates.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK_SIZE, 1)
        .map_err(|e| anyhow!("Failed to create resampler: {e}"))?;

    let mut output = Vec::with_capacity((samples.len() as f64 * ratio) as usize + RESAMPLE_CHUNK_SIZE);
    for chunk in samples.chunks(RESAMPLE_CHUNK_SIZE) {
        let mut input = chunk.to_vec();
        input.resize(RESAMPLE_CHUNK_SIZE, 0.0);

        let resampled = resampler
            .process(&[input], None)
            .map_err(|e| anyhow!("Resampling failed: {e}"))?;
        let Some(channel) = resampled.first() else {
            continue;
        };
        // The final chunk is zero padded, only keep its proportional share
        let take = if chunk.len() < RESAMPLE_CHUNK_SIZE {
            ((chunk.len() as f64 * ratio).ceil() as usize).min(channel.len())
        } else {
            channel.len()
        };
        output.extend_from_slice(&channel[..take]);
    }

    debug!(
        "resampled {} -> {} samples ({from_rate}Hz -> {to_rate}Hz)",
        samples.len(),
        output.len()
    );
    Ok(output)
}
