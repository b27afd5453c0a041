use std::{
    io::{Read, Seek},
    path::{Path, PathBuf},
    time::Duration,
};

use hound::{SampleFormat, WavReader};

use crate::sdk::{SampleRate, SampleType};

/// WAVE format tag for integer PCM.
pub const FORMAT_PCM: u16 = 0x0001;
/// WAVE format tag for IEEE float samples.
pub const FORMAT_IEEE_FLOAT: u16 = 0x0003;

/// Reasons a clip cannot be fed to an engine.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("wav: {0}")]
    Wav(#[from] hound::Error),
    #[error("clip must be mono, found {0} channels")]
    NotMono(u16),
    #[error("PCM samples must be 16 or 32 bit, found {0}")]
    UnsupportedPcmDepth(u16),
    #[error("IEEE float samples must be 32 bit, found {0}")]
    UnsupportedFloatDepth(u16),
    #[error("unsupported sample rate {0} Hz")]
    UnsupportedSampleRate(u32),
    #[error("cannot read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One decoded input clip: format metadata plus raw little-endian PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub format_tag: u16,
    pub pcm: Vec<u8>,
    pub source: Option<PathBuf>,
}

impl AudioClip {
    /// Loads and validates a WAV file.
    pub fn from_path(path: &Path) -> Result<Self, ClipError> {
        let bytes = std::fs::read(path).map_err(|source| ClipError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut clip = Self::from_wav_bytes(&bytes)?;
        clip.source = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), bytes = clip.pcm.len(), "loaded clip");
        Ok(clip)
    }

    /// Parses an in-memory WAV container.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, ClipError> {
        Self::from_reader(std::io::Cursor::new(bytes))
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, ClipError> {
        let mut wav = WavReader::new(reader)?;
        let spec = wav.spec();

        if spec.channels != 1 {
            return Err(ClipError::NotMono(spec.channels));
        }

        let (format_tag, pcm) = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => (FORMAT_PCM, collect_le(wav.samples::<i16>(), i16::to_le_bytes)?),
            (SampleFormat::Int, 32) => (FORMAT_PCM, collect_le(wav.samples::<i32>(), i32::to_le_bytes)?),
            (SampleFormat::Float, 32) => {
                (FORMAT_IEEE_FLOAT, collect_le(wav.samples::<f32>(), f32::to_le_bytes)?)
            }
            (SampleFormat::Int, bits) => return Err(ClipError::UnsupportedPcmDepth(bits)),
            (SampleFormat::Float, bits) => return Err(ClipError::UnsupportedFloatDepth(bits)),
        };

        Ok(Self {
            sample_rate: spec.sample_rate,
            bits_per_sample: spec.bits_per_sample,
            format_tag,
            pcm,
            source: None,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / (self.bits_per_sample as usize / 8).max(1)
    }

    /// Clip length derived from the sample count.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / self.sample_rate as f64)
    }

    pub fn sample_type(&self) -> SampleType {
        match (self.format_tag, self.bits_per_sample) {
            (FORMAT_IEEE_FLOAT, _) => SampleType::Float32,
            (_, 32) => SampleType::Int32,
            _ => SampleType::Int16,
        }
    }

    pub fn sample_rate(&self) -> Result<SampleRate, ClipError> {
        SampleRate::from_hz(self.sample_rate).ok_or(ClipError::UnsupportedSampleRate(self.sample_rate))
    }

    /// Whether an engine created for `other` can take this clip's PCM as is.
    pub fn same_format(&self, other: &AudioClip) -> bool {
        self.sample_rate == other.sample_rate
            && self.bits_per_sample == other.bits_per_sample
            && self.format_tag == other.format_tag
    }
}

fn collect_le<S, const N: usize>(
    samples: impl Iterator<Item = hound::Result<S>>,
    to_bytes: fn(S) -> [u8; N],
) -> Result<Vec<u8>, ClipError> {
    let mut out = Vec::with_capacity(samples.size_hint().0 * N);
    for sample in samples {
        out.extend_from_slice(&to_bytes(sample?));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use hound::{WavSpec, WavWriter};

    use super::*;

    fn wav(channels: u16, bits: u16, format: SampleFormat, rate: u32, frames: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: bits,
            sample_format: format,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames * channels as usize {
                match (format, bits) {
                    (SampleFormat::Float, _) => writer.write_sample(i as f32 / 1000.0).unwrap(),
                    (SampleFormat::Int, 8) => writer.write_sample((i % 100) as i8).unwrap(),
                    (SampleFormat::Int, 16) => writer.write_sample(i as i16).unwrap(),
                    (SampleFormat::Int, 24) => writer.write_sample(i as i32).unwrap(),
                    _ => writer.write_sample(i as i32 * 1000).unwrap(),
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn mono_16_bit_clip_has_expected_length() {
        let clip = AudioClip::from_wav_bytes(&wav(1, 16, SampleFormat::Int, 16_000, 8_000)).unwrap();

        assert_eq!(clip.pcm.len(), 2 * 8_000);
        assert_eq!(clip.sample_count(), 8_000);
        assert_eq!(clip.duration(), Duration::from_millis(500));
        assert_eq!(clip.format_tag, FORMAT_PCM);
        assert_eq!(clip.sample_type(), SampleType::Int16);
        assert_eq!(clip.sample_rate().unwrap(), SampleRate::Hz16000);
        // raw bytes are little-endian samples in file order
        assert_eq!(&clip.pcm[2..4], &1i16.to_le_bytes());
    }

    #[test]
    fn rejects_stereo() {
        let err = AudioClip::from_wav_bytes(&wav(2, 16, SampleFormat::Int, 16_000, 100)).unwrap_err();
        assert!(matches!(err, ClipError::NotMono(2)));
    }

    #[test]
    fn rejects_unsupported_depths() {
        let err = AudioClip::from_wav_bytes(&wav(1, 8, SampleFormat::Int, 16_000, 100)).unwrap_err();
        assert!(matches!(err, ClipError::UnsupportedPcmDepth(8)));

        let err = AudioClip::from_wav_bytes(&wav(1, 24, SampleFormat::Int, 16_000, 100)).unwrap_err();
        assert!(matches!(err, ClipError::UnsupportedPcmDepth(24)));
    }

    #[test]
    fn accepts_float_and_32_bit_pcm() {
        let float = AudioClip::from_wav_bytes(&wav(1, 32, SampleFormat::Float, 48_000, 480)).unwrap();
        assert_eq!(float.format_tag, FORMAT_IEEE_FLOAT);
        assert_eq!(float.sample_type(), SampleType::Float32);
        assert_eq!(float.pcm.len(), 4 * 480);

        let int = AudioClip::from_wav_bytes(&wav(1, 32, SampleFormat::Int, 8_000, 80)).unwrap();
        assert_eq!(int.sample_type(), SampleType::Int32);
        assert_eq!(int.duration(), Duration::from_millis(10));
    }

    #[test]
    fn reports_unsupported_rates_and_garbage() {
        let clip = AudioClip::from_wav_bytes(&wav(1, 16, SampleFormat::Int, 22_050, 10)).unwrap();
        assert!(matches!(clip.sample_rate(), Err(ClipError::UnsupportedSampleRate(22_050))));

        assert!(matches!(
            AudioClip::from_wav_bytes(b"definitely not a wav"),
            Err(ClipError::Wav(_))
        ));
        assert!(matches!(
            AudioClip::from_path(Path::new("/nonexistent/clip.wav")),
            Err(ClipError::Read { .. })
        ));
    }
}
