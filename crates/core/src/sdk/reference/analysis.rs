use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::sdk::SampleType;

/// Per-frame features that drive the reference motion model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameFeatures {
    pub rms: f32,
    /// Normalised [0, 1] spectral centroid where 1.0 is the Nyquist frequency.
    pub spectral_centroid: f32,
}

/// Extracts loudness and brightness from 10 ms blocks of raw PCM.
pub struct FrameAnalyzer {
    sample_type: SampleType,
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
    samples: Vec<f32>,
}

impl FrameAnalyzer {
    pub fn new(sample_type: SampleType) -> Self {
        Self {
            sample_type,
            planner: RealFftPlanner::new(),
            fft: None,
            samples: Vec::new(),
        }
    }

    /// Decodes one frame of little-endian PCM and computes its features.
    pub fn analyse(&mut self, frame: &[u8]) -> FrameFeatures {
        decode_into(self.sample_type, frame, &mut self.samples);
        if self.samples.len() < 2 {
            return FrameFeatures::default();
        }

        let rms = compute_rms(&self.samples);
        let spectral_centroid = self.compute_centroid();
        FrameFeatures {
            rms,
            spectral_centroid,
        }
    }

    fn compute_centroid(&mut self) -> f32 {
        let len = self.samples.len();
        if self.fft.as_ref().map_or(true, |fft| fft.size != len) {
            self.fft = Some(FftResources::plan(&mut self.planner, len));
        }
        let Some(fft) = self.fft.as_mut() else {
            return 0.0;
        };

        for (index, value) in self.samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        if fft
            .plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .is_err()
        {
            return 0.0;
        }

        let bins = fft.spectrum.len().max(2);
        let mut magnitude_sum = 0.0;
        let mut weighted_sum = 0.0;
        for (i, bin) in fft.spectrum.iter().enumerate() {
            let magnitude = bin.norm();
            magnitude_sum += magnitude;
            weighted_sum += magnitude * i as f32;
        }

        if magnitude_sum <= f32::EPSILON {
            0.0
        } else {
            (weighted_sum / magnitude_sum / (bins - 1) as f32).clamp(0.0, 1.0)
        }
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for FrameAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAnalyzer")
            .field("sample_type", &self.sample_type)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

/// Converts little-endian PCM bytes into normalised `f32` samples.
pub fn decode_into(sample_type: SampleType, bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    match sample_type {
        SampleType::Int16 => out.extend(
            bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32),
        ),
        SampleType::Int32 => out.extend(
            bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / i32::MAX as f32),
        ),
        SampleType::Float32 => out.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        ),
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int16_frame(samples: impl Iterator<Item = f32>) -> Vec<u8> {
        samples
            .flat_map(|s| ((s * i16::MAX as f32) as i16).to_le_bytes())
            .collect()
    }

    #[test]
    fn silence_has_no_energy() {
        let mut analyzer = FrameAnalyzer::new(SampleType::Int16);
        let features = analyzer.analyse(&vec![0u8; 320]);
        assert_eq!(features.rms, 0.0);
        assert_eq!(features.spectral_centroid, 0.0);
    }

    #[test]
    fn brighter_tones_have_higher_centroid() {
        let mut analyzer = FrameAnalyzer::new(SampleType::Int16);
        let tone = |freq: f32| {
            int16_frame((0..160).map(move |i| 0.5 * (2.0 * PI * freq * i as f32 / 16_000.0).sin()))
        };

        let low = analyzer.analyse(&tone(200.0));
        let high = analyzer.analyse(&tone(6_000.0));
        assert!(low.rms > 0.3 && high.rms > 0.3);
        assert!(high.spectral_centroid > low.spectral_centroid);
    }

    #[test]
    fn decodes_float_samples() {
        let bytes: Vec<u8> = [0.25f32, -0.5].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = Vec::new();
        decode_into(SampleType::Float32, &bytes, &mut out);
        assert_eq!(out, vec![0.25, -0.5]);
    }
}
