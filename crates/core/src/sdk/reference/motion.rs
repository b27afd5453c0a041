use std::f32::consts::TAU;

use crate::sdk::{EngineRole, NodeKind};

use super::{
    analysis::FrameFeatures,
    character::{CharacterDef, NodeDef},
};

const FIXED_SEED: u64 = 0x5eed_5eed;
const JAW_OPEN_DEGREES: f32 = 20.0;
const HEAD_SWAY_DEGREES: f32 = 3.0;
const IDLE_BREATH_HZ: f32 = 0.25;
const MOOD_WINDOW_FRAMES: u32 = 100;

/// Knobs read from the engine on every step.
#[derive(Debug, Clone, Copy)]
pub struct MotionParams<'a> {
    pub scale: f32,
    pub speed: f32,
    pub expression_frequency: f32,
    pub role: EngineRole,
    pub mood: &'a str,
}

/// Abstract facial pose derived from one frame of input.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionFrame {
    pub open: f32,
    pub purse: f32,
    pub smile: f32,
    pub brow: f32,
    pub head_pitch: f32,
    pub head_yaw: f32,
}

/// Smoothed, deterministic-by-seed motion heuristic.
///
/// This is not a speech model; it only produces plausible values so that the
/// call contract can be exercised end to end.
#[derive(Debug, Clone)]
pub struct MotionModel {
    open: f32,
    purse: f32,
    phase: f32,
    frame: u64,
    mood_energy: f32,
    mood_brightness: f32,
    mood_frames: u32,
}

impl MotionModel {
    pub fn new(fixed_seed: bool) -> Self {
        let seed = if fixed_seed {
            FIXED_SEED
        } else {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos() as u64)
                .unwrap_or(FIXED_SEED)
        };

        Self {
            open: 0.0,
            purse: 0.0,
            phase: (seed % 10_000) as f32 / 10_000.0 * TAU,
            frame: 0,
            mood_energy: 0.0,
            mood_brightness: 0.0,
            mood_frames: 0,
        }
    }

    /// Advances by one 10 ms frame. `features` is `None` for idle frames.
    pub fn step(
        &mut self,
        features: Option<FrameFeatures>,
        aux: Option<f32>,
        params: MotionParams<'_>,
    ) -> MotionFrame {
        self.frame += 1;
        let t = self.frame as f32 * 0.01;
        let follow = (0.5 * params.speed).clamp(0.05, 1.0);
        let listening = params.role == EngineRole::Listen;

        let (target_open, target_purse) = match features {
            Some(features) if !listening => {
                let open = (features.rms * 4.0).clamp(0.0, 1.0);
                (open, open * (1.0 - features.spectral_centroid))
            }
            _ => (0.0, 0.0),
        };
        self.open += (target_open - self.open) * follow;
        self.purse += (target_purse - self.purse) * follow;

        let freq = IDLE_BREATH_HZ * params.expression_frequency.max(0.0);
        let wave = (TAU * freq * t + self.phase).sin();
        let nod = if listening { 2.0 } else { 1.0 };
        let aux_gain = aux.map(|value| 1.0 + value.clamp(-1.0, 1.0)).unwrap_or(1.0);

        let (smile, brow) = match params.mood {
            "positive" => (0.5, 0.3),
            "negative" => (0.0, -0.3),
            _ => (0.1, 0.0),
        };

        MotionFrame {
            open: self.open * params.scale,
            purse: self.purse * params.scale,
            smile: smile * params.scale,
            brow: (brow + 0.1 * wave) * params.scale,
            head_pitch: HEAD_SWAY_DEGREES * nod * aux_gain * wave * params.scale,
            head_yaw: HEAD_SWAY_DEGREES * 0.5 * (0.7 * wave + self.phase).cos() * params.scale,
        }
    }

    /// Accumulates speech statistics and returns the mood automatic detection
    /// settles on whenever a detection window closes.
    pub fn detect_mood(&mut self, features: FrameFeatures, expression_frequency: f32) -> Option<&'static str> {
        self.mood_energy += features.rms;
        self.mood_brightness += features.spectral_centroid;
        self.mood_frames += 1;

        let window = (MOOD_WINDOW_FRAMES as f32 / expression_frequency.max(0.1)).max(1.0) as u32;
        if self.mood_frames < window {
            return None;
        }

        let energy = self.mood_energy / self.mood_frames as f32;
        let brightness = self.mood_brightness / self.mood_frames as f32;
        self.mood_energy = 0.0;
        self.mood_brightness = 0.0;
        self.mood_frames = 0;

        Some(if energy > 0.2 {
            "positive"
        } else if energy > 0.05 && brightness > 0.5 {
            "negative"
        } else {
            "neutral"
        })
    }
}

/// Writes the channel values of every node in character order.
pub fn fill_channels(character: &CharacterDef, motion: &MotionFrame, out: &mut Vec<f32>) {
    out.clear();
    let mut joints = 0;
    for node in &character.nodes {
        match NodeKind::from(node.kind) {
            NodeKind::Joint => {
                let (rx, ry, rz) = if joints == 0 {
                    (motion.open * JAW_OPEN_DEGREES, 0.0, 0.0)
                } else {
                    (motion.head_pitch, motion.head_yaw, 0.0)
                };
                joints += 1;
                out.extend_from_slice(&[0.0, 0.0, 0.0, rx, ry, rz, 1.0, 1.0, 1.0]);
            }
            NodeKind::Blendshape | NodeKind::Other => fill_named(node, motion, out),
            NodeKind::Unrecognized(_) => out.extend(node.channels.iter().map(|_| 0.0)),
        }
    }
}

fn fill_named(node: &NodeDef, motion: &MotionFrame, out: &mut Vec<f32>) {
    for channel in &node.channels {
        let name = channel.to_ascii_lowercase();
        let value = if name.contains("open") {
            motion.open
        } else if name.contains("purse") || name.contains("pucker") || name.contains("funnel") {
            motion.purse
        } else if name.contains("smile") {
            motion.smile
        } else if name.contains("brow") {
            motion.brow
        } else {
            motion.open * 0.5
        };
        out.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(mood: &str) -> MotionParams<'_> {
        MotionParams {
            scale: 1.0,
            speed: 1.0,
            expression_frequency: 1.0,
            role: EngineRole::Speak,
            mood,
        }
    }

    fn loud() -> FrameFeatures {
        FrameFeatures {
            rms: 0.5,
            spectral_centroid: 0.2,
        }
    }

    #[test]
    fn loud_speech_opens_the_jaw() {
        let mut model = MotionModel::new(true);
        let mut frame = MotionFrame::default();
        for _ in 0..20 {
            frame = model.step(Some(loud()), None, params("neutral"));
        }
        assert!(frame.open > 0.9);

        for _ in 0..20 {
            frame = model.step(None, None, params("neutral"));
        }
        assert!(frame.open < 0.01);
    }

    #[test]
    fn listening_keeps_the_mouth_closed() {
        let mut model = MotionModel::new(true);
        let listen = MotionParams {
            role: EngineRole::Listen,
            ..params("neutral")
        };
        let frame = model.step(Some(loud()), None, listen);
        assert_eq!(frame.open, 0.0);
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let mut a = MotionModel::new(true);
        let mut b = MotionModel::new(true);
        for _ in 0..5 {
            assert_eq!(
                a.step(None, Some(0.2), params("positive")),
                b.step(None, Some(0.2), params("positive"))
            );
        }
    }

    #[test]
    fn fills_one_value_per_channel() {
        let character = CharacterDef::demo();
        let mut model = MotionModel::new(true);
        let frame = model.step(Some(loud()), None, params("positive"));

        let mut values = Vec::new();
        fill_channels(&character, &frame, &mut values);
        assert_eq!(values.len(), character.channel_count());
        // jaw rx, then the neutral scale channels
        assert!(values[3] > 0.0);
        assert_eq!(&values[6..9], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn mood_detection_reports_once_per_window() {
        let mut model = MotionModel::new(true);
        let mut detected = Vec::new();
        for _ in 0..250 {
            if let Some(mood) = model.detect_mood(loud(), 1.0) {
                detected.push(mood);
            }
        }
        assert_eq!(detected, vec!["positive", "positive"]);
    }
}
