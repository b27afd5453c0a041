//! Capability boundary around the SG Com animation SDK.
//!
//! The SDK is an opaque component that turns audio into time-stamped animation
//! node values. Everything this crate knows about it is the call contract
//! captured by [`SgComApi`]: one method per entry point of the C surface, each
//! returning an [`SgComError`] code on failure. Two backends implement it:
//!
//! * [`reference::ReferenceSdk`]: an in-process implementation of the call
//!   contract used by tests and the demo binary.
//! * `native::NativeSdk` (feature `native`): the proprietary shared library
//!   bound through [`sys`].

use std::{
    fmt,
    path::Path,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::SgComError;

#[cfg(feature = "native")]
pub mod native;
pub mod reference;
#[cfg(feature = "native")]
pub mod sys;

/// Duration of one engine tick.
pub const FRAME_DURATION: Duration = Duration::from_millis(10);
/// Duration of one engine tick in milliseconds.
pub const FRAME_MS: f64 = 10.0;
/// Rate at which auxiliary data is consumed.
pub const AUX_RATE_HZ: u32 = 100;

/// Sample encoding of the audio fed to an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Int16,
    Int32,
    Float32,
}

impl SampleType {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
        }
    }
}

/// Input sample rates accepted by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleRate {
    Hz8000,
    Hz12000,
    Hz16000,
    Hz24000,
    Hz32000,
    Hz44100,
    Hz48000,
}

impl SampleRate {
    pub const ALL: [SampleRate; 7] = [
        Self::Hz8000,
        Self::Hz12000,
        Self::Hz16000,
        Self::Hz24000,
        Self::Hz32000,
        Self::Hz44100,
        Self::Hz48000,
    ];

    pub fn hz(self) -> u32 {
        match self {
            Self::Hz8000 => 8_000,
            Self::Hz12000 => 12_000,
            Self::Hz16000 => 16_000,
            Self::Hz24000 => 24_000,
            Self::Hz32000 => 32_000,
            Self::Hz44100 => 44_100,
            Self::Hz48000 => 48_000,
        }
    }

    pub fn from_hz(hz: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|rate| rate.hz() == hz)
    }

    /// Samples consumed by one 10 ms tick.
    pub fn samples_per_frame(self) -> usize {
        (self.hz() / 100) as usize
    }
}

/// Verbosity of the SDK's own log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    None,
    Error,
    Debug,
}

/// Kind of animation a player outputs. Baked output requires rig logic stored
/// in the character setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationType {
    #[default]
    Normal,
    Baked,
}

/// Float knobs exposed by an engine. All default to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineControl {
    /// Scale factor of muscle motion.
    Scale,
    /// Speed factor of muscle motion.
    Speed,
    /// Frequency of expression change.
    ExpressionFrequency,
}

impl EngineControl {
    pub const ALL: [EngineControl; 3] = [Self::Scale, Self::Speed, Self::ExpressionFrequency];
}

/// Whether an engine animates its character as speaker or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineRole {
    #[default]
    Speak,
    Listen,
}

/// Optional engine features, mirrored onto the C flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineFeatures {
    /// Synthesize idle animation when no input is buffered.
    #[serde(default)]
    pub idle: bool,
    /// Seed random generators with a fixed value for deterministic output.
    #[serde(default)]
    pub fixed_random_seed: bool,
}

impl EngineFeatures {
    const IDLE_BIT: u32 = 1;
    const FIXED_SEED_BIT: u32 = 2;

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.idle {
            bits |= Self::IDLE_BIT;
        }
        if self.fixed_random_seed {
            bits |= Self::FIXED_SEED_BIT;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            idle: bits & Self::IDLE_BIT != 0,
            fixed_random_seed: bits & Self::FIXED_SEED_BIT != 0,
        }
    }
}

/// Asynchronous notifications raised by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The current mood changed, manually or automatically. The message holds
    /// the new mood name.
    MoodChanged,
}

/// Kind of an animation node.
///
/// Unknown raw values are preserved so that callers can ignore kinds added by
/// newer SDK versions instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Joint,
    Blendshape,
    /// Generic animation curves.
    Other,
    Unrecognized(i32),
}

impl NodeKind {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Joint,
            1 => Self::Blendshape,
            2 => Self::Other,
            other => Self::Unrecognized(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Joint => 0,
            Self::Blendshape => 1,
            Self::Other => 2,
            Self::Unrecognized(raw) => raw,
        }
    }
}

/// Opaque id of a live engine inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u64);

/// Opaque id of a live player inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{:x}", self.0)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{:x}", self.0)
    }
}

/// Receives log lines emitted by the SDK.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Receives engine status notifications, possibly on an SDK-internal thread.
pub type StatusCallback = Arc<dyn Fn(EngineId, EngineStatus, &str) + Send + Sync>;
/// Receives packets an engine broadcasts to remote players.
pub type BroadcastCallback = Arc<dyn Fn(EngineId, &[u8]) + Send + Sync>;

/// Licensing credentials forwarded to `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseInfo {
    /// Directory of a floating license file, or an embedded license string.
    pub data: String,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub custom_data: Option<String>,
}

impl LicenseInfo {
    pub const LICENSE_FILE: &'static str = "sg.lic";
    pub const LICENSE_STRING_FILE: &'static str = "license";

    pub fn from_string(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Resolves credentials from a resources directory: the directory itself
    /// when it holds a floating license file, otherwise the contents of the
    /// `license` file found there.
    pub fn discover(resources_dir: &Path) -> Self {
        if resources_dir.join(Self::LICENSE_FILE).is_file() {
            return Self::from_string(resources_dir.to_string_lossy());
        }

        let data = std::fs::read_to_string(resources_dir.join(Self::LICENSE_STRING_FILE))
            .map(|contents| contents.trim().to_string())
            .unwrap_or_default();
        if data.is_empty() {
            tracing::warn!(
                dir = %resources_dir.display(),
                "license string is empty; a valid license must be passed to initialize"
            );
        }
        Self::from_string(data)
    }
}

/// Engine creation parameters.
#[derive(Clone)]
pub struct EngineConfig {
    /// Compiled character definition, passed whole to the SDK.
    pub character: Arc<[u8]>,
    pub sample_type: SampleType,
    pub sample_rate: SampleRate,
    /// Player fed locally with this engine's output.
    pub local_player: Option<PlayerId>,
    /// Set to broadcast output packets to remote players.
    pub broadcast: Option<BroadcastCallback>,
    pub status: Option<StatusCallback>,
    /// Maximum duration the input buffer can hold.
    pub buffer_seconds: f32,
    pub features: EngineFeatures,
}

impl EngineConfig {
    pub fn new(character: Arc<[u8]>, sample_type: SampleType, sample_rate: SampleRate) -> Self {
        Self {
            character,
            sample_type,
            sample_rate,
            local_player: None,
            broadcast: None,
            status: None,
            buffer_seconds: 200.0,
            features: EngineFeatures::default(),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("character_bytes", &self.character.len())
            .field("sample_type", &self.sample_type)
            .field("sample_rate", &self.sample_rate)
            .field("local_player", &self.local_player)
            .field("broadcast", &self.broadcast.is_some())
            .field("status", &self.status.is_some())
            .field("buffer_seconds", &self.buffer_seconds)
            .field("features", &self.features)
            .finish()
    }
}

/// Player creation parameters.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub character: Arc<[u8]>,
    pub animation_type: AnimationType,
    /// Maximum duration the output buffer can hold.
    pub buffer_seconds: f32,
}

/// One animatable target with its current channel values.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationNode {
    pub name: String,
    pub kind: NodeKind,
    pub channel_names: Vec<String>,
    /// Parallel to `channel_names`.
    pub values: Vec<f32>,
}

impl AnimationNode {
    pub fn channels(&self) -> impl Iterator<Item = (&str, f32)> + '_ {
        self.channel_names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

/// Result of a single `process_tick` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    /// Frames processed by this tick (0 or 1).
    pub processed_frames: u32,
    /// Whole frames still waiting in the input buffer.
    pub remaining_frames: u32,
}

/// Window of buffered animation a player can present.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayableRange {
    pub min_ms: f64,
    pub max_ms: f64,
}

impl PlayableRange {
    pub fn span_ms(&self) -> f64 {
        (self.max_ms - self.min_ms).max(0.0)
    }

    pub fn clamp(&self, time_ms: f64) -> f64 {
        time_ms.clamp(self.min_ms, self.max_ms)
    }
}

/// The fixed SG Com call surface.
///
/// Implementations must be callable from several threads at once: the tick
/// worker and the presentation loop share handles without external locking.
pub trait SgComApi: Send + Sync {
    /// Must be called once before anything else.
    fn initialize(
        &self,
        level: LogLevel,
        logger: Option<LogCallback>,
        license: &LicenseInfo,
    ) -> Result<(), SgComError>;
    /// Must be the last call. Handles not destroyed before are leaked.
    fn shutdown(&self) -> Result<(), SgComError>;

    /// "major.minor.patch-label".
    fn version_string(&self) -> String;
    /// vvvmmmppp.
    fn version_number(&self) -> u32;

    /// Detail for the last [`SgComError::Exception`]. Informational only.
    fn exception_text(&self) -> String;

    fn create_engine(&self, config: &EngineConfig) -> Result<EngineId, SgComError>;
    fn destroy_engine(&self, engine: EngineId) -> Result<(), SgComError>;
    fn input_audio(&self, engine: EngineId, data: &[u8]) -> Result<(), SgComError>;
    fn input_aux_data(&self, engine: EngineId, data: &[u8]) -> Result<(), SgComError>;
    fn process_tick(&self, engine: EngineId) -> Result<TickOutcome, SgComError>;
    fn reset(&self, engine: EngineId) -> Result<(), SgComError>;
    /// `"auto"` engages automatic mood detection.
    fn set_mood(&self, engine: EngineId, mood: &str) -> Result<(), SgComError>;
    fn mood(&self, engine: EngineId) -> Result<String, SgComError>;
    fn mood_list(&self, engine: EngineId) -> Result<Vec<String>, SgComError>;
    fn set_role(&self, engine: EngineId, role: EngineRole) -> Result<(), SgComError>;
    fn role(&self, engine: EngineId) -> Result<EngineRole, SgComError>;
    fn engine_control(&self, engine: EngineId, control: EngineControl) -> Result<f32, SgComError>;
    fn set_engine_control(
        &self,
        engine: EngineId,
        control: EngineControl,
        value: f32,
    ) -> Result<(), SgComError>;

    fn create_player(&self, config: &PlayerConfig) -> Result<PlayerId, SgComError>;
    fn destroy_player(&self, player: PlayerId) -> Result<(), SgComError>;
    fn receive_packet(&self, player: PlayerId, packet: &[u8]) -> Result<(), SgComError>;
    /// Snapshot of the player's nodes as of the last animation update.
    fn animation_nodes(&self, player: PlayerId) -> Result<Vec<AnimationNode>, SgComError>;
    /// Moves playback to `time_ms` clamped to the playable range and returns
    /// the clamped time.
    fn update_animation(&self, player: PlayerId, time_ms: f64) -> Result<f64, SgComError>;
    fn playable_range(&self, player: PlayerId) -> Result<PlayableRange, SgComError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_supported_rate() {
        for rate in SampleRate::ALL {
            assert_eq!(SampleRate::from_hz(rate.hz()), Some(rate));
        }
        assert_eq!(SampleRate::from_hz(22_050), None);
        assert_eq!(SampleRate::Hz44100.samples_per_frame(), 441);
    }

    #[test]
    fn feature_bits_match_the_c_flags() {
        let features = EngineFeatures {
            idle: true,
            fixed_random_seed: true,
        };
        assert_eq!(features.bits(), 3);
        assert!(EngineFeatures::from_bits(1).idle);
        assert!(EngineFeatures::from_bits(2).fixed_random_seed);
        assert_eq!(EngineFeatures::default().bits(), 0);
    }

    #[test]
    fn keeps_unknown_node_kinds() {
        assert_eq!(NodeKind::from_raw(1), NodeKind::Blendshape);
        assert_eq!(NodeKind::from_raw(7), NodeKind::Unrecognized(7));
        assert_eq!(NodeKind::Unrecognized(7).raw(), 7);
    }

    #[test]
    fn discovers_floating_license_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sg.lic"), b"floating").unwrap();

        let license = LicenseInfo::discover(dir.path());
        assert_eq!(license.data, dir.path().to_string_lossy());
    }

    #[test]
    fn falls_back_to_license_string_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("license"), b"  KEY-123\n").unwrap();

        let license = LicenseInfo::discover(dir.path());
        assert_eq!(license.data, "KEY-123");

        let empty = tempfile::tempdir().unwrap();
        assert!(LicenseInfo::discover(empty.path()).data.is_empty());
    }

    #[test]
    fn clamps_into_range() {
        let range = PlayableRange {
            min_ms: 10.0,
            max_ms: 30.0,
        };
        assert_eq!(range.clamp(0.0), 10.0);
        assert_eq!(range.clamp(50.0), 30.0);
        assert_eq!(range.span_ms(), 20.0);
    }
}
