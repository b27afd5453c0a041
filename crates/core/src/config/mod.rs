use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    facade::LogSink,
    retarget::AxisMapping,
    sdk::{EngineControl, EngineFeatures, EngineRole, LicenseInfo, LogLevel},
    Result,
};

/// Top-level configuration structure for the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sdk: SdkConfig,
    pub engine: EngineSettings,
    pub ingest: IngestConfig,
    pub playback: PlaybackConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&contents)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Character file, resolved against the resources directory when relative.
    pub fn character_path(&self) -> PathBuf {
        if self.engine.character_file.is_absolute() {
            self.engine.character_file.clone()
        } else {
            self.sdk.resources_dir.join(&self.engine.character_file)
        }
    }
}

/// SDK-wide settings used at initialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub log_level: LogLevel,
    /// Append SDK log lines to this file instead of forwarding them to the
    /// application log.
    pub log_file: Option<PathBuf>,
    /// Holds the license and the character file.
    pub resources_dir: PathBuf,
    /// License string used instead of discovery in `resources_dir`.
    pub license: Option<String>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Debug,
            log_file: None,
            resources_dir: PathBuf::from("Resources"),
            license: None,
        }
    }
}

impl SdkConfig {
    pub fn log_sink(&self) -> LogSink {
        match &self.log_file {
            Some(path) => LogSink::File(path.clone()),
            None => LogSink::Tracing,
        }
    }

    pub fn license(&self) -> LicenseInfo {
        match &self.license {
            Some(license) => LicenseInfo::from_string(license.clone()),
            None => LicenseInfo::discover(&self.resources_dir),
        }
    }
}

/// Settings applied to every engine the driver creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub character_file: PathBuf,
    pub buffer_seconds: f32,
    pub idle: bool,
    pub fixed_random_seed: bool,
    /// Mood set after creation; `"auto"` engages automatic detection.
    pub mood: Option<String>,
    pub role: EngineRole,
    pub controls: ControlSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            character_file: PathBuf::from("Avatar.k"),
            buffer_seconds: 200.0,
            idle: true,
            fixed_random_seed: false,
            mood: None,
            role: EngineRole::Speak,
            controls: ControlSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn features(&self) -> EngineFeatures {
        EngineFeatures {
            idle: self.idle,
            fixed_random_seed: self.fixed_random_seed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub scale: f32,
    pub speed: f32,
    pub expression_frequency: f32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            scale: 1.0,
            speed: 1.0,
            expression_frequency: 1.0,
        }
    }
}

impl ControlSettings {
    pub fn values(&self) -> [(EngineControl, f32); 3] {
        [
            (EngineControl::Scale, self.scale),
            (EngineControl::Speed, self.speed),
            (EngineControl::ExpressionFrequency, self.expression_frequency),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Clip played as soon as the session starts.
    pub initial_clip: Option<PathBuf>,
    pub watch_dirs: Vec<PathBuf>,
    pub poll_interval_ms: u64,
    /// Remove discovered clips from disk once loaded.
    pub delete_consumed: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            initial_clip: None,
            watch_dirs: Vec::new(),
            poll_interval_ms: 1_000,
            delete_consumed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub start_threshold_ms: f64,
    pub axis_mapping: AxisMapping,
    /// Presentation rate used by the command line driver.
    pub frame_rate: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_threshold_ms: crate::timeline::DEFAULT_START_THRESHOLD_MS,
            axis_mapping: AxisMapping::default(),
            frame_rate: 60.0,
        }
    }
}

/// When a tick worker stops on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    /// As soon as the input buffer is empty.
    Drained,
    /// Once the input buffer is empty and another clip is waiting.
    #[default]
    IdleUntilQueued,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub frame_budget_ms: u64,
    pub exit_mode: ExitMode,
    pub max_consecutive_errors: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frame_budget_ms: 10,
            exit_mode: ExitMode::default(),
            max_consecutive_errors: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.engine.buffer_seconds, 200.0);
        assert!(config.engine.idle);
        assert!(config.ingest.delete_consumed);
        assert_eq!(config.worker.exit_mode, ExitMode::IdleUntilQueued);
        assert_eq!(config.character_path(), PathBuf::from("Resources/Avatar.k"));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = AppConfig::from_json_str(
            r#"{
                "engine": { "mood": "auto", "role": "listen", "controls": { "speed": 1.5 } },
                "ingest": { "watch_dirs": ["incoming"], "delete_consumed": false },
                "worker": { "exit_mode": "drained" },
                "playback": { "axis_mapping": { "translation": [1, -1, 1] } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.engine.mood.as_deref(), Some("auto"));
        assert_eq!(config.engine.role, EngineRole::Listen);
        assert_eq!(config.engine.controls.speed, 1.5);
        assert_eq!(config.engine.controls.scale, 1.0);
        assert_eq!(config.ingest.watch_dirs, vec![PathBuf::from("incoming")]);
        assert_eq!(config.ingest.poll_interval_ms, 1_000);
        assert_eq!(config.worker.exit_mode, ExitMode::Drained);
        assert_eq!(config.playback.axis_mapping.translation, [1.0, -1.0, 1.0]);
        assert_eq!(
            config.playback.axis_mapping.rotation,
            AxisMapping::default().rotation
        );
    }

    #[test]
    fn survives_a_json_round_trip() {
        let mut config = AppConfig::default();
        config.sdk.log_file = Some(PathBuf::from("logs/sg.txt"));
        let json = config.to_json_string().unwrap();
        assert_eq!(AppConfig::from_json_str(&json).unwrap(), config);
        assert!(matches!(config.sdk.log_sink(), LogSink::File(_)));
    }

    #[test]
    fn rejects_malformed_documents() {
        let err = AppConfig::from_json_str("{ \"engine\": 3 }").unwrap_err();
        assert!(matches!(err, crate::DriverError::Config(_)));
    }
}
