//! Caller-facing wrapper over an [`SgComApi`] backend.
//!
//! A [`Session`] replaces the global manager of the C surface: it initialises
//! the backend once, hands out scoped [`Engine`] and [`Player`] handles, and is
//! consumed by [`Session::shutdown`]. Handles destroy themselves on drop. An
//! engine created together with its local player keeps that player alive, so
//! the engine is always destroyed first.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    sdk::{
        AnimationNode, AnimationType, EngineConfig, EngineControl, EngineId, EngineRole,
        LicenseInfo, LogCallback, LogLevel, PlayableRange, PlayerConfig, PlayerId, SampleRate,
        SampleType, SgComApi, TickOutcome, FRAME_DURATION,
    },
    DriverError, Result, SgComError,
};

/// Attempts made to destroy an engine that is still mid-tick.
const DESTROY_ATTEMPTS: u32 = 10;

/// Destination of the SDK's own log lines.
#[derive(Clone, Default)]
pub enum LogSink {
    /// Forward every line to `tracing` under the `sgcom` target.
    #[default]
    Tracing,
    /// Append every line to a file.
    File(PathBuf),
    Callback(LogCallback),
    /// Do not register a logger.
    Silent,
}

impl LogSink {
    /// Timestamped log file name inside `dir`.
    pub fn default_file(dir: &Path) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        dir.join(format!("SG_COM_log_{stamp}.txt"))
    }

    fn into_callback(self) -> Result<Option<LogCallback>> {
        let callback: LogCallback = match self {
            Self::Tracing => Arc::new(|line: &str| {
                tracing::debug!(target: "sgcom", "{}", line.trim_end());
            }),
            Self::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                let file = Mutex::new(file);
                Arc::new(move |line: &str| {
                    if let Ok(mut file) = file.lock() {
                        let _ = file.write_all(line.as_bytes());
                    }
                })
            }
            Self::Callback(callback) => callback,
            Self::Silent => return Ok(None),
        };
        Ok(Some(callback))
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tracing => f.write_str("Tracing"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Silent => f.write_str("Silent"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub log_level: LogLevel,
    pub log_sink: LogSink,
    pub license: LicenseInfo,
}

/// Logs a failed SDK call and converts it into a [`DriverError`].
///
/// Exception codes come with detail text that is only available right after
/// the failing call, so it is fetched here.
pub(crate) fn report(api: &dyn SgComApi, call: &'static str, code: SgComError) -> DriverError {
    if code == SgComError::Exception {
        tracing::error!(call, exception = %api.exception_text(), "sdk raised an exception");
    } else if code.is_transient() {
        tracing::debug!(call, error = ?code, "sdk call deferred");
    } else {
        tracing::warn!(call, error = ?code, "sdk call failed");
    }
    DriverError::sdk(call, code)
}

/// An initialised SDK backend.
pub struct Session {
    api: Arc<dyn SgComApi>,
    live: Arc<AtomicUsize>,
    version: String,
    closed: bool,
}

impl Session {
    /// Initialises `api`. A backend accepts this exactly once.
    pub fn initialize(api: Arc<dyn SgComApi>, options: SessionOptions) -> Result<Self> {
        tracing::debug!(sink = ?options.log_sink, level = ?options.log_level, "initialising sdk");
        let logger = options.log_sink.into_callback()?;
        api.initialize(options.log_level, logger, &options.license)
            .map_err(|code| report(api.as_ref(), "initialize", code))?;

        let version = api.version_string();
        tracing::info!(%version, "initialised SG Com");
        Ok(Self {
            api,
            live: Arc::new(AtomicUsize::new(0)),
            version,
            closed: false,
        })
    }

    pub fn api(&self) -> &Arc<dyn SgComApi> {
        &self.api
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn version_number(&self) -> u32 {
        self.api.version_number()
    }

    /// Engines and players created by this session that are still alive.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn create_player(&self, config: &PlayerConfig) -> Result<Player> {
        let id = self
            .api
            .create_player(config)
            .map_err(|code| report(self.api.as_ref(), "create_player", code))?;
        tracing::debug!(player = %id, "created player");
        Ok(Player {
            api: Arc::clone(&self.api),
            id,
            _live: Handle::track(&self.live),
        })
    }

    /// Creates an engine without a local player. A `local_player` set in
    /// `config` is passed through untouched; the caller keeps that player
    /// alive for longer than the engine.
    pub fn create_engine(&self, config: &EngineConfig) -> Result<Engine> {
        self.spawn_engine(config, None)
    }

    /// Creates a player for `config.character` and an engine that feeds it.
    pub fn create_local_pair(
        &self,
        config: &EngineConfig,
        animation_type: AnimationType,
    ) -> Result<Engine> {
        let player = Arc::new(self.create_player(&PlayerConfig {
            character: Arc::clone(&config.character),
            animation_type,
            buffer_seconds: config.buffer_seconds,
        })?);

        let mut config = config.clone();
        config.local_player = Some(player.id());
        self.spawn_engine(&config, Some(player))
    }

    fn spawn_engine(&self, config: &EngineConfig, player: Option<Arc<Player>>) -> Result<Engine> {
        let id = self
            .api
            .create_engine(config)
            .map_err(|code| report(self.api.as_ref(), "create_engine", code))?;
        tracing::debug!(engine = %id, ?config, "created engine");
        Ok(Engine {
            api: Arc::clone(&self.api),
            id,
            sample_type: config.sample_type,
            sample_rate: config.sample_rate,
            player,
            _live: Handle::track(&self.live),
        })
    }

    /// Shuts the backend down. Handles still alive at this point are leaked
    /// by the SDK.
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let live = self.live_handles();
        if live > 0 {
            tracing::warn!(live, "shutting down with live handles");
        }
        self.api
            .shutdown()
            .map_err(|code| report(self.api.as_ref(), "shutdown", code))?;
        tracing::info!("SG Com shut down");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Counts a live handle for its session.
struct Handle(Arc<AtomicUsize>);

impl Handle {
    fn track(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(live))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Scoped player handle.
pub struct Player {
    api: Arc<dyn SgComApi>,
    id: PlayerId,
    _live: Handle,
}

impl Player {
    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn playable_range(&self) -> Result<PlayableRange> {
        self.api
            .playable_range(self.id)
            .map_err(|code| report(self.api.as_ref(), "playable_range", code))
    }

    /// Moves playback towards `time_ms` and returns the clamped time actually
    /// used.
    pub fn update_animation(&self, time_ms: f64) -> Result<f64> {
        self.api
            .update_animation(self.id, time_ms)
            .map_err(|code| report(self.api.as_ref(), "update_animation", code))
    }

    /// Owned copy of the current node snapshot.
    pub fn animation_nodes(&self) -> Result<Vec<AnimationNode>> {
        self.api
            .animation_nodes(self.id)
            .map_err(|code| report(self.api.as_ref(), "animation_nodes", code))
    }

    /// Feeds a packet broadcast by a remote engine.
    pub fn receive_packet(&self, packet: &[u8]) -> Result<()> {
        self.api
            .receive_packet(self.id, packet)
            .map_err(|code| report(self.api.as_ref(), "receive_packet", code))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        match self.api.destroy_player(self.id) {
            Ok(()) => tracing::debug!(player = %self.id, "destroyed player"),
            Err(code) => {
                report(self.api.as_ref(), "destroy_player", code);
            }
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player").field("id", &self.id).finish()
    }
}

/// Result of one [`Engine::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// Another tick on the same engine was still running. Retry next frame.
    Busy,
    Advanced(TickOutcome),
}

impl TickStatus {
    pub fn remaining_frames(&self) -> Option<u32> {
        match self {
            Self::Busy => None,
            Self::Advanced(outcome) => Some(outcome.remaining_frames),
        }
    }
}

/// Scoped engine handle.
pub struct Engine {
    api: Arc<dyn SgComApi>,
    id: EngineId,
    sample_type: SampleType,
    sample_rate: SampleRate,
    player: Option<Arc<Player>>,
    _live: Handle,
}

impl Engine {
    pub fn id(&self) -> EngineId {
        self.id
    }

    /// The local player fed by this engine, if it owns one.
    pub fn player(&self) -> Option<&Arc<Player>> {
        self.player.as_ref()
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Appends raw little-endian PCM in the engine's sample type.
    pub fn input_audio(&self, data: &[u8]) -> Result<()> {
        self.api
            .input_audio(self.id, data)
            .map_err(|code| report(self.api.as_ref(), "input_audio", code))
    }

    pub fn input_aux_data(&self, data: &[u8]) -> Result<()> {
        self.api
            .input_aux_data(self.id, data)
            .map_err(|code| report(self.api.as_ref(), "input_aux_data", code))
    }

    /// Processes at most one frame. Overlapping ticks are reported as
    /// [`TickStatus::Busy`] rather than as an error.
    pub fn tick(&self) -> Result<TickStatus> {
        match self.api.process_tick(self.id) {
            Ok(outcome) => Ok(TickStatus::Advanced(outcome)),
            Err(SgComError::TickInProgress) => {
                tracing::trace!(engine = %self.id, "tick already in progress");
                Ok(TickStatus::Busy)
            }
            Err(code) => Err(report(self.api.as_ref(), "process_tick", code)),
        }
    }

    pub fn reset(&self) -> Result<()> {
        self.api
            .reset(self.id)
            .map_err(|code| report(self.api.as_ref(), "reset", code))
    }

    /// `"auto"` turns on automatic mood detection.
    pub fn set_mood(&self, mood: &str) -> Result<()> {
        self.api
            .set_mood(self.id, mood)
            .map_err(|code| report(self.api.as_ref(), "set_mood", code))
    }

    pub fn mood(&self) -> Result<String> {
        self.api
            .mood(self.id)
            .map_err(|code| report(self.api.as_ref(), "mood", code))
    }

    pub fn mood_list(&self) -> Result<Vec<String>> {
        self.api
            .mood_list(self.id)
            .map_err(|code| report(self.api.as_ref(), "mood_list", code))
    }

    pub fn set_role(&self, role: EngineRole) -> Result<()> {
        self.api
            .set_role(self.id, role)
            .map_err(|code| report(self.api.as_ref(), "set_role", code))
    }

    pub fn role(&self) -> Result<EngineRole> {
        self.api
            .role(self.id)
            .map_err(|code| report(self.api.as_ref(), "role", code))
    }

    pub fn control(&self, control: EngineControl) -> Result<f32> {
        self.api
            .engine_control(self.id, control)
            .map_err(|code| report(self.api.as_ref(), "engine_control", code))
    }

    pub fn set_control(&self, control: EngineControl, value: f32) -> Result<()> {
        self.api
            .set_engine_control(self.id, control, value)
            .map_err(|code| report(self.api.as_ref(), "set_engine_control", code))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.api.destroy_engine(self.id) {
                Ok(()) => {
                    tracing::debug!(engine = %self.id, "destroyed engine");
                    break;
                }
                Err(SgComError::TickInProgress) if attempts < DESTROY_ATTEMPTS => {
                    std::thread::sleep(FRAME_DURATION)
                }
                Err(code) => {
                    report(self.api.as_ref(), "destroy_engine", code);
                    break;
                }
            }
        }
        // `player` drops after this, so the engine is gone before its player.
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("sample_type", &self.sample_type)
            .field("sample_rate", &self.sample_rate)
            .field("player", &self.player.as_ref().map(|player| player.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::sdk::{reference::ReferenceSdk, reference::character::CharacterDef, EngineFeatures};

    use super::*;

    fn options() -> SessionOptions {
        SessionOptions {
            log_level: LogLevel::Error,
            log_sink: LogSink::Silent,
            license: LicenseInfo::from_string("test-license"),
        }
    }

    fn engine_config() -> EngineConfig {
        let character: Arc<[u8]> = CharacterDef::demo().to_bytes().into();
        EngineConfig::new(character, SampleType::Int16, SampleRate::Hz16000)
    }

    #[test]
    fn create_destroy_loop_leaves_no_live_handles() {
        let sdk = Arc::new(ReferenceSdk::new());
        let session = Session::initialize(sdk.clone(), options()).unwrap();
        let character: Arc<[u8]> = CharacterDef::demo().to_bytes().into();

        let mut round = 0usize;
        for sample_type in [SampleType::Int16, SampleType::Int32, SampleType::Float32] {
            for rate in SampleRate::ALL {
                for (idle, fixed_random_seed) in [(false, false), (true, false), (false, true), (true, true)] {
                    for buffer_seconds in [0.01, 0.25, 0.5, 1.0, 7.5, 200.0] {
                        let mut config = EngineConfig::new(Arc::clone(&character), sample_type, rate);
                        config.buffer_seconds = buffer_seconds;
                        config.features = EngineFeatures { idle, fixed_random_seed };

                        let pair = session.create_local_pair(&config, AnimationType::Normal).unwrap();
                        let standalone = session.create_engine(&config).unwrap();
                        let player = session
                            .create_player(&PlayerConfig {
                                character: Arc::clone(&character),
                                animation_type: AnimationType::Normal,
                                buffer_seconds,
                            })
                            .unwrap();
                        assert_eq!(session.live_handles(), 4);

                        let frame = vec![0u8; rate.samples_per_frame() * sample_type.bytes_per_sample()];
                        pair.input_audio(&frame).unwrap();
                        assert!(matches!(pair.tick().unwrap(), TickStatus::Advanced(_)));

                        match round % 3 {
                            0 => {
                                drop(pair);
                                drop(standalone);
                                drop(player);
                            }
                            1 => {
                                drop(player);
                                drop(standalone);
                                drop(pair);
                            }
                            _ => {
                                // the local player outlives its engine
                                let local = Arc::clone(pair.player().unwrap());
                                drop(standalone);
                                drop(pair);
                                assert_eq!(session.live_handles(), 2);
                                drop(local);
                                drop(player);
                            }
                        }
                        assert_eq!(
                            session.live_handles(),
                            0,
                            "{sample_type:?} {rate:?} idle={idle} seed={fixed_random_seed} {buffer_seconds}s"
                        );
                        round += 1;
                    }
                }
            }
        }

        assert_eq!(sdk.live_handles(), 0);
        session.shutdown().unwrap();
    }

    #[test]
    fn overlapping_ticks_are_busy_not_errors() {
        let sdk = Arc::new(ReferenceSdk::new());
        let session = Session::initialize(sdk.clone(), options()).unwrap();
        let engine = session
            .create_local_pair(&engine_config(), AnimationType::Normal)
            .unwrap();
        engine.input_audio(&vec![0u8; 2 * 320 * 2]).unwrap();

        let held = sdk.hold_tick(engine.id()).unwrap();
        assert_eq!(engine.tick().unwrap(), TickStatus::Busy);
        drop(held);

        let status = engine.tick().unwrap();
        assert_eq!(
            status,
            TickStatus::Advanced(TickOutcome {
                processed_frames: 1,
                remaining_frames: 1,
            })
        );
        assert_eq!(status.remaining_frames(), Some(1));
    }

    #[test]
    fn failing_calls_keep_their_code() {
        let sdk = Arc::new(ReferenceSdk::new());
        let session = Session::initialize(sdk, options()).unwrap();
        let engine = session
            .create_local_pair(&engine_config(), AnimationType::Normal)
            .unwrap();

        let err = engine.set_mood("furious").unwrap_err();
        assert_eq!(err.sdk_code(), Some(SgComError::InvalidParam));

        let err = engine.input_audio(&[0u8; 3]).unwrap_err();
        assert_eq!(err.sdk_code(), Some(SgComError::InvalidParam));

        let player = engine.player().unwrap();
        let err = player.animation_nodes().unwrap_err();
        assert_eq!(err.sdk_code(), Some(SgComError::InputUnderrun));
    }

    #[test]
    fn backend_initialises_only_once() {
        let sdk = Arc::new(ReferenceSdk::new());
        let _session = Session::initialize(sdk.clone(), options()).unwrap();

        let err = Session::initialize(sdk, options()).err().unwrap();
        assert_eq!(err.sdk_code(), Some(SgComError::Undefined));
    }

    #[test]
    fn empty_license_is_rejected() {
        let sdk = Arc::new(ReferenceSdk::new());
        let err = Session::initialize(sdk, SessionOptions::default()).err().unwrap();
        assert_eq!(err.sdk_code(), Some(SgComError::InvalidLicense));
    }

    #[test]
    fn file_sink_appends_sdk_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = LogSink::default_file(dir.path());
        let sdk = Arc::new(ReferenceSdk::new());
        let session = Session::initialize(
            sdk,
            SessionOptions {
                log_level: LogLevel::Debug,
                log_sink: LogSink::File(path.clone()),
                ..options()
            },
        )
        .unwrap();
        drop(session.create_player(&PlayerConfig {
            character: engine_config().character,
            animation_type: AnimationType::Normal,
            buffer_seconds: 1.0,
        }));
        session.shutdown().unwrap();

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.lines().count() >= 2);
        assert!(log.lines().all(|line| line.starts_with("[SG_COM]")));
    }

    #[test]
    fn standalone_engines_leave_their_player_alone() {
        let sdk = Arc::new(ReferenceSdk::new());
        let session = Session::initialize(sdk.clone(), options()).unwrap();
        let engine = session.create_engine(&engine_config()).unwrap();
        assert!(engine.player().is_none());
        assert_eq!(engine.role().unwrap(), EngineRole::Speak);
        drop(engine);
        assert_eq!(sdk.live_handles(), 0);
    }
}
