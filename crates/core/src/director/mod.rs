//! Session orchestration: one engine with its local player, a queue of clips
//! fed from watched directories, a tick worker per clip, and per-frame
//! application of the animation to a rig.

use std::{
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    audio::AudioClip,
    config::{AppConfig, ExitMode},
    discovery::ClipWatcher,
    facade::{Engine, Session},
    retarget::{ApplyStats, NodeApplier},
    rig::Rig,
    sdk::{AnimationType, EngineConfig, EngineId, EngineStatus, SampleRate, SampleType},
    timeline::PlaybackClock,
    worker::{ExitPolicy, QueueSignal, TickWorker, WorkerOptions},
    Result, SgComError,
};

/// Longest stretch of audio fed per `input_audio` call.
const FEED_CHUNK: Duration = Duration::from_secs(1);

/// What happened during one presentation frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub time_ms: f64,
    pub started: bool,
    pub applied: Option<ApplyStats>,
    /// Clip that began playing during this frame.
    pub clip_started: Option<PathBuf>,
}

/// Drives playback for a session.
///
/// Fields drop in declaration order: the worker is joined before the engine
/// goes away, and the engine (with its player) before the session shuts down.
pub struct Director {
    worker: Option<TickWorker>,
    engine: Option<Arc<Engine>>,
    session: Session,
    config: AppConfig,
    character: Arc<[u8]>,
    format: Option<(SampleType, SampleRate)>,
    watcher: ClipWatcher,
    queue: QueueSignal,
    clock: PlaybackClock,
    applier: NodeApplier,
    moods: Receiver<String>,
    status_tx: Arc<Mutex<mpsc::Sender<String>>>,
    last_mood: Option<String>,
    clips_played: usize,
    /// PCM of the current clip that did not fit the engine's input buffer yet.
    pending: Vec<u8>,
}

impl Director {
    pub fn new(session: Session, config: AppConfig, character: Arc<[u8]>) -> Result<Self> {
        let mut watcher = ClipWatcher::new(Duration::from_millis(config.ingest.poll_interval_ms));
        for dir in &config.ingest.watch_dirs {
            watcher.watch(dir)?;
        }

        let (status_tx, moods) = mpsc::channel();
        Ok(Self {
            worker: None,
            engine: None,
            session,
            clock: PlaybackClock::new(config.playback.start_threshold_ms),
            applier: NodeApplier::new(config.playback.axis_mapping),
            config,
            character,
            format: None,
            watcher,
            queue: QueueSignal::new(),
            moods,
            status_tx: Arc::new(Mutex::new(status_tx)),
            last_mood: None,
            clips_played: 0,
            pending: Vec::new(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine.as_ref()
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn watcher(&self) -> &ClipWatcher {
        &self.watcher
    }

    pub fn last_mood(&self) -> Option<&str> {
        self.last_mood.as_deref()
    }

    pub fn clips_played(&self) -> usize {
        self.clips_played
    }

    /// Whether the current clip is still being fed or ticked.
    pub fn is_playing(&self) -> bool {
        !self.pending.is_empty()
            || self
                .worker
                .as_ref()
                .map(|worker| !worker.is_finished())
                .unwrap_or(false)
    }

    /// Plays `initial_clip` if given. The clip file is left on disk.
    pub fn start(&mut self, initial_clip: Option<&Path>) -> Result<bool> {
        match initial_clip {
            Some(path) => self.play_clip(path, false),
            None => Ok(false),
        }
    }

    /// Advances presentation by `delta_seconds`: moves the clock, applies the
    /// current nodes to `rig`, feeds audio the engine had no room for yet,
    /// starts the next queued clip once the current one is done and polls the
    /// watched directories.
    pub fn frame(&mut self, delta_seconds: f32, rig: &mut Rig) -> Result<FrameReport> {
        self.relay_moods();

        let mut report = FrameReport::default();
        if let Some(player) = self.engine.as_ref().and_then(|engine| engine.player()) {
            // failures are logged by the facade; the next frame retries
            if let Ok(started) = self.clock.advance(delta_seconds, player.as_ref()) {
                report.started = started;
                if started {
                    if let Ok(nodes) = player.animation_nodes() {
                        report.applied = Some(self.applier.apply(rig, &nodes));
                    }
                }
            }
            report.time_ms = self.clock.time_ms();
        }

        let worker_done = self
            .worker
            .as_ref()
            .map(TickWorker::is_finished)
            .unwrap_or(true);
        if !self.pending.is_empty() {
            self.continue_clip(worker_done)?;
        } else if worker_done {
            while let Some(path) = self.watcher.pop() {
                if self.play_clip(&path, self.config.ingest.delete_consumed)? {
                    report.clip_started = Some(path);
                    break;
                }
            }
        }

        self.poll_watchers(Instant::now())?;
        Ok(report)
    }

    /// Scans watched directories when the poll interval has elapsed. Returns
    /// the number of newly queued clips.
    pub fn poll_watchers(&mut self, now: Instant) -> Result<usize> {
        let added = self.watcher.poll(now)?;
        self.queue.set(self.watcher.queued());
        Ok(added)
    }

    /// Stops the worker and destroys the engine and its player.
    pub fn end_session(&mut self) -> Result<()> {
        self.finish_worker();
        self.pending.clear();
        if let Some(engine) = self.engine.take() {
            tracing::info!(engine = %engine.id(), "ending session");
        }
        self.format = None;
        self.clock.reset();
        Ok(())
    }

    /// Ends the session and shuts the SDK down.
    pub fn shutdown(mut self) -> Result<()> {
        self.end_session()?;
        let Self { session, .. } = self;
        session.shutdown()
    }

    /// Loads `path`, feeds as much of it as the engine accepts and starts a
    /// worker for it. Clips that cannot be loaded or fed are reported and
    /// skipped.
    fn play_clip(&mut self, path: &Path, consume: bool) -> Result<bool> {
        let clip = match AudioClip::from_path(path) {
            Ok(clip) => clip,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping clip");
                return Ok(false);
            }
        };
        if consume {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to delete consumed clip");
            }
        }

        let rate = match clip.sample_rate() {
            Ok(rate) => rate,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping clip");
                return Ok(false);
            }
        };

        self.finish_worker();
        self.pending.clear();
        let engine = match self.ensure_engine(clip.sample_type(), rate) {
            Ok(engine) => engine,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "no engine for clip");
                return Ok(false);
            }
        };

        let duration_ms = clip.duration().as_millis() as u64;
        self.pending = clip.pcm;
        if let Err(err) = self.top_up(&engine) {
            tracing::warn!(path = %path.display(), error = %err, "failed to feed clip");
            self.pending.clear();
            return Ok(false);
        }

        let worker = TickWorker::spawn(Arc::clone(&engine), self.worker_options())?;
        self.worker = Some(worker);
        self.clips_played += 1;
        tracing::info!(path = %path.display(), duration_ms, "playing clip");
        Ok(true)
    }

    /// Feeds pending audio and restarts the worker when it drained the input
    /// before the rest of the clip arrived.
    fn continue_clip(&mut self, worker_done: bool) -> Result<()> {
        let Some(engine) = self.engine.clone() else {
            self.pending.clear();
            return Ok(());
        };
        if let Err(err) = self.top_up(&engine) {
            tracing::warn!(error = %err, "failed to feed the rest of the clip");
            self.pending.clear();
        }
        if worker_done {
            self.finish_worker();
            self.worker = Some(TickWorker::spawn(engine, self.worker_options())?);
        }
        Ok(())
    }

    /// Moves pending audio into the engine until its input buffer is full.
    /// Returns the number of bytes accepted.
    fn top_up(&mut self, engine: &Engine) -> Result<usize> {
        let chunk = chunk_bytes(engine, self.config.engine.buffer_seconds);
        let mut fed = 0;
        let mut result = Ok(());
        while fed < self.pending.len() {
            let end = (fed + chunk).min(self.pending.len());
            match engine.input_audio(&self.pending[fed..end]) {
                Ok(()) => fed = end,
                Err(err) if err.sdk_code() == Some(SgComError::InputOverrun) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        self.pending.drain(..fed);
        result.map(|()| fed)
    }

    fn worker_options(&self) -> WorkerOptions {
        let exit_policy = match self.config.worker.exit_mode {
            ExitMode::Drained => ExitPolicy::Drained,
            ExitMode::IdleUntilQueued => ExitPolicy::IdleUntilQueued(self.queue.clone()),
        };
        WorkerOptions {
            frame_budget: Duration::from_millis(self.config.worker.frame_budget_ms),
            exit_policy,
            max_consecutive_errors: self.config.worker.max_consecutive_errors,
            ..Default::default()
        }
    }

    fn finish_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
            match worker.join() {
                Ok(report) => tracing::debug!(?report, "tick worker joined"),
                Err(err) => tracing::warn!(error = %err, "tick worker failed"),
            }
        }
    }

    /// Reuses the current engine when the format matches, otherwise replaces
    /// it with one created for the clip's format.
    fn ensure_engine(&mut self, sample_type: SampleType, rate: SampleRate) -> Result<Arc<Engine>> {
        if let (Some(engine), Some(format)) = (&self.engine, self.format) {
            if format == (sample_type, rate) {
                return Ok(Arc::clone(engine));
            }
            tracing::info!(?sample_type, ?rate, "audio format changed, recreating engine");
        }
        self.engine = None;
        self.clock.reset();

        let settings = &self.config.engine;
        let mut config = EngineConfig::new(Arc::clone(&self.character), sample_type, rate);
        config.buffer_seconds = settings.buffer_seconds;
        config.features = settings.features();
        let status_tx = Arc::clone(&self.status_tx);
        config.status = Some(Arc::new(
            move |engine: EngineId, status: EngineStatus, message: &str| match status {
                EngineStatus::MoodChanged => {
                    tracing::info!(%engine, "Mood changed to: {message}");
                    if let Ok(tx) = status_tx.lock() {
                        let _ = tx.send(message.to_string());
                    }
                }
            },
        ));

        let engine = Arc::new(self.session.create_local_pair(&config, AnimationType::Normal)?);
        apply_settings(&engine, &self.config);
        self.engine = Some(Arc::clone(&engine));
        self.format = Some((sample_type, rate));
        Ok(engine)
    }

    fn relay_moods(&mut self) {
        while let Ok(mood) = self.moods.try_recv() {
            self.last_mood = Some(mood);
        }
    }
}

/// Mood, role and controls from the configuration. Rejected values are
/// logged by the facade and otherwise ignored.
fn apply_settings(engine: &Engine, config: &AppConfig) {
    let settings = &config.engine;
    if let Some(mood) = &settings.mood {
        let _ = engine.set_mood(mood);
    }
    let _ = engine.set_role(settings.role);
    for (control, value) in settings.controls.values() {
        let _ = engine.set_control(control, value);
    }
}

/// Bytes per `input_audio` call: whole frames covering at most one second
/// and at most half of the engine's input buffer.
fn chunk_bytes(engine: &Engine, buffer_seconds: f32) -> usize {
    let frame_bytes =
        engine.sample_rate().samples_per_frame() * engine.sample_type().bytes_per_sample();
    let max_frames = (FEED_CHUNK.as_millis() / 10) as usize;
    let buffer_frames = (f64::from(buffer_seconds) * 100.0).floor() as usize;
    frame_bytes * (buffer_frames / 2).clamp(1, max_frames)
}

#[cfg(test)]
mod tests {
    use hound::{SampleFormat, WavSpec, WavWriter};

    use super::*;
    use crate::{
        facade::{LogSink, SessionOptions},
        sdk::{
            reference::{character::CharacterDef, ReferenceSdk},
            LicenseInfo, LogLevel,
        },
    };

    fn write_clip(path: &Path, rate: u32, millis: u32) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        let samples = rate * millis / 1000;
        for i in 0..samples {
            let t = i as f32 / rate as f32;
            let sample = (t * 220.0 * std::f32::consts::TAU).sin() * 12_000.0;
            writer.write_sample(sample as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn director(config: AppConfig) -> (Arc<ReferenceSdk>, Director) {
        let sdk = Arc::new(ReferenceSdk::new());
        let session = Session::initialize(
            sdk.clone(),
            SessionOptions {
                log_level: LogLevel::None,
                log_sink: LogSink::Silent,
                license: LicenseInfo::from_string("test"),
            },
        )
        .unwrap();
        let character: Arc<[u8]> = CharacterDef::demo().to_bytes().into();
        (sdk, Director::new(session, config, character).unwrap())
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.engine.idle = false;
        config.worker.exit_mode = ExitMode::Drained;
        config.worker.frame_budget_ms = 1;
        config
    }

    fn wait_for_worker(director: &Director) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while director.is_playing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn plays_the_initial_clip_and_animates_the_rig() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("hello.wav");
        write_clip(&clip, 16_000, 300);

        let (_sdk, mut director) = director(fast_config());
        assert!(director.start(Some(&clip)).unwrap());
        assert!(clip.exists());
        wait_for_worker(&director);

        let nodes = director
            .engine()
            .and_then(|engine| engine.player())
            .map(|player| player.animation_nodes().unwrap())
            .unwrap();
        let mut rig = Rig::matching(&nodes);

        let mut applied = None;
        for _ in 0..10 {
            let report = director.frame(1.0 / 60.0, &mut rig).unwrap();
            applied = report.applied.or(applied);
        }
        let stats = applied.unwrap();
        assert_eq!(stats.misses, 0);
        assert!(stats.joints > 0);
        assert!(director.clock().time_ms() > 0.0);
    }

    #[test]
    fn queued_clips_play_in_order_and_are_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.ingest.watch_dirs = vec![dir.path().to_path_buf()];
        config.ingest.poll_interval_ms = 0;

        let (_sdk, mut director) = director(config);
        write_clip(&dir.path().join("a.wav"), 16_000, 50);
        write_clip(&dir.path().join("b.wav"), 16_000, 50);
        assert_eq!(director.poll_watchers(Instant::now()).unwrap(), 2);

        let mut rig = Rig::new();
        let first = director.frame(0.016, &mut rig).unwrap();
        assert_eq!(first.clip_started, Some(dir.path().join("a.wav")));
        assert!(!dir.path().join("a.wav").exists());

        wait_for_worker(&director);
        let second = director.frame(0.016, &mut rig).unwrap();
        assert_eq!(second.clip_started, Some(dir.path().join("b.wav")));
        assert_eq!(director.clips_played(), 2);
    }

    #[test]
    fn broken_clips_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.wav");
        std::fs::write(&broken, b"not a wav").unwrap();

        let (_sdk, mut director) = director(fast_config());
        assert!(!director.start(Some(&broken)).unwrap());
        assert!(director.engine().is_none());
    }

    #[test]
    fn format_changes_recreate_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let low = dir.path().join("low.wav");
        let high = dir.path().join("high.wav");
        write_clip(&low, 8_000, 50);
        write_clip(&high, 16_000, 50);

        let (sdk, mut director) = director(fast_config());
        director.start(Some(&low)).unwrap();
        let first = director.engine().unwrap().id();
        wait_for_worker(&director);

        director.start(Some(&high)).unwrap();
        let second = director.engine().unwrap();
        assert_ne!(second.id(), first);
        assert_eq!(second.sample_rate(), SampleRate::Hz16000);
        // one engine and its player
        assert_eq!(sdk.live_handles(), 2);
    }

    #[test]
    fn configured_mood_is_applied_and_relayed() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("mood.wav");
        write_clip(&clip, 16_000, 50);

        let mut config = fast_config();
        config.engine.mood = Some("positive".to_string());
        let (_sdk, mut director) = director(config);
        director.start(Some(&clip)).unwrap();

        assert_eq!(director.engine().unwrap().mood().unwrap(), "positive");
        director.frame(0.0, &mut Rig::new()).unwrap();
        assert_eq!(director.last_mood(), Some("positive"));
    }

    #[test]
    fn clips_longer_than_the_input_buffer_are_fed_across_frames() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("long.wav");
        write_clip(&clip, 16_000, 2_000);

        let mut config = fast_config();
        config.engine.buffer_seconds = 0.5;
        let (_sdk, mut director) = director(config);
        assert!(director.start(Some(&clip)).unwrap());
        assert!(director.is_playing());

        let mut rig = Rig::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while director.is_playing() && Instant::now() < deadline {
            director.frame(0.016, &mut rig).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!director.is_playing());
        assert_eq!(director.clips_played(), 1);

        // every one of the 200 frames reached the player
        let player = director.engine().and_then(|engine| engine.player()).unwrap();
        assert_eq!(player.playable_range().unwrap().max_ms, 1_990.0);
    }

    #[test]
    fn clips_without_a_usable_engine_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("huge.wav");
        write_clip(&clip, 16_000, 100);

        let mut config = fast_config();
        config.engine.buffer_seconds = 1e30;
        let (sdk, mut director) = director(config);
        assert!(!director.start(Some(&clip)).unwrap());
        assert!(director.engine().is_none());
        assert!(!director.is_playing());
        assert_eq!(director.clips_played(), 0);
        assert_eq!(sdk.live_handles(), 0);

        let report = director.frame(0.016, &mut Rig::new()).unwrap();
        assert!(report.clip_started.is_none());
    }

    #[test]
    fn reported_time_holds_at_zero_until_playback_starts() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("late.wav");
        write_clip(&clip, 16_000, 200);

        let mut config = fast_config();
        config.playback.start_threshold_ms = 10_000.0;
        let (_sdk, mut director) = director(config);
        director.start(Some(&clip)).unwrap();
        wait_for_worker(&director);

        let mut rig = Rig::new();
        for _ in 0..5 {
            let report = director.frame(0.1, &mut rig).unwrap();
            assert!(!report.started);
            assert_eq!(report.time_ms, 0.0);
        }
        assert!(!director.clock().is_started());
    }

    #[test]
    fn shutdown_releases_every_handle() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("bye.wav");
        write_clip(&clip, 16_000, 100);

        let mut config = fast_config();
        config.engine.idle = true;
        config.worker.exit_mode = ExitMode::IdleUntilQueued;
        let (sdk, mut director) = director(config);
        director.start(Some(&clip)).unwrap();
        assert!(director.is_playing());

        director.end_session().unwrap();
        assert_eq!(sdk.live_handles(), 0);
        director.shutdown().unwrap();
    }
}
