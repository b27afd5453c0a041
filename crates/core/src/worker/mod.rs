use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    facade::{Engine, TickStatus},
    sdk::FRAME_DURATION,
    DriverError, Result,
};

/// Shared count of clips waiting to be played.
#[derive(Debug, Clone, Default)]
pub struct QueueSignal(Arc<AtomicUsize>);

impl QueueSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, queued: usize) {
        self.0.store(queued, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) > 0
    }
}

/// When the worker leaves its loop without being stopped.
#[derive(Debug, Clone)]
pub enum ExitPolicy {
    /// Once a tick reports no remaining input.
    Drained,
    /// Once a tick reports no remaining input while a clip is queued. Until
    /// then the engine keeps ticking, which lets it synthesize idle motion.
    IdleUntilQueued(QueueSignal),
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub frame_budget: Duration,
    pub exit_policy: ExitPolicy,
    /// Consecutive failed ticks after which the worker gives up.
    pub max_consecutive_errors: u32,
    pub thread_name: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            frame_budget: FRAME_DURATION,
            exit_policy: ExitPolicy::Drained,
            max_consecutive_errors: 100,
            thread_name: "sgcom-tick".to_string(),
        }
    }
}

/// Totals gathered by a worker over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub ticks: u64,
    /// Ticks rejected because another tick was running.
    pub busy: u64,
    pub errors: u64,
    pub frames_processed: u64,
    pub last_remaining: Option<u32>,
}

/// Ticks an engine on a dedicated thread, one frame per budget.
pub struct TickWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<WorkerReport>>>,
}

impl TickWorker {
    pub fn spawn(engine: Arc<Engine>, options: WorkerOptions) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(options.thread_name.clone())
            .spawn(move || run(&engine, &flag, &options))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Asks the worker to leave after its current frame.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Waits for the worker thread without stopping it first.
    pub fn join(mut self) -> Result<WorkerReport> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<WorkerReport> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| DriverError::msg("tick worker panicked"))?,
            None => Ok(WorkerReport::default()),
        }
    }
}

impl Drop for TickWorker {
    fn drop(&mut self) {
        self.stop();
        if let Err(err) = self.join_inner() {
            tracing::warn!(error = %err, "tick worker ended with an error");
        }
    }
}

fn run(engine: &Engine, running: &AtomicBool, options: &WorkerOptions) -> Result<WorkerReport> {
    tracing::debug!(engine = %engine.id(), "tick worker started");
    let mut report = WorkerReport::default();
    let mut consecutive_errors = 0;

    while running.load(Ordering::Acquire) {
        let started = Instant::now();
        let remaining = match engine.tick() {
            Ok(TickStatus::Advanced(outcome)) => {
                consecutive_errors = 0;
                report.ticks += 1;
                report.frames_processed += u64::from(outcome.processed_frames);
                report.last_remaining = Some(outcome.remaining_frames);
                Some(outcome.remaining_frames)
            }
            Ok(TickStatus::Busy) => {
                report.busy += 1;
                None
            }
            Err(err) => {
                consecutive_errors += 1;
                report.errors += 1;
                if consecutive_errors >= options.max_consecutive_errors {
                    tracing::error!(engine = %engine.id(), errors = consecutive_errors, "tick worker giving up");
                    return Err(err);
                }
                None
            }
        };

        let elapsed = started.elapsed();
        if elapsed < options.frame_budget {
            std::thread::sleep(options.frame_budget - elapsed);
        }

        if remaining == Some(0) && should_exit(&options.exit_policy) {
            break;
        }
    }

    tracing::debug!(engine = %engine.id(), ?report, "tick worker finished");
    Ok(report)
}

fn should_exit(policy: &ExitPolicy) -> bool {
    match policy {
        ExitPolicy::Drained => true,
        ExitPolicy::IdleUntilQueued(queue) => queue.is_pending(),
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        facade::{LogSink, Session, SessionOptions},
        sdk::{
            reference::{character::CharacterDef, ReferenceSdk},
            AnimationType, EngineConfig, LicenseInfo, LogLevel, SampleRate, SampleType,
        },
    };

    use super::*;

    fn session() -> (Arc<ReferenceSdk>, Session) {
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
        (sdk, session)
    }

    fn engine(session: &Session, idle: bool) -> Arc<Engine> {
        let mut config = EngineConfig::new(
            CharacterDef::demo().to_bytes().into(),
            SampleType::Int16,
            SampleRate::Hz8000,
        );
        config.features.idle = idle;
        Arc::new(session.create_local_pair(&config, AnimationType::Normal).unwrap())
    }

    fn fast(exit_policy: ExitPolicy) -> WorkerOptions {
        WorkerOptions {
            frame_budget: Duration::from_millis(1),
            exit_policy,
            ..Default::default()
        }
    }

    #[test]
    fn drains_the_input_and_exits() {
        let (_sdk, session) = session();
        let engine = engine(&session, false);
        // 8 kHz, 16-bit: 160 bytes per frame
        engine.input_audio(&vec![0u8; 160 * 5]).unwrap();

        let worker = TickWorker::spawn(Arc::clone(&engine), fast(ExitPolicy::Drained)).unwrap();
        let report = worker.join().unwrap();
        assert_eq!(report.frames_processed, 5);
        assert_eq!(report.last_remaining, Some(0));
        assert_eq!(report.ticks, 5);
    }

    #[test]
    fn idles_until_a_clip_is_queued() {
        let (_sdk, session) = session();
        let engine = engine(&session, true);
        let queue = QueueSignal::new();

        let worker = TickWorker::spawn(
            Arc::clone(&engine),
            fast(ExitPolicy::IdleUntilQueued(queue.clone())),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!worker.is_finished());

        queue.set(1);
        let report = worker.join().unwrap();
        assert!(report.ticks >= 2);
        assert_eq!(report.last_remaining, Some(0));
    }

    #[test]
    fn stop_ends_an_idle_worker() {
        let (_sdk, session) = session();
        let engine = engine(&session, true);
        let worker = TickWorker::spawn(
            Arc::clone(&engine),
            fast(ExitPolicy::IdleUntilQueued(QueueSignal::new())),
        )
        .unwrap();

        worker.stop();
        let report = worker.join().unwrap();
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn busy_ticks_are_counted_not_fatal() {
        let (sdk, session) = session();
        let engine = engine(&session, false);
        engine.input_audio(&vec![0u8; 160 * 2]).unwrap();

        let held = sdk.hold_tick(engine.id()).unwrap();
        let worker = TickWorker::spawn(Arc::clone(&engine), fast(ExitPolicy::Drained)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        drop(held);

        let report = worker.join().unwrap();
        assert!(report.busy > 0);
        assert_eq!(report.frames_processed, 2);
    }

    #[test]
    fn gives_up_after_repeated_errors() {
        let (_sdk, session) = session();
        let engine = engine(&session, false);
        let id = engine.id();
        session.api().destroy_engine(id).unwrap();

        let options = WorkerOptions {
            max_consecutive_errors: 3,
            ..fast(ExitPolicy::Drained)
        };
        let err = TickWorker::spawn(Arc::clone(&engine), options)
            .unwrap()
            .join()
            .unwrap_err();
        assert_eq!(err.sdk_code(), Some(crate::SgComError::InvalidHandle));
    }
}
