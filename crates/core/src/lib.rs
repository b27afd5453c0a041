//! Core library for the SG Com driver.
//!
//! The crate wraps the SG Com speech-to-animation SDK behind a small set of
//! subsystems: a session facade over the SDK call surface, WAV ingestion and
//! directory discovery, a background tick worker, and the presentation side
//! that advances playback and writes animation nodes onto a rig. The
//! [`Director`] wires them together for a host frame loop.

pub mod audio;
pub mod config;
pub mod director;
pub mod discovery;
pub mod error;
pub mod facade;
pub mod retarget;
pub mod rig;
pub mod sdk;
pub mod timeline;
pub mod worker;

pub use audio::{AudioClip, ClipError};
pub use config::{AppConfig, ExitMode};
pub use director::{Director, FrameReport};
pub use discovery::ClipWatcher;
pub use error::{DriverError, Result, SgComError};
pub use facade::{Engine, LogSink, Player, Session, SessionOptions, TickStatus};
pub use retarget::{ApplyStats, AxisMapping, NodeApplier};
pub use rig::{Rig, RigDescription, Transform};
pub use sdk::{reference::ReferenceSdk, AnimationNode, NodeKind, SgComApi};
pub use timeline::{PlaybackClock, PlaybackSource};
pub use worker::{ExitPolicy, QueueSignal, TickWorker, WorkerOptions, WorkerReport};

#[cfg(feature = "native")]
pub use sdk::native::NativeSdk;
