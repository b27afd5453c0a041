use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use sgcom_driver_core::{
    sdk::reference::character::CharacterDef,
    AppConfig, AudioClip, Director, DriverError, Rig, RigDescription, Session, SessionOptions,
    SgComApi,
};
use tracing_subscriber::EnvFilter;

fn main() -> sgcom_driver_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_session(args),
        Commands::Inspect { clip } => run_inspect(&clip),
        Commands::Character { path } => run_character(path.as_deref()),
    }
}

fn run_session(args: RunArgs) -> sgcom_driver_core::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::default(),
    };
    if let Some(clip) = args.clip {
        config.ingest.initial_clip = Some(clip);
    }
    if !args.watch.is_empty() {
        config.ingest.watch_dirs = args.watch;
    }
    if let Some(license) = args.license {
        config.sdk.license = Some(license);
    }
    if let Some(fps) = args.fps {
        config.playback.frame_rate = fps;
    }
    let frame_rate = checked_frame_rate(config.playback.frame_rate)?;

    let character = load_character(&config.character_path());
    let session = Session::initialize(
        backend(),
        SessionOptions {
            log_level: config.sdk.log_level,
            log_sink: config.sdk.log_sink(),
            license: config.sdk.license(),
        },
    )?;
    tracing::info!(version = session.version(), "session ready");

    let mut rig = match &args.rig {
        Some(path) => Some(Rig::from_description(&RigDescription::from_path(path)?)?),
        None => None,
    };

    let initial = config.ingest.initial_clip.clone();
    let mut director = Director::new(session, config, character)?;
    director.start(initial.as_deref())?;

    let frame = Duration::from_secs_f32(1.0 / frame_rate);
    let frames = (args.seconds * frame_rate).ceil() as u64;
    let mut summary = Summary::default();
    let mut scratch = Rig::new();

    for _ in 0..frames {
        let started = Instant::now();
        if rig.is_none() {
            rig = matching_rig(&director);
        }
        let report = director.frame(1.0 / frame_rate, rig.as_mut().unwrap_or(&mut scratch))?;
        if let Some(path) = &report.clip_started {
            tracing::info!(path = %path.display(), "clip started");
        }
        if let Some(stats) = report.applied {
            summary.applied_frames += 1;
            summary.misses += stats.misses;
        }
        summary.time_ms = report.time_ms;

        let elapsed = started.elapsed();
        if elapsed < frame {
            std::thread::sleep(frame - elapsed);
        }
    }

    println!("clips played:   {}", director.clips_played());
    println!("playback time:  {:.0} ms", summary.time_ms);
    println!("applied frames: {}", summary.applied_frames);
    println!("missing targets: {}", summary.misses);
    if let Some(mood) = director.last_mood() {
        println!("last mood:      {mood}");
    }
    if let Some(rig) = &rig {
        for (name, weight) in rig.morphs() {
            println!("  morph {name:<24} {weight:>7.3}");
        }
    }

    director.shutdown()
}

fn run_inspect(path: &Path) -> sgcom_driver_core::Result<()> {
    let clip = AudioClip::from_path(path)?;
    println!("path:         {}", path.display());
    println!("sample rate:  {} Hz", clip.sample_rate);
    println!("sample type:  {:?}", clip.sample_type());
    println!("samples:      {}", clip.sample_count());
    println!("duration:     {:.3} s", clip.duration().as_secs_f64());
    match clip.sample_rate() {
        Ok(rate) => println!("frames:       {}", clip.sample_count() / rate.samples_per_frame()),
        Err(err) => println!("not playable: {err}"),
    }
    Ok(())
}

fn run_character(path: Option<&Path>) -> sgcom_driver_core::Result<()> {
    let character = match path {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            CharacterDef::from_bytes(&bytes).map_err(DriverError::msg)?
        }
        None => CharacterDef::demo(),
    };

    if !character.name.is_empty() {
        println!("{}", character.name);
    }
    for node in &character.nodes {
        println!("{:<24} {:?} [{}]", node.name, node.kind, node.channels.join(", "));
    }
    println!("moods: {}", character.moods.join(", "));
    Ok(())
}

fn checked_frame_rate(frame_rate: f32) -> sgcom_driver_core::Result<f32> {
    if !(frame_rate.is_finite() && frame_rate > 0.0)
        || Duration::try_from_secs_f32(1.0 / frame_rate).is_err()
    {
        return Err(DriverError::msg(format!(
            "frame rate must be a positive number, got {frame_rate}"
        )));
    }
    Ok(frame_rate)
}

#[cfg(not(feature = "native"))]
fn backend() -> Arc<dyn SgComApi> {
    Arc::new(sgcom_driver_core::ReferenceSdk::new())
}

#[cfg(feature = "native")]
fn backend() -> Arc<dyn SgComApi> {
    Arc::new(sgcom_driver_core::NativeSdk::new())
}

/// Reads the character file, falling back to the built-in demo character.
fn load_character(path: &Path) -> Arc<[u8]> {
    match std::fs::read(path) {
        Ok(bytes) => bytes.into(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "using the demo character");
            CharacterDef::demo().to_bytes().into()
        }
    }
}

/// Rig shaped after the player's current nodes, once it has any.
fn matching_rig(director: &Director) -> Option<Rig> {
    let player = director.engine()?.player()?;
    let nodes = player.animation_nodes().ok()?;
    Some(Rig::matching(&nodes))
}

#[derive(Debug, Default)]
struct Summary {
    time_ms: f64,
    applied_frames: u64,
    misses: usize,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives SG Com speech animation from WAV clips", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play clips through an engine and apply the animation to a rig.
    Run(RunArgs),
    /// Print the format of a WAV clip.
    Inspect {
        /// Path to the clip.
        clip: PathBuf,
    },
    /// Print the nodes of a character description.
    Character {
        /// Character file; the built-in demo character when omitted.
        path: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Clip played on start, overriding the configuration.
    #[arg(long)]
    clip: Option<PathBuf>,
    /// Directory watched for new clips. Repeatable.
    #[arg(short, long)]
    watch: Vec<PathBuf>,
    /// License string passed to the SDK.
    #[arg(long)]
    license: Option<String>,
    /// JSON rig description; a rig matching the character's nodes otherwise.
    #[arg(long)]
    rig: Option<PathBuf>,
    /// Seconds of presentation frames to run.
    #[arg(short, long, default_value_t = 5.0)]
    seconds: f32,
    /// Presentation frame rate.
    #[arg(long)]
    fps: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_must_be_finite_and_positive() {
        assert_eq!(checked_frame_rate(60.0).unwrap(), 60.0);
        assert_eq!(checked_frame_rate(0.5).unwrap(), 0.5);
        for bad in [0.0, -30.0, 1e-30, f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            assert!(checked_frame_rate(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn fps_flag_parses_into_run_args() {
        let cli = Cli::try_parse_from(["sgcom-driver", "run", "--fps", "NaN"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        assert!(checked_frame_rate(args.fps.unwrap()).is_err());
    }
}
