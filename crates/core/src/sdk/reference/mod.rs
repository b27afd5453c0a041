//! In-process implementation of the SG Com call contract.
//!
//! [`ReferenceSdk`] honours everything the facade relies on: bounded input
//! buffers, one 10 ms frame per tick, rejection of overlapping ticks, a player
//! buffer with a clamped playback cursor, broadcast packets with ordering
//! checks, moods, roles and controls. The animation values themselves come
//! from a small loudness/brightness heuristic in [`motion`].

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::sdk::{
    AnimationNode, EngineConfig, EngineControl, EngineFeatures, EngineId, EngineRole,
    EngineStatus, LicenseInfo, LogCallback, LogLevel, NodeKind, PlayableRange, PlayerConfig,
    PlayerId, SampleRate, SampleType, SgComApi, TickOutcome, BroadcastCallback, StatusCallback,
    AUX_RATE_HZ, FRAME_MS,
};
use crate::SgComError;

pub mod analysis;
pub mod character;
pub mod motion;
pub mod packet;

use analysis::FrameAnalyzer;
use character::CharacterDef;
use motion::{fill_channels, MotionModel, MotionParams};
use packet::FramePacket;

const VERSION: &str = "1.2.0-reference";
const VERSION_NUMBER: u32 = 1_002_000;
const AUTO_MOOD: &str = "auto";
/// Longest input or output buffer accepted at creation.
const MAX_BUFFER_SECONDS: f32 = 3_600.0;

/// Whole 10 ms frames held by a buffer of `seconds`.
fn buffer_frames(seconds: f32) -> Result<usize, SgComError> {
    if !seconds.is_finite() || seconds <= 0.0 || seconds > MAX_BUFFER_SECONDS {
        return Err(SgComError::InvalidParam);
    }
    Ok((seconds * 100.0).round().max(1.0) as usize)
}

/// Reference backend for the [`SgComApi`] contract.
#[derive(Default)]
pub struct ReferenceSdk {
    registry: Mutex<Registry>,
    exception: Mutex<String>,
}

#[derive(Default)]
struct Registry {
    initialized: bool,
    shut_down: bool,
    level: LogLevel,
    logger: Option<LogCallback>,
    next_id: u64,
    engines: HashMap<u64, Arc<EngineSlot>>,
    players: HashMap<u64, Arc<PlayerSlot>>,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct EngineSlot {
    id: EngineId,
    ticking: AtomicBool,
    state: Mutex<EngineState>,
    status: Option<StatusCallback>,
    broadcast: Option<BroadcastCallback>,
    local_player: Option<Arc<PlayerSlot>>,
}

struct EngineState {
    character: CharacterDef,
    sample_type: SampleType,
    frame_bytes: usize,
    input: VecDeque<u8>,
    input_capacity: usize,
    aux: VecDeque<f32>,
    aux_capacity: usize,
    analyzer: FrameAnalyzer,
    motion: MotionModel,
    features: EngineFeatures,
    next_frame: u64,
    sequence: u32,
    mood: String,
    auto_mood: bool,
    role: EngineRole,
    controls: HashMap<EngineControl, f32>,
    frame: Vec<u8>,
    values: Vec<f32>,
}

/// What a single engine step produced, delivered after the state lock drops.
struct StepOutput {
    outcome: TickOutcome,
    frame: Option<FramePacket>,
    mood_changed: Option<String>,
}

impl EngineState {
    fn new(
        character: CharacterDef,
        sample_type: SampleType,
        sample_rate: SampleRate,
        buffer_seconds: f32,
        features: EngineFeatures,
    ) -> Result<Self, SgComError> {
        let frame_bytes = sample_rate.samples_per_frame() * sample_type.bytes_per_sample();
        let frames = buffer_frames(buffer_seconds)?;
        let input_capacity = frames
            .checked_mul(frame_bytes)
            .ok_or(SgComError::InvalidParam)?;
        let aux_capacity = frames * AUX_RATE_HZ as usize / 100;
        let mood = default_mood(&character);

        Ok(Self {
            character,
            sample_type,
            frame_bytes,
            input: VecDeque::new(),
            input_capacity,
            aux: VecDeque::new(),
            aux_capacity,
            analyzer: FrameAnalyzer::new(sample_type),
            motion: MotionModel::new(features.fixed_random_seed),
            features,
            next_frame: 0,
            sequence: 0,
            mood,
            auto_mood: false,
            role: EngineRole::Speak,
            controls: EngineControl::ALL.iter().map(|c| (*c, 1.0)).collect(),
            frame: Vec::new(),
            values: Vec::new(),
        })
    }

    fn control(&self, control: EngineControl) -> f32 {
        self.controls.get(&control).copied().unwrap_or(1.0)
    }

    fn remaining_frames(&self) -> u32 {
        (self.input.len() / self.frame_bytes) as u32
    }

    /// Moves one frame through the pipeline, or synthesizes an idle frame when
    /// the input is empty and idle generation is enabled.
    fn step(&mut self) -> StepOutput {
        let has_frame = self.input.len() >= self.frame_bytes;
        if !has_frame && !self.features.idle {
            return StepOutput {
                outcome: TickOutcome {
                    processed_frames: 0,
                    remaining_frames: self.remaining_frames(),
                },
                frame: None,
                mood_changed: None,
            };
        }

        let features = if has_frame {
            self.frame.clear();
            self.frame.extend(self.input.drain(..self.frame_bytes));
            Some(self.analyzer.analyse(&self.frame))
        } else {
            None
        };
        let aux = self.aux.pop_front();

        let mut mood_changed = None;
        if self.auto_mood {
            if let Some(features) = features {
                let frequency = self.control(EngineControl::ExpressionFrequency);
                if let Some(detected) = self.motion.detect_mood(features, frequency) {
                    if detected != self.mood && self.character.has_mood(detected) {
                        self.mood = detected.to_string();
                        mood_changed = Some(self.mood.clone());
                    }
                }
            }
        }

        let params = MotionParams {
            scale: self.control(EngineControl::Scale),
            speed: self.control(EngineControl::Speed),
            expression_frequency: self.control(EngineControl::ExpressionFrequency),
            role: self.role,
            mood: &self.mood,
        };
        let motion = self.motion.step(features, aux, params);
        fill_channels(&self.character, &motion, &mut self.values);

        let packet = FramePacket {
            sequence: self.sequence,
            time_ms: self.next_frame as f64 * FRAME_MS,
            values: self.values.clone(),
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.next_frame += 1;

        StepOutput {
            outcome: TickOutcome {
                processed_frames: 1,
                remaining_frames: self.remaining_frames(),
            },
            frame: Some(packet),
            mood_changed,
        }
    }

    /// Clears buffers and per-session state. The frame clock keeps running so
    /// that attached players never see time go backwards.
    fn reset(&mut self) {
        self.input.clear();
        self.aux.clear();
        self.motion = MotionModel::new(self.features.fixed_random_seed);
        self.mood = default_mood(&self.character);
        self.auto_mood = false;
        self.role = EngineRole::Speak;
        for value in self.controls.values_mut() {
            *value = 1.0;
        }
    }
}

fn default_mood(character: &CharacterDef) -> String {
    if character.has_mood("neutral") {
        "neutral".to_string()
    } else {
        character.moods.first().cloned().unwrap_or_default()
    }
}

struct PlayerSlot {
    state: Mutex<PlayerState>,
}

struct NodeLayout {
    name: String,
    kind: NodeKind,
    channel_names: Vec<String>,
}

struct BufferedFrame {
    time_ms: f64,
    values: Vec<f32>,
}

struct PlayerState {
    layout: Vec<NodeLayout>,
    channel_count: usize,
    frames: VecDeque<BufferedFrame>,
    capacity: usize,
    current: Vec<f32>,
    has_current: bool,
    last_sequence: Option<u32>,
    attached: bool,
}

impl PlayerState {
    fn new(character: &CharacterDef, buffer_seconds: f32) -> Result<Self, SgComError> {
        let capacity = buffer_frames(buffer_seconds)?;
        let layout = character
            .nodes
            .iter()
            .map(|node| NodeLayout {
                name: node.name.clone(),
                kind: node.kind.into(),
                channel_names: node.channels.clone(),
            })
            .collect();

        Ok(Self {
            layout,
            channel_count: character.channel_count(),
            frames: VecDeque::new(),
            capacity,
            current: Vec::new(),
            has_current: false,
            last_sequence: None,
            attached: false,
        })
    }

    /// Binds the player to a new engine. The engine's packet stream starts
    /// over, so frames and ordering from a previous engine are dropped.
    fn attach(&mut self) {
        self.attached = true;
        self.frames.clear();
        self.current.clear();
        self.has_current = false;
        self.last_sequence = None;
    }

    fn push(&mut self, packet: FramePacket) -> Result<(), SgComError> {
        if packet.values.len() != self.channel_count {
            return Err(SgComError::InvalidPacket);
        }
        if let Some(last) = self.last_sequence {
            if packet.sequence <= last {
                return Err(SgComError::OutOfOrderPacketDiscarded);
            }
        }
        if let Some(back) = self.frames.back() {
            if packet.time_ms <= back.time_ms {
                return Err(SgComError::OutOfOrderPacketDiscarded);
            }
        }

        self.last_sequence = Some(packet.sequence);
        self.frames.push_back(BufferedFrame {
            time_ms: packet.time_ms,
            values: packet.values,
        });
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
        Ok(())
    }

    fn range(&self) -> PlayableRange {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => PlayableRange {
                min_ms: first.time_ms,
                max_ms: last.time_ms,
            },
            _ => PlayableRange::default(),
        }
    }

    fn update(&mut self, time_ms: f64) -> Result<f64, SgComError> {
        if !time_ms.is_finite() {
            return Err(SgComError::InvalidParam);
        }
        if self.frames.is_empty() {
            return Err(SgComError::InputUnderrun);
        }

        let clamped = self.range().clamp(time_ms);
        let next = self.frames.partition_point(|frame| frame.time_ms <= clamped);
        self.current.clear();
        match next {
            0 => self.current.extend_from_slice(&self.frames[0].values),
            n if n == self.frames.len() => self.current.extend_from_slice(&self.frames[n - 1].values),
            n => {
                let (a, b) = (&self.frames[n - 1], &self.frames[n]);
                let t = ((clamped - a.time_ms) / (b.time_ms - a.time_ms)) as f32;
                self.current
                    .extend(a.values.iter().zip(&b.values).map(|(x, y)| x + (y - x) * t));
            }
        }
        self.has_current = true;
        Ok(clamped)
    }

    fn nodes(&self) -> Result<Vec<AnimationNode>, SgComError> {
        let values: &[f32] = if self.has_current {
            &self.current
        } else {
            match self.frames.front() {
                Some(first) => &first.values,
                None => return Err(SgComError::InputUnderrun),
            }
        };

        let mut offset = 0;
        Ok(self
            .layout
            .iter()
            .map(|node| {
                let count = node.channel_names.len();
                let node_values = values[offset..offset + count].to_vec();
                offset += count;
                AnimationNode {
                    name: node.name.clone(),
                    kind: node.kind,
                    channel_names: node.channel_names.clone(),
                    values: node_values,
                }
            })
            .collect())
    }
}

/// Clears the tick flag of an engine when dropped.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps an engine marked as mid-tick until dropped.
///
/// Returned by [`ReferenceSdk::hold_tick`]; lets callers exercise the
/// [`SgComError::TickInProgress`] path deterministically.
pub struct HeldTick {
    slot: Arc<EngineSlot>,
}

impl Drop for HeldTick {
    fn drop(&mut self) {
        self.slot.ticking.store(false, Ordering::Release);
    }
}

impl ReferenceSdk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `engine` as ticking until the returned guard is dropped.
    pub fn hold_tick(&self, engine: EngineId) -> Result<HeldTick, SgComError> {
        let slot = self.engine(engine)?;
        if slot
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SgComError::TickInProgress);
        }
        Ok(HeldTick { slot })
    }

    /// Number of engines and players currently alive.
    pub fn live_handles(&self) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.engines.len() + registry.players.len())
            .unwrap_or(0)
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>, SgComError> {
        self.registry
            .lock()
            .map_err(|_| self.raise("handle registry has been poisoned"))
    }

    fn initialized_registry(&self) -> Result<MutexGuard<'_, Registry>, SgComError> {
        let registry = self.registry()?;
        if !registry.initialized {
            return Err(SgComError::Undefined);
        }
        Ok(registry)
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, SgComError> {
        mutex
            .lock()
            .map_err(|_| self.raise(&format!("{what} has been poisoned")))
    }

    /// Records exception text and returns the catch-all code.
    fn raise(&self, text: &str) -> SgComError {
        if let Ok(mut slot) = self.exception.lock() {
            *slot = text.to_string();
        }
        SgComError::Exception
    }

    fn log(&self, level: LogLevel, message: &str) {
        let logger = match self.registry.lock() {
            Ok(registry) if registry.level >= level && level != LogLevel::None => {
                registry.logger.clone()
            }
            _ => None,
        };
        if let Some(logger) = logger {
            logger(&format!("[SG_COM] {message}\n"));
        }
    }

    fn engine(&self, engine: EngineId) -> Result<Arc<EngineSlot>, SgComError> {
        self.initialized_registry()?
            .engines
            .get(&engine.0)
            .cloned()
            .ok_or(SgComError::InvalidHandle)
    }

    fn player(&self, player: PlayerId) -> Result<Arc<PlayerSlot>, SgComError> {
        self.initialized_registry()?
            .players
            .get(&player.0)
            .cloned()
            .ok_or(SgComError::InvalidHandle)
    }

    fn parse_character(&self, bytes: &[u8]) -> Result<CharacterDef, SgComError> {
        if bytes.is_empty() {
            return Err(SgComError::InvalidParam);
        }
        CharacterDef::from_bytes(bytes).map_err(|err| self.raise(&err))
    }

    fn with_engine<T>(
        &self,
        engine: EngineId,
        f: impl FnOnce(&mut EngineState) -> Result<T, SgComError>,
    ) -> Result<T, SgComError> {
        let slot = self.engine(engine)?;
        let mut state = self.lock(&slot.state, "engine state")?;
        f(&mut state)
    }

    fn with_player<T>(
        &self,
        player: PlayerId,
        f: impl FnOnce(&mut PlayerState) -> Result<T, SgComError>,
    ) -> Result<T, SgComError> {
        let slot = self.player(player)?;
        let mut state = self.lock(&slot.state, "player state")?;
        f(&mut state)
    }
}

impl SgComApi for ReferenceSdk {
    fn initialize(
        &self,
        level: LogLevel,
        logger: Option<LogCallback>,
        license: &LicenseInfo,
    ) -> Result<(), SgComError> {
        {
            let mut registry = self.registry()?;
            if registry.initialized || registry.shut_down {
                return Err(SgComError::Undefined);
            }
            if license.data.trim().is_empty() {
                return Err(SgComError::InvalidLicense);
            }
            registry.initialized = true;
            registry.level = level;
            registry.logger = logger;
        }
        self.log(LogLevel::Debug, &format!("initialised version {VERSION}"));
        Ok(())
    }

    fn shutdown(&self) -> Result<(), SgComError> {
        let leaked = {
            let mut registry = self.initialized_registry()?;
            let leaked = registry.engines.len() + registry.players.len();
            registry.engines.clear();
            registry.players.clear();
            leaked
        };
        if leaked > 0 {
            self.log(
                LogLevel::Error,
                &format!("shutdown with {leaked} live handle(s)"),
            );
        }
        self.log(LogLevel::Debug, "shut down");

        let mut registry = self.registry()?;
        registry.initialized = false;
        registry.shut_down = true;
        registry.logger = None;
        Ok(())
    }

    fn version_string(&self) -> String {
        VERSION.to_string()
    }

    fn version_number(&self) -> u32 {
        VERSION_NUMBER
    }

    fn exception_text(&self) -> String {
        self.exception
            .lock()
            .map(|text| text.clone())
            .unwrap_or_default()
    }

    fn create_engine(&self, config: &EngineConfig) -> Result<EngineId, SgComError> {
        let character = self.parse_character(&config.character)?;
        let channel_count = character.channel_count();
        let state = EngineState::new(
            character,
            config.sample_type,
            config.sample_rate,
            config.buffer_seconds,
            config.features,
        )?;

        let local_player = match config.local_player {
            Some(player) => {
                let slot = self.player(player)?;
                {
                    let mut player_state = self.lock(&slot.state, "player state")?;
                    if player_state.attached || player_state.channel_count != channel_count {
                        return Err(SgComError::InvalidParam);
                    }
                    player_state.attach();
                }
                Some(slot)
            }
            None => None,
        };

        let id = {
            let mut registry = self.initialized_registry()?;
            let id = EngineId(registry.allocate_id());
            registry.engines.insert(
                id.0,
                Arc::new(EngineSlot {
                    id,
                    ticking: AtomicBool::new(false),
                    state: Mutex::new(state),
                    status: config.status.clone(),
                    broadcast: config.broadcast.clone(),
                    local_player,
                }),
            );
            id
        };
        self.log(LogLevel::Debug, &format!("created {id}"));
        Ok(id)
    }

    fn destroy_engine(&self, engine: EngineId) -> Result<(), SgComError> {
        let slot = {
            let mut registry = self.initialized_registry()?;
            let slot = registry
                .engines
                .get(&engine.0)
                .cloned()
                .ok_or(SgComError::InvalidHandle)?;
            if slot.ticking.load(Ordering::Acquire) {
                return Err(SgComError::TickInProgress);
            }
            registry.engines.remove(&engine.0);
            slot
        };

        if let Some(player) = &slot.local_player {
            self.lock(&player.state, "player state")?.attached = false;
        }
        self.log(LogLevel::Debug, &format!("destroyed {engine}"));
        Ok(())
    }

    fn input_audio(&self, engine: EngineId, data: &[u8]) -> Result<(), SgComError> {
        self.with_engine(engine, |state| {
            if data.len() % state.sample_type.bytes_per_sample() != 0 {
                return Err(SgComError::InvalidParam);
            }
            if data.len() > state.input_capacity - state.input.len() {
                return Err(SgComError::InputOverrun);
            }
            state.input.extend(data.iter().copied());
            Ok(())
        })
    }

    fn input_aux_data(&self, engine: EngineId, data: &[u8]) -> Result<(), SgComError> {
        self.with_engine(engine, |state| {
            if data.len() % 4 != 0 {
                return Err(SgComError::InvalidParam);
            }
            if data.len() / 4 > state.aux_capacity - state.aux.len() {
                return Err(SgComError::InputOverrun);
            }
            state.aux.extend(
                data.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
            Ok(())
        })
    }

    fn process_tick(&self, engine: EngineId) -> Result<TickOutcome, SgComError> {
        let slot = self.engine(engine)?;
        let _tick = TickGuard::acquire(&slot.ticking).ok_or(SgComError::TickInProgress)?;

        let output = {
            let mut state = self.lock(&slot.state, "engine state")?;
            state.step()
        };

        if let Some(packet) = output.frame {
            if let Some(broadcast) = &slot.broadcast {
                broadcast(slot.id, &packet.encode());
            }
            if let Some(player) = &slot.local_player {
                self.lock(&player.state, "player state")?.push(packet)?;
            }
        }
        if let Some(mood) = output.mood_changed {
            self.log(LogLevel::Debug, &format!("{engine} mood changed to {mood}"));
            if let Some(status) = &slot.status {
                status(slot.id, EngineStatus::MoodChanged, &mood);
            }
        }

        Ok(output.outcome)
    }

    fn reset(&self, engine: EngineId) -> Result<(), SgComError> {
        self.with_engine(engine, |state| {
            state.reset();
            Ok(())
        })
    }

    fn set_mood(&self, engine: EngineId, mood: &str) -> Result<(), SgComError> {
        let slot = self.engine(engine)?;
        let changed = {
            let mut state = self.lock(&slot.state, "engine state")?;
            if mood == AUTO_MOOD {
                if !state.character.supports_auto_mood() {
                    return Err(SgComError::InvalidParam);
                }
                state.auto_mood = true;
                None
            } else {
                if !state.character.has_mood(mood) {
                    return Err(SgComError::InvalidParam);
                }
                state.auto_mood = false;
                if state.mood == mood {
                    None
                } else {
                    state.mood = mood.to_string();
                    Some(state.mood.clone())
                }
            }
        };

        if let (Some(mood), Some(status)) = (changed, &slot.status) {
            status(slot.id, EngineStatus::MoodChanged, &mood);
        }
        Ok(())
    }

    fn mood(&self, engine: EngineId) -> Result<String, SgComError> {
        self.with_engine(engine, |state| Ok(state.mood.clone()))
    }

    fn mood_list(&self, engine: EngineId) -> Result<Vec<String>, SgComError> {
        self.with_engine(engine, |state| Ok(state.character.moods.clone()))
    }

    fn set_role(&self, engine: EngineId, role: EngineRole) -> Result<(), SgComError> {
        self.with_engine(engine, |state| {
            state.role = role;
            Ok(())
        })
    }

    fn role(&self, engine: EngineId) -> Result<EngineRole, SgComError> {
        self.with_engine(engine, |state| Ok(state.role))
    }

    fn engine_control(&self, engine: EngineId, control: EngineControl) -> Result<f32, SgComError> {
        self.with_engine(engine, |state| Ok(state.control(control)))
    }

    fn set_engine_control(
        &self,
        engine: EngineId,
        control: EngineControl,
        value: f32,
    ) -> Result<(), SgComError> {
        if !value.is_finite() || value < 0.0 {
            return Err(SgComError::InvalidParam);
        }
        self.with_engine(engine, |state| {
            state.controls.insert(control, value);
            Ok(())
        })
    }

    fn create_player(&self, config: &PlayerConfig) -> Result<PlayerId, SgComError> {
        let character = self.parse_character(&config.character)?;
        let state = PlayerState::new(&character, config.buffer_seconds)?;

        let id = {
            let mut registry = self.initialized_registry()?;
            let id = PlayerId(registry.allocate_id());
            registry.players.insert(
                id.0,
                Arc::new(PlayerSlot {
                    state: Mutex::new(state),
                }),
            );
            id
        };
        self.log(LogLevel::Debug, &format!("created {id}"));
        Ok(id)
    }

    fn destroy_player(&self, player: PlayerId) -> Result<(), SgComError> {
        let mut registry = self.initialized_registry()?;
        let slot = registry
            .players
            .get(&player.0)
            .cloned()
            .ok_or(SgComError::InvalidHandle)?;
        // An attached player outlives its engine.
        if self.lock(&slot.state, "player state")?.attached {
            return Err(SgComError::InvalidParam);
        }
        registry.players.remove(&player.0);
        Ok(())
    }

    fn receive_packet(&self, player: PlayerId, packet: &[u8]) -> Result<(), SgComError> {
        let packet = FramePacket::decode(packet)?;
        self.with_player(player, |state| {
            if state.attached {
                return Err(SgComError::InvalidParam);
            }
            state.push(packet)
        })
    }

    fn animation_nodes(&self, player: PlayerId) -> Result<Vec<AnimationNode>, SgComError> {
        self.with_player(player, |state| state.nodes())
    }

    fn update_animation(&self, player: PlayerId, time_ms: f64) -> Result<f64, SgComError> {
        self.with_player(player, |state| state.update(time_ms))
    }

    fn playable_range(&self, player: PlayerId) -> Result<PlayableRange, SgComError> {
        self.with_player(player, |state| Ok(state.range()))
    }
}
