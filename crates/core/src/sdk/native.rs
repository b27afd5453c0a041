//! [`SgComApi`] over the proprietary `SG_Com` shared library.
//!
//! The library keeps global state, so a process should hold a single
//! [`NativeSdk`]. Raw handles never leave this module: callers see the same
//! [`EngineId`]/[`PlayerId`] values as with any other backend, and node
//! snapshots are copied into owned values before the call returns.

use std::{
    collections::HashMap,
    ffi::{CStr, CString},
    os::raw::{c_char, c_int, c_void},
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use super::sys;
use crate::sdk::{
    AnimationNode, AnimationType, BroadcastCallback, EngineConfig, EngineControl, EngineId,
    EngineRole, EngineStatus, LicenseInfo, LogCallback, LogLevel, NodeKind, PlayableRange,
    PlayerConfig, PlayerId, SampleRate, SampleType, SgComApi, StatusCallback, TickOutcome,
};
use crate::SgComError;

const MOOD_BUFFER: usize = 256;
const MOOD_LIST_BUFFER: usize = 4096;

/// Logger registered with the library; its callback carries no user data.
static LOGGER: Mutex<Option<LogCallback>> = Mutex::new(None);
/// Set between a successful initialize and the matching shutdown.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Claims the library for one initialize call. The library must not be
/// initialised twice, whichever `NativeSdk` value asks.
fn claim_initialization() -> Result<(), SgComError> {
    INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| SgComError::Undefined)
}

fn release_initialization() {
    INITIALIZED.store(false, Ordering::Release);
}

/// Raw handle owned by the library.
struct Raw<T>(*mut T);

impl<T> Clone for Raw<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Raw<T> {}

// Handles are opaque tokens; the library synchronises access to the objects
// behind them and reports overlapping ticks itself.
unsafe impl<T> Send for Raw<T> {}
unsafe impl<T> Sync for Raw<T> {}

/// Passed to the library as `custom_engine_data`.
struct CallbackContext {
    id: EngineId,
    status: Option<StatusCallback>,
    broadcast: Option<BroadcastCallback>,
}

struct EngineEntry {
    handle: Raw<sys::SgComEngine>,
    // boxed so that the address handed to the library stays put
    _context: Box<CallbackContext>,
    _character: Arc<[u8]>,
}

struct PlayerEntry {
    handle: Raw<sys::SgComPlayer>,
    _character: Arc<[u8]>,
}

/// Backend linked against `SG_Com`.
#[derive(Default)]
pub struct NativeSdk {
    engines: Mutex<HashMap<u64, EngineEntry>>,
    players: Mutex<HashMap<u64, PlayerEntry>>,
    next_id: AtomicU64,
}

impl NativeSdk {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn engine(&self, engine: EngineId) -> Result<Raw<sys::SgComEngine>, SgComError> {
        self.engines
            .lock()
            .map_err(|_| SgComError::Exception)?
            .get(&engine.0)
            .map(|entry| entry.handle)
            .ok_or(SgComError::InvalidHandle)
    }

    fn player(&self, player: PlayerId) -> Result<Raw<sys::SgComPlayer>, SgComError> {
        self.players
            .lock()
            .map_err(|_| SgComError::Exception)?
            .get(&player.0)
            .map(|entry| entry.handle)
            .ok_or(SgComError::InvalidHandle)
    }
}

fn check(code: c_int) -> Result<(), SgComError> {
    SgComError::check(code)
}

fn c_string(text: &str) -> Result<CString, SgComError> {
    CString::new(text).map_err(|_| SgComError::InvalidParam)
}

fn byte_len(bytes: &[u8]) -> Result<sys::SgSize, SgComError> {
    sys::SgSize::try_from(bytes.len()).map_err(|_| SgComError::InvalidParam)
}

/// Copies a possibly-null C string.
unsafe fn lossy(text: *const c_char) -> String {
    if text.is_null() {
        String::new()
    } else {
        CStr::from_ptr(text).to_string_lossy().into_owned()
    }
}

fn sample_type_code(sample_type: SampleType) -> c_int {
    match sample_type {
        SampleType::Int16 => sys::SG_AUDIO_INT_16,
        SampleType::Int32 => sys::SG_AUDIO_INT_32,
        SampleType::Float32 => sys::SG_AUDIO_FLOAT_32,
    }
}

fn sample_rate_code(rate: SampleRate) -> c_int {
    match rate {
        SampleRate::Hz8000 => sys::SG_AUDIO_8_KHZ,
        SampleRate::Hz12000 => sys::SG_AUDIO_12_KHZ,
        SampleRate::Hz16000 => sys::SG_AUDIO_16_KHZ,
        SampleRate::Hz24000 => sys::SG_AUDIO_24_KHZ,
        SampleRate::Hz32000 => sys::SG_AUDIO_32_KHZ,
        SampleRate::Hz44100 => sys::SG_AUDIO_44_1_KHZ,
        SampleRate::Hz48000 => sys::SG_AUDIO_48_KHZ,
    }
}

fn log_level_code(level: LogLevel) -> c_int {
    match level {
        LogLevel::None => sys::SG_LOGLEVEL_NONE,
        LogLevel::Error => sys::SG_LOGLEVEL_ERROR,
        LogLevel::Debug => sys::SG_LOGLEVEL_DEBUG,
    }
}

fn animation_type_code(animation_type: AnimationType) -> c_int {
    match animation_type {
        AnimationType::Normal => sys::SG_NORMAL_ANIMATION,
        AnimationType::Baked => sys::SG_BAKED_ANIMATION,
    }
}

fn control_code(control: EngineControl) -> c_int {
    match control {
        EngineControl::Scale => sys::SG_COM_CTRL_SCALE,
        EngineControl::Speed => sys::SG_COM_CTRL_SPEED,
        EngineControl::ExpressionFrequency => sys::SG_COM_CTRL_EXPRESSION_FREQ,
    }
}

fn role_code(role: EngineRole) -> c_int {
    match role {
        EngineRole::Speak => sys::SG_COM_ROLE_SPEAK,
        EngineRole::Listen => sys::SG_COM_ROLE_LISTEN,
    }
}

fn role_from_code(code: c_int) -> Result<EngineRole, SgComError> {
    match code {
        sys::SG_COM_ROLE_SPEAK => Ok(EngineRole::Speak),
        sys::SG_COM_ROLE_LISTEN => Ok(EngineRole::Listen),
        _ => Err(SgComError::Undefined),
    }
}

/// Splits the library's mood list text into names.
fn split_mood_list(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c == ';' || c == '\n')
        .map(str::trim)
        .filter(|mood| !mood.is_empty())
        .map(str::to_string)
        .collect()
}

unsafe extern "C" fn log_trampoline(message: *const c_char) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let text = lossy(message);
        let logger = LOGGER.lock().ok().and_then(|logger| logger.clone());
        if let Some(logger) = logger {
            logger(&text);
        }
    }));
}

unsafe extern "C" fn status_trampoline(
    _engine: sys::SgComEngineHandle,
    status: c_int,
    message: *const c_char,
    data: *mut c_void,
) {
    if data.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let context = &*(data as *const CallbackContext);
        let Some(callback) = &context.status else {
            return;
        };
        if status == sys::SG_COM_STATUS_MOOD_CHANGED {
            callback(context.id, EngineStatus::MoodChanged, &lossy(message));
        } else {
            tracing::debug!(engine = %context.id, status, "unhandled engine status");
        }
    }));
}

unsafe extern "C" fn broadcast_trampoline(
    _engine: sys::SgComEngineHandle,
    packet: *mut c_char,
    packet_bytes: sys::SgSize,
    data: *mut c_void,
) {
    if data.is_null() || packet.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let context = &*(data as *const CallbackContext);
        if let Some(callback) = &context.broadcast {
            let bytes = std::slice::from_raw_parts(packet as *const u8, packet_bytes as usize);
            callback(context.id, bytes);
        }
    }));
}

/// Copies one library-owned node into an owned value.
unsafe fn copy_node(node: &sys::SgAnimationNode) -> AnimationNode {
    let count = node.num_channels as usize;
    let channel_names = if node.channel_names.is_null() {
        vec![String::new(); count]
    } else {
        std::slice::from_raw_parts(node.channel_names, count)
            .iter()
            .map(|name| lossy(*name))
            .collect()
    };
    let values = if node.channel_values.is_null() {
        vec![0.0; count]
    } else {
        std::slice::from_raw_parts(node.channel_values, count).to_vec()
    };

    AnimationNode {
        name: lossy(node.name),
        kind: NodeKind::from_raw(node.node_type),
        channel_names,
        values,
    }
}

impl SgComApi for NativeSdk {
    fn initialize(
        &self,
        level: LogLevel,
        logger: Option<LogCallback>,
        license: &LicenseInfo,
    ) -> Result<(), SgComError> {
        let data = c_string(&license.data)?;
        let unique_id = license.unique_id.as_deref().map(c_string).transpose()?;
        let custom_data = license.custom_data.as_deref().map(c_string).transpose()?;
        claim_initialization()?;

        let callback: sys::SgLoggingCallback = if logger.is_some() {
            Some(log_trampoline)
        } else {
            None
        };
        if let Ok(mut slot) = LOGGER.lock() {
            *slot = logger;
        }

        let result = check(unsafe {
            sys::SG_COM_Initialize(
                log_level_code(level),
                callback,
                data.as_ptr(),
                unique_id.as_ref().map_or(ptr::null(), |id| id.as_ptr()),
                custom_data.as_ref().map_or(ptr::null(), |custom| custom.as_ptr()),
            )
        });
        if result.is_err() {
            release_initialization();
            if let Ok(mut slot) = LOGGER.lock() {
                *slot = None;
            }
        }
        result
    }

    fn shutdown(&self) -> Result<(), SgComError> {
        if !INITIALIZED.load(Ordering::Acquire) {
            return Err(SgComError::Undefined);
        }
        let result = check(unsafe { sys::SG_COM_Shutdown() });
        release_initialization();
        if let Ok(mut engines) = self.engines.lock() {
            engines.clear();
        }
        if let Ok(mut players) = self.players.lock() {
            players.clear();
        }
        if let Ok(mut slot) = LOGGER.lock() {
            *slot = None;
        }
        result
    }

    fn version_string(&self) -> String {
        unsafe { lossy(sys::SG_COM_GetVersionString()) }
    }

    fn version_number(&self) -> u32 {
        unsafe { sys::SG_COM_GetVersionNumber() }
    }

    fn exception_text(&self) -> String {
        unsafe { lossy(sys::SG_COM_GetExceptionText()) }
    }

    fn create_engine(&self, config: &EngineConfig) -> Result<EngineId, SgComError> {
        let local_player = match config.local_player {
            Some(player) => self.player(player)?.0,
            None => ptr::null_mut(),
        };

        let id = EngineId(self.allocate_id());
        let context = Box::new(CallbackContext {
            id,
            status: config.status.clone(),
            broadcast: config.broadcast.clone(),
        });
        let raw_config = sys::SgComEngineConfig {
            character_file_in_memory: config.character.as_ptr() as *mut u8,
            character_file_bytes: byte_len(&config.character)?,
            audio_sample_type: sample_type_code(config.sample_type),
            audio_sample_rate: sample_rate_code(config.sample_rate),
            local_player,
            engine_broadcast_callback: if config.broadcast.is_some() {
                Some(broadcast_trampoline)
            } else {
                None
            },
            engine_status_callback: if config.status.is_some() {
                Some(status_trampoline)
            } else {
                None
            },
            buffer_sec: config.buffer_seconds,
            flag: config.features.bits() as c_int,
            custom_engine_data: &*context as *const CallbackContext as *mut c_void,
        };

        let mut handle: sys::SgComEngineHandle = ptr::null_mut();
        check(unsafe { sys::SG_COM_CreateEngine(&raw_config, &mut handle) })?;
        if handle.is_null() {
            return Err(SgComError::InvalidHandle);
        }

        self.engines
            .lock()
            .map_err(|_| SgComError::Exception)?
            .insert(
                id.0,
                EngineEntry {
                    handle: Raw(handle),
                    _context: context,
                    _character: Arc::clone(&config.character),
                },
            );
        Ok(id)
    }

    fn destroy_engine(&self, engine: EngineId) -> Result<(), SgComError> {
        let handle = self.engine(engine)?;
        check(unsafe { sys::SG_COM_DestroyEngine(handle.0) })?;
        self.engines
            .lock()
            .map_err(|_| SgComError::Exception)?
            .remove(&engine.0);
        Ok(())
    }

    fn input_audio(&self, engine: EngineId, data: &[u8]) -> Result<(), SgComError> {
        let handle = self.engine(engine)?;
        let len = byte_len(data)?;
        check(unsafe { sys::SG_COM_InputAudio(handle.0, data.as_ptr() as *const c_void, len) })
    }

    fn input_aux_data(&self, engine: EngineId, data: &[u8]) -> Result<(), SgComError> {
        let handle = self.engine(engine)?;
        let len = byte_len(data)?;
        check(unsafe { sys::SG_COM_InputAuxData(handle.0, data.as_ptr() as *const c_void, len) })
    }

    fn process_tick(&self, engine: EngineId) -> Result<TickOutcome, SgComError> {
        let handle = self.engine(engine)?;
        let mut processed: c_int = 0;
        let mut remaining: c_int = 0;
        check(unsafe { sys::SG_COM_ProcessTick(handle.0, &mut processed, &mut remaining) })?;
        Ok(TickOutcome {
            processed_frames: processed.max(0) as u32,
            remaining_frames: remaining.max(0) as u32,
        })
    }

    fn reset(&self, engine: EngineId) -> Result<(), SgComError> {
        let handle = self.engine(engine)?;
        check(unsafe { sys::SG_COM_Reset(handle.0) })
    }

    fn set_mood(&self, engine: EngineId, mood: &str) -> Result<(), SgComError> {
        let handle = self.engine(engine)?;
        let mood = c_string(mood)?;
        check(unsafe { sys::SG_COM_SetMood(handle.0, mood.as_ptr()) })
    }

    fn mood(&self, engine: EngineId) -> Result<String, SgComError> {
        let handle = self.engine(engine)?;
        let mut buffer = vec![0 as c_char; MOOD_BUFFER];
        check(unsafe {
            sys::SG_COM_GetMood(handle.0, buffer.as_mut_ptr(), MOOD_BUFFER as sys::SgSize)
        })?;
        buffer[MOOD_BUFFER - 1] = 0;
        Ok(unsafe { lossy(buffer.as_ptr()) })
    }

    fn mood_list(&self, engine: EngineId) -> Result<Vec<String>, SgComError> {
        let handle = self.engine(engine)?;
        let mut buffer = vec![0 as c_char; MOOD_LIST_BUFFER];
        check(unsafe {
            sys::SG_COM_GetMoodList(handle.0, buffer.as_mut_ptr(), MOOD_LIST_BUFFER as sys::SgSize)
        })?;
        buffer[MOOD_LIST_BUFFER - 1] = 0;
        Ok(split_mood_list(&unsafe { lossy(buffer.as_ptr()) }))
    }

    fn set_role(&self, engine: EngineId, role: EngineRole) -> Result<(), SgComError> {
        let handle = self.engine(engine)?;
        check(unsafe { sys::SG_COM_SetRole(handle.0, role_code(role)) })
    }

    fn role(&self, engine: EngineId) -> Result<EngineRole, SgComError> {
        let handle = self.engine(engine)?;
        let mut role: c_int = 0;
        check(unsafe { sys::SG_COM_GetRole(handle.0, &mut role) })?;
        role_from_code(role)
    }

    fn engine_control(&self, engine: EngineId, control: EngineControl) -> Result<f32, SgComError> {
        let handle = self.engine(engine)?;
        let mut value = 0.0f32;
        check(unsafe { sys::SG_COM_GetEngineControl(handle.0, control_code(control), &mut value) })?;
        Ok(value)
    }

    fn set_engine_control(
        &self,
        engine: EngineId,
        control: EngineControl,
        value: f32,
    ) -> Result<(), SgComError> {
        let handle = self.engine(engine)?;
        check(unsafe { sys::SG_COM_SetEngineControl(handle.0, control_code(control), value) })
    }

    fn create_player(&self, config: &PlayerConfig) -> Result<PlayerId, SgComError> {
        let raw_config = sys::SgComPlayerConfig {
            character_file_in_memory: config.character.as_ptr() as *mut u8,
            character_file_bytes: byte_len(&config.character)?,
            animation_type: animation_type_code(config.animation_type),
            buffer_sec: config.buffer_seconds,
        };

        let mut handle: sys::SgComPlayerHandle = ptr::null_mut();
        check(unsafe { sys::SG_COM_CreatePlayer(&raw_config, &mut handle) })?;
        if handle.is_null() {
            return Err(SgComError::InvalidHandle);
        }

        let id = PlayerId(self.allocate_id());
        self.players
            .lock()
            .map_err(|_| SgComError::Exception)?
            .insert(
                id.0,
                PlayerEntry {
                    handle: Raw(handle),
                    _character: Arc::clone(&config.character),
                },
            );
        Ok(id)
    }

    fn destroy_player(&self, player: PlayerId) -> Result<(), SgComError> {
        let handle = self.player(player)?;
        check(unsafe { sys::SG_COM_DestroyPlayer(handle.0) })?;
        self.players
            .lock()
            .map_err(|_| SgComError::Exception)?
            .remove(&player.0);
        Ok(())
    }

    fn receive_packet(&self, player: PlayerId, packet: &[u8]) -> Result<(), SgComError> {
        let handle = self.player(player)?;
        let len = byte_len(packet)?;
        check(unsafe {
            sys::SG_COM_ReceivePacket(handle.0, packet.as_ptr() as *const c_char, len)
        })
    }

    fn animation_nodes(&self, player: PlayerId) -> Result<Vec<AnimationNode>, SgComError> {
        let handle = self.player(player)?;
        let mut nodes: *mut sys::SgAnimationNode = ptr::null_mut();
        let mut count: sys::SgSize = 0;
        check(unsafe { sys::SG_COM_GetAnimationNodes(handle.0, &mut nodes, &mut count) })?;
        if nodes.is_null() || count == 0 {
            return Ok(Vec::new());
        }

        let raw = unsafe { std::slice::from_raw_parts(nodes, count as usize) };
        Ok(raw.iter().map(|node| unsafe { copy_node(node) }).collect())
    }

    fn update_animation(&self, player: PlayerId, time_ms: f64) -> Result<f64, SgComError> {
        let handle = self.player(player)?;
        let mut current = time_ms;
        check(unsafe { sys::SG_COM_UpdateAnimation(handle.0, time_ms, &mut current) })?;
        Ok(current)
    }

    fn playable_range(&self, player: PlayerId) -> Result<PlayableRange, SgComError> {
        let handle = self.player(player)?;
        let mut range = PlayableRange::default();
        check(unsafe {
            sys::SG_COM_GetPlayableRange(handle.0, &mut range.min_ms, &mut range.max_ms)
        })?;
        Ok(range)
    }
}
