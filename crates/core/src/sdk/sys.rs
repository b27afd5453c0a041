//! Raw bindings for the SG Com C API (`SG.h`, `SG_Com.h`).
//!
//! C enumerations are passed as `c_int`; the constants below carry their
//! values. Everything here is unsafe to call; [`super::native`] wraps it.

#![allow(non_snake_case)]

use std::os::raw::{c_char, c_int, c_uint, c_void};

pub type SgSize = c_uint;
pub type SgByte = u8;

/// Opaque engine state.
pub enum SgComEngine {}
/// Opaque player state.
pub enum SgComPlayer {}

pub type SgComEngineHandle = *mut SgComEngine;
pub type SgComPlayerHandle = *mut SgComPlayer;

// SG_AudioSampleType
pub const SG_AUDIO_INT_16: c_int = 0;
pub const SG_AUDIO_INT_32: c_int = 1;
pub const SG_AUDIO_FLOAT_32: c_int = 2;

// SG_AudioSampleRate
pub const SG_AUDIO_8_KHZ: c_int = 0;
pub const SG_AUDIO_12_KHZ: c_int = 1;
pub const SG_AUDIO_16_KHZ: c_int = 2;
pub const SG_AUDIO_24_KHZ: c_int = 3;
pub const SG_AUDIO_32_KHZ: c_int = 4;
pub const SG_AUDIO_44_1_KHZ: c_int = 5;
pub const SG_AUDIO_48_KHZ: c_int = 6;

// SG_LoggingLevel
pub const SG_LOGLEVEL_NONE: c_int = 0;
pub const SG_LOGLEVEL_ERROR: c_int = 1;
pub const SG_LOGLEVEL_DEBUG: c_int = 2;

// SG_AnimationType
pub const SG_NORMAL_ANIMATION: c_int = 0;
pub const SG_BAKED_ANIMATION: c_int = 1;

// SG_AnimationNodeType
pub const SG_JOINT: c_int = 0;
pub const SG_BLENDSHAPE: c_int = 1;
pub const SG_OTHER_ANIMATION_NODE: c_int = 2;

// SG_COM_Error
pub const SG_COM_ERROR_OK: c_int = 0;

// SG_COM_Status
pub const SG_COM_STATUS_MOOD_CHANGED: c_int = 0;

// SG_COM_EngineControl
pub const SG_COM_CTRL_SCALE: c_int = 0;
pub const SG_COM_CTRL_SPEED: c_int = 1;
pub const SG_COM_CTRL_EXPRESSION_FREQ: c_int = 2;

// SG_COM_EngineRole
pub const SG_COM_ROLE_SPEAK: c_int = 0;
pub const SG_COM_ROLE_LISTEN: c_int = 1;

// SG_COM_EngineConfigFlag
pub const SG_COM_ENGINE_CONFIG_NONE: c_int = 0;
pub const SG_COM_ENGINE_CONFIG_ENABLE_IDLE: c_int = 1;
pub const SG_COM_ENGINE_CONFIG_FIXED_RANDOM_SEED: c_int = 2;

#[repr(C)]
pub struct SgAnimationNode {
    pub name: *const c_char,
    pub node_type: c_int,
    pub num_channels: SgSize,
    pub channel_names: *const *const c_char,
    pub channel_values: *mut f32,
}

pub type SgLoggingCallback = Option<unsafe extern "C" fn(message: *const c_char)>;

pub type SgComEngineBroadcastCallback = Option<
    unsafe extern "C" fn(
        engine_handle: SgComEngineHandle,
        packet: *mut c_char,
        packet_bytes: SgSize,
        custom_engine_data: *mut c_void,
    ),
>;

pub type SgComEngineStatusCallback = Option<
    unsafe extern "C" fn(
        engine_handle: SgComEngineHandle,
        status: c_int,
        message: *const c_char,
        custom_engine_data: *mut c_void,
    ),
>;

#[repr(C)]
pub struct SgComPlayerConfig {
    pub character_file_in_memory: *mut SgByte,
    pub character_file_bytes: SgSize,
    pub animation_type: c_int,
    pub buffer_sec: f32,
}

#[repr(C)]
pub struct SgComEngineConfig {
    pub character_file_in_memory: *mut SgByte,
    pub character_file_bytes: SgSize,
    pub audio_sample_type: c_int,
    pub audio_sample_rate: c_int,
    pub local_player: SgComPlayerHandle,
    pub engine_broadcast_callback: SgComEngineBroadcastCallback,
    pub engine_status_callback: SgComEngineStatusCallback,
    pub buffer_sec: f32,
    pub flag: c_int,
    pub custom_engine_data: *mut c_void,
}

#[link(name = "SG_Com")]
extern "C" {
    pub fn SG_COM_GetExceptionText() -> *const c_char;

    pub fn SG_COM_Initialize(
        logging_level: c_int,
        logging_callback: SgLoggingCallback,
        license_data: *const c_char,
        license_unique_id: *const c_char,
        license_custom_data: *const c_char,
    ) -> c_int;

    pub fn SG_COM_Shutdown() -> c_int;

    pub fn SG_COM_GetVersionString() -> *const c_char;

    pub fn SG_COM_GetVersionNumber() -> c_uint;

    pub fn SG_COM_CreateEngine(
        engine_config: *const SgComEngineConfig,
        engine_handle: *mut SgComEngineHandle,
    ) -> c_int;

    pub fn SG_COM_DestroyEngine(engine_handle: SgComEngineHandle) -> c_int;

    pub fn SG_COM_InputAudio(
        engine_handle: SgComEngineHandle,
        data: *const c_void,
        data_bytes: SgSize,
    ) -> c_int;

    pub fn SG_COM_InputAuxData(
        engine_handle: SgComEngineHandle,
        data: *const c_void,
        data_bytes: SgSize,
    ) -> c_int;

    pub fn SG_COM_ProcessTick(
        engine_handle: SgComEngineHandle,
        processed_frames: *mut c_int,
        remaining_frames: *mut c_int,
    ) -> c_int;

    pub fn SG_COM_Reset(engine_handle: SgComEngineHandle) -> c_int;

    pub fn SG_COM_SetMood(engine_handle: SgComEngineHandle, mood: *const c_char) -> c_int;

    pub fn SG_COM_GetMood(
        engine_handle: SgComEngineHandle,
        mood: *mut c_char,
        buffersize: SgSize,
    ) -> c_int;

    pub fn SG_COM_GetMoodList(
        engine_handle: SgComEngineHandle,
        mood_list: *mut c_char,
        buffersize: SgSize,
    ) -> c_int;

    pub fn SG_COM_SetRole(engine_handle: SgComEngineHandle, role: c_int) -> c_int;

    pub fn SG_COM_GetRole(engine_handle: SgComEngineHandle, role: *mut c_int) -> c_int;

    pub fn SG_COM_GetEngineControl(
        engine_handle: SgComEngineHandle,
        engine_control: c_int,
        value: *mut f32,
    ) -> c_int;

    pub fn SG_COM_SetEngineControl(
        engine_handle: SgComEngineHandle,
        engine_control: c_int,
        value: f32,
    ) -> c_int;

    pub fn SG_COM_CreatePlayer(
        player_config: *const SgComPlayerConfig,
        player_handle: *mut SgComPlayerHandle,
    ) -> c_int;

    pub fn SG_COM_DestroyPlayer(player_handle: SgComPlayerHandle) -> c_int;

    pub fn SG_COM_ReceivePacket(
        player_handle: SgComPlayerHandle,
        packet: *const c_char,
        packet_bytes: SgSize,
    ) -> c_int;

    pub fn SG_COM_GetAnimationNodes(
        player_handle: SgComPlayerHandle,
        animation_nodes: *mut *mut SgAnimationNode,
        num_animation_nodes: *mut SgSize,
    ) -> c_int;

    pub fn SG_COM_UpdateAnimation(
        player_handle: SgComPlayerHandle,
        time_ms: f64,
        current_time_ms: *mut f64,
    ) -> c_int;

    pub fn SG_COM_GetPlayableRange(
        player_handle: SgComPlayerHandle,
        min_time_ms: *mut f64,
        max_time_ms: *mut f64,
    ) -> c_int;
}
