use crate::audio::ClipError;

/// Result alias that carries the crate-level [`DriverError`] type.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Closed set of failure codes reported by the SG Com call surface.
///
/// The discriminants match the numbering of the C enumeration so that values
/// can cross the ABI unchanged; `0` is success and therefore has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SgComError {
    #[error("low memory")]
    LowMemory = 1,
    #[error("invalid license")]
    InvalidLicense = 2,
    #[error("invalid engine or player handle")]
    InvalidHandle = 3,
    #[error("invalid packet")]
    InvalidPacket = 4,
    #[error("invalid parameter")]
    InvalidParam = 5,
    /// A tick was requested while the previous one is still running. Retryable.
    #[error("tick already in progress")]
    TickInProgress = 6,
    #[error("out of order packet discarded")]
    OutOfOrderPacketDiscarded = 7,
    /// The input buffer lacks free space. Drain with more ticks and retry.
    #[error("input buffer overrun")]
    InputOverrun = 8,
    #[error("input buffer underrun")]
    InputUnderrun = 9,
    /// Catch-all; detail text is available from the exception text accessor.
    #[error("internal exception")]
    Exception = 10,
    #[error("not implemented")]
    NotImplemented = 11,
    #[error("undefined error")]
    Undefined = 12,
}

impl SgComError {
    /// Numeric code as used by the C enumeration.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps a raw return code onto `Ok(())` or the matching error. Unknown
    /// codes collapse into [`SgComError::Undefined`].
    pub fn check(code: i32) -> std::result::Result<(), SgComError> {
        match code {
            0 => Ok(()),
            other => Err(Self::from_code(other)),
        }
    }

    /// Maps a non-zero raw code onto its variant.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::LowMemory,
            2 => Self::InvalidLicense,
            3 => Self::InvalidHandle,
            4 => Self::InvalidPacket,
            5 => Self::InvalidParam,
            6 => Self::TickInProgress,
            7 => Self::OutOfOrderPacketDiscarded,
            8 => Self::InputOverrun,
            9 => Self::InputUnderrun,
            10 => Self::Exception,
            11 => Self::NotImplemented,
            _ => Self::Undefined,
        }
    }

    /// Whether the caller may simply try the same call again later.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::TickInProgress | Self::InputOverrun)
    }
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Free-form message for failures without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// A call into the SDK failed.
    #[error("sdk call `{call}` failed: {source}")]
    Sdk {
        call: &'static str,
        #[source]
        source: SgComError,
    },
    /// An audio clip could not be ingested.
    #[error(transparent)]
    Clip(#[from] ClipError),
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// A shared structure was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Tags an SDK error with the call that produced it.
    pub fn sdk(call: &'static str, source: SgComError) -> Self {
        Self::Sdk { call, source }
    }

    /// The SDK code behind this error, if it came from the SDK.
    pub fn sdk_code(&self) -> Option<SgComError> {
        match self {
            Self::Sdk { source, .. } => Some(*source),
            _ => None,
        }
    }
}

impl From<&str> for DriverError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for DriverError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_the_c_numbering() {
        assert_eq!(SgComError::check(0), Ok(()));
        assert_eq!(SgComError::check(6), Err(SgComError::TickInProgress));
        assert_eq!(SgComError::TickInProgress.code(), 6);
        assert_eq!(SgComError::Undefined.code(), 12);
        assert_eq!(SgComError::from_code(99), SgComError::Undefined);
        assert_eq!(SgComError::from_code(-1), SgComError::Undefined);
    }

    #[test]
    fn only_tick_and_overrun_are_transient() {
        assert!(SgComError::TickInProgress.is_transient());
        assert!(SgComError::InputOverrun.is_transient());
        assert!(!SgComError::Exception.is_transient());
        assert!(!SgComError::InvalidHandle.is_transient());
    }

    #[test]
    fn sdk_errors_keep_their_code() {
        let err = DriverError::sdk("process_tick", SgComError::InvalidHandle);
        assert_eq!(err.sdk_code(), Some(SgComError::InvalidHandle));
        assert!(format!("{err}").contains("process_tick"));
        assert_eq!(DriverError::msg("boom").sdk_code(), None);
    }
}
