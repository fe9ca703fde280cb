use std::{borrow::Cow, fmt};

use thiserror::Error;

use super::{backend::DeviceType, command::QueueClass, command::SyncPoint};

#[derive(Debug, Error)]
pub enum RhiError {
    #[error("{backend:?} backend is unavailable: {reason}")]
    BackendUnavailable {
        backend: DeviceType,
        reason: Cow<'static, str>,
    },

    #[error("failed to initialize {backend:?} device")]
    DeviceInitFailed {
        backend: DeviceType,
        #[source]
        source: Box<RhiError>,
    },

    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    #[error("wait for value {value} on the {queue:?} timeline timed out")]
    SyncTimeout { queue: QueueClass, value: SyncPoint },

    #[error("device lost in {call}: {reason}")]
    DeviceLost { call: &'static str, reason: String },

    #[error("present failed: {reason}")]
    PresentFailed { reason: String },

    #[error("{call} failed: {reason}")]
    Native { call: &'static str, reason: String },
}

impl RhiError {
    pub fn invalid_state(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn native(call: &'static str, reason: impl fmt::Debug) -> Self {
        Self::Native {
            call,
            reason: format!("{reason:?}"),
        }
    }

    /// Usage errors leave the device intact, everything else takes it down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState(_))
    }

    /// Wraps a construction-time failure so the caller sees which backend
    /// failed. Availability errors pass through untouched.
    pub fn into_init_failure(self, backend: DeviceType) -> Self {
        match self {
            err @ (Self::BackendUnavailable { .. } | Self::DeviceInitFailed { .. }) => err,
            err => Self::DeviceInitFailed {
                backend,
                source: Box::new(err),
            },
        }
    }
}

pub type RhiResult<T> = Result<T, RhiError>;

pub trait NativeResultExt<T> {
    fn native(self, call: &'static str) -> RhiResult<T>;
}

impl<T, E: fmt::Debug> NativeResultExt<T> for Result<T, E> {
    fn native(self, call: &'static str) -> RhiResult<T> {
        self.map_err(|e| RhiError::native(call, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_failure_wraps_native_errors() {
        let err = RhiError::native("CreateCommandQueue", "E_OUTOFMEMORY")
            .into_init_failure(DeviceType::Dx12);

        match err {
            RhiError::DeviceInitFailed { backend, source } => {
                assert_eq!(backend, DeviceType::Dx12);
                assert!(matches!(
                    *source,
                    RhiError::Native {
                        call: "CreateCommandQueue",
                        ..
                    }
                ));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn init_failure_keeps_unavailable() {
        let err = RhiError::BackendUnavailable {
            backend: DeviceType::Vulkan,
            reason: "no loader".into(),
        }
        .into_init_failure(DeviceType::Vulkan);

        assert!(matches!(err, RhiError::BackendUnavailable { .. }));
    }

    #[test]
    fn only_invalid_state_is_recoverable() {
        assert!(!RhiError::invalid_state("twice").is_fatal());
        assert!(
            RhiError::SyncTimeout {
                queue: QueueClass::Graphics,
                value: 4
            }
            .is_fatal()
        );
        assert!(
            RhiError::PresentFailed {
                reason: "out of date".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn native_error_carries_call_and_code() {
        let err: RhiResult<()> = Err::<(), _>(-2147024882i32).native("Present");
        let text = err.unwrap_err().to_string();

        assert!(text.contains("Present"));
        assert!(text.contains("-2147024882"));
    }
}
