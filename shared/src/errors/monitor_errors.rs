use thiserror::Error;

use super::BackendError;

/// Failures of the host-side session driver. Apart from `InputEnded` (a
/// clean reason to leave the loop) these surface as trace lines and the
/// loop keeps polling.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("control block magic mismatch: got {got:#010x}")]
    BadMagic { got: u32 },

    #[error("control block failed validation")]
    Desync,

    #[error("firmware did not complete the clear command")]
    ClearTimeout,

    #[error("busy flag never released by the firmware")]
    BusyTimeout,

    #[error("firmware stopped draining the input ring")]
    InputStalled,

    #[error("input source ended")]
    InputEnded,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
