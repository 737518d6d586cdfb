mod channel_errors;

pub use channel_errors::{ChannelError, RingError};

#[cfg(feature = "std")]
mod backend_errors;
#[cfg(feature = "std")]
mod config_errors;
#[cfg(feature = "std")]
mod monitor_errors;

#[cfg(feature = "std")]
pub use backend_errors::BackendError;
#[cfg(feature = "std")]
pub use config_errors::ConfigError;
#[cfg(feature = "std")]
pub use monitor_errors::MonitorError;
