//! Debug backends: how the monitor reaches target memory.
//!
//! A backend exposes atomic, bounded reads and writes of arbitrary byte
//! ranges. Word tearing at range boundaries is tolerated by the protocol
//! (magic check plus the busy discipline), so backends only have to keep a
//! single call internally consistent. Addresses are 64-bit in the trait;
//! the telnet interpreter truncates to 32 bits at its edge.

mod gdb;
mod openocd;

pub use gdb::GdbBackend;
pub use openocd::OpenocdBackend;

use shared::errors::BackendError;

pub trait MemoryBackend {
    /// Fills `buf` from target memory at `addr`.
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BackendError>;

    /// Writes `data` into target memory at `addr`.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), BackendError>;

    /// The session finished a burst of work; give the target CPU time.
    /// The packet backend resumes the halted core here.
    fn on_idle(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Tears the link down. Errors are pointless at this stage and ignored.
    fn disconnect(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Line-oriented OpenOCD telnet interpreter (`mdw`/`mww`).
    Openocd,
    /// GDB remote-serial protocol (`m`/`M` packets, halt semantics).
    Gdb,
}

impl BackendKind {
    pub fn default_port(self) -> u16 {
        match self {
            BackendKind::Openocd => 4444,
            BackendKind::Gdb => 3333,
        }
    }

    /// Connects and returns the backend behind the common trait.
    pub fn connect(self, host: &str, port: u16) -> Result<Box<dyn MemoryBackend>, BackendError> {
        match self {
            BackendKind::Openocd => Ok(Box::new(OpenocdBackend::connect(host, port)?)),
            BackendKind::Gdb => Ok(Box::new(GdbBackend::connect(host, port)?)),
        }
    }
}
