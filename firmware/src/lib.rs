//! Target-side end of the memlog channel.
//!
//! The firmware owns a caller-supplied byte region and builds the channel in
//! place: packed control block first, then the output ring, then the input
//! ring. Everything the monitor can observe goes through volatile accesses;
//! everything else (line accumulators, lock recursion, the default-channel
//! pointer) lives in the [`LogChannel`] handle and never enters shared
//! memory.
//!
//! The crate is `no_std` unless the `std` feature is enabled; `std` adds the
//! filesystem-backed [`transfer::StdFileSystem`] used by hosted tests and
//! host-process targets.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod channel;
mod default_ctx;
mod input;
pub mod transfer;

pub use channel::{LogChannel, OutputSplit};
pub use default_ctx::{clear_default, print_args, set_as_default, with_default};
pub use shared::errors::{ChannelError, RingError};
pub use shared::flags::ChannelFlags;
