//! Process-wide default channel, so `printf`-style glue can reach the
//! channel without threading a handle through every call site.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::channel::LogChannel;

static DEFAULT_CHANNEL: AtomicPtr<LogChannel> = AtomicPtr::new(null_mut());

/// Registers `channel` as the default for [`with_default`] and the print
/// macros. The caller keeps ownership; it must call [`clear_default`]
/// before the channel moves or is dropped.
pub fn set_as_default(channel: &mut LogChannel) {
    DEFAULT_CHANNEL.store(channel as *mut LogChannel, Ordering::SeqCst);
}

/// Unregisters the default channel.
pub fn clear_default() {
    DEFAULT_CHANNEL.store(null_mut(), Ordering::SeqCst);
}

/// Runs `f` against the registered default channel, or returns `None` when
/// nothing is registered.
pub fn with_default<R>(f: impl FnOnce(&mut LogChannel) -> R) -> Option<R> {
    let ptr = DEFAULT_CHANNEL.load(Ordering::SeqCst);
    if ptr.is_null() {
        None
    } else {
        // Registration contract: the pointer stays valid until cleared, and
        // the firmware side is single-threaded within a call chain.
        Some(f(unsafe { &mut *ptr }))
    }
}

/// Formats into the default channel. Returns `false` when no channel is
/// registered or the write failed.
pub fn print_args(args: core::fmt::Arguments<'_>) -> bool {
    with_default(|ch| core::fmt::Write::write_fmt(ch, args).is_ok()).unwrap_or(false)
}

/// Prints to the default channel, like `print!`.
#[macro_export]
macro_rules! fw_print {
    ($($arg:tt)*) => {
        $crate::print_args(core::format_args!($($arg)*))
    };
}

/// Prints a full record (newline appended) to the default channel.
#[macro_export]
macro_rules! fw_println {
    () => {
        $crate::print_args(core::format_args!("\n"))
    };
    ($fmt:expr) => {
        $crate::print_args(core::format_args!(concat!($fmt, "\n")))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print_args(core::format_args!(concat!($fmt, "\n"), $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_macros_reach_the_registered_channel() {
        let region = Box::leak(vec![0u8; 4096].into_boxed_slice());
        let channel = Box::leak(Box::new(LogChannel::create(region).unwrap()));
        while channel.read_next().unwrap() {}

        set_as_default(channel);
        assert!(fw_println!("boot complete, code {}", 3));
        clear_default();
        assert!(!fw_println!("nobody listening"));

        assert!(channel.read_next().unwrap());
        assert_eq!(channel.ref_buffer(), b"boot complete, code 3\n");
        assert!(!channel.read_next().unwrap());
    }
}
