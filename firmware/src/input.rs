//! Input (host→target) side of the channel: polling the input ring and
//! raising input requests toward the monitor.

use core::ptr;
use core::sync::atomic::{Ordering, fence};

use shared::errors::{ChannelError, RingError};
use shared::flags::ChannelFlags;
use shared::layout::ctrl;
use shared::ring;

use crate::channel::LogChannel;

impl LogChannel {
    /// Whether the monitor has delivered bytes we have not consumed yet.
    pub fn input_available(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        self.load32(ctrl::IN_HEAD) != self.load32(ctrl::IN_TAIL)
    }

    /// Pops one byte from the input ring. Clears `INPUT_AVAILABLE` and
    /// `INPUT_REQUESTED` once the ring runs dry, completing the request
    /// cycle from the firmware side.
    pub fn input_getc(&mut self) -> Option<u8> {
        if !self.is_valid() {
            return None;
        }
        self.with_lock(|ch| {
            let head = ch.load32(ctrl::IN_HEAD);
            fence(Ordering::Acquire);
            let tail = ch.load32(ctrl::IN_TAIL);
            if head == tail {
                return None;
            }
            let (in_buf, in_size) = ch.in_ring();
            let b = unsafe { ptr::read_volatile(in_buf.add(tail as usize)) };
            let tail = ring::advance(tail, 1, in_size);
            fence(Ordering::Release);
            ch.store32(ctrl::IN_TAIL, tail);
            if ch.load32(ctrl::IN_HEAD) == tail {
                ch.clear_flag(ChannelFlags::INPUT_AVAILABLE | ChannelFlags::INPUT_REQUESTED);
            }
            Some(b)
        })
    }

    /// Reads one input line into `out`: up to a newline (kept) or
    /// `out.len() - 1` bytes, NUL-terminated. Fails with `Empty` when no
    /// byte could be read, including the degenerate one-byte buffer.
    pub fn input_gets(&mut self, out: &mut [u8]) -> Result<usize, ChannelError> {
        if !self.is_valid() {
            return Err(ChannelError::InvalidContext);
        }
        let mut n = 0;
        while n + 1 < out.len() {
            let Some(b) = self.input_getc() else { break };
            out[n] = b;
            n += 1;
            if b == b'\n' {
                break;
            }
        }
        if !out.is_empty() {
            out[n] = 0;
        }
        if n == 0 {
            return Err(RingError::Empty.into());
        }
        Ok(n)
    }

    /// Free bytes in the input ring; what the monitor may still deliver.
    pub fn input_free_space(&self) -> u32 {
        if !self.is_valid() {
            return 0;
        }
        let (_, in_size) = self.in_ring();
        ring::free_space(
            self.load32(ctrl::IN_HEAD),
            self.load32(ctrl::IN_TAIL),
            in_size,
        )
    }

    /// Publishes an input request: replaces the previous mode hints with
    /// `mode` (only the echo/line bits are honored) and raises
    /// `INPUT_REQUESTED`.
    pub fn input_request(&mut self, mode: ChannelFlags) -> Result<(), ChannelError> {
        if !self.is_valid() {
            return Err(ChannelError::InvalidContext);
        }
        self.with_lock(|ch| {
            ch.clear_flag(ChannelFlags::INPUT_MODE_MASK);
            ch.set_flag(ChannelFlags::INPUT_REQUESTED | (mode & ChannelFlags::INPUT_MODE_MASK));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::layout::{CTRL_SIZE, ControlBlock};

    /// Plays the monitor's role: writes bytes into the input ring through
    /// the region, advances `in_head`, raises `INPUT_AVAILABLE`, clears
    /// `INPUT_REQUESTED` — without touching `BUSY`, as the real monitor does.
    fn feed_input(region: &mut [u8], data: &[u8]) {
        let mut raw = [0u8; CTRL_SIZE];
        raw.copy_from_slice(&region[..CTRL_SIZE]);
        let mut ctrl_blk = ControlBlock::parse(&raw);

        let in_start = CTRL_SIZE + ctrl_blk.out_size as usize;
        let mut head = ctrl_blk.in_head;
        for &b in data {
            region[in_start + head as usize] = b;
            head = ring::advance(head, 1, ctrl_blk.in_size);
        }
        ctrl_blk.in_head = head;
        ctrl_blk.flags |= ChannelFlags::INPUT_AVAILABLE.bits();
        ctrl_blk.flags &= !ChannelFlags::INPUT_REQUESTED.bits();
        region[..CTRL_SIZE].copy_from_slice(&ctrl_blk.encode());
    }

    #[test]
    fn request_sets_mode_bits_and_replaces_old_ones() {
        let mut region = vec![0u8; 2048];
        let mut ch = LogChannel::create(&mut region).unwrap();

        ch.input_request(ChannelFlags::INPUT_ECHO_OFF).unwrap();
        let flags = ch.flags();
        assert!(flags.contains(ChannelFlags::INPUT_REQUESTED));
        assert!(flags.contains(ChannelFlags::INPUT_ECHO_OFF));
        assert!(!flags.contains(ChannelFlags::INPUT_LINE_MODE));

        ch.input_request(ChannelFlags::INPUT_LINE_MODE).unwrap();
        let flags = ch.flags();
        assert!(flags.contains(ChannelFlags::INPUT_LINE_MODE));
        assert!(!flags.contains(ChannelFlags::INPUT_ECHO_OFF));
    }

    #[test]
    fn request_then_feed_then_gets_round_trips() {
        let mut region = vec![0u8; 2048];
        let mut ch = LogChannel::create(&mut region).unwrap();

        ch.input_request(ChannelFlags::INPUT_LINE_MODE).unwrap();
        feed_input(&mut region, b"answer\n");
        assert!(ch.input_available());

        let mut buf = [0u8; 64];
        let n = ch.input_gets(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"answer\n");
        assert_eq!(buf[n], 0);

        // Fully drained: the request cycle is closed.
        assert!(!ch.input_available());
        let flags = ch.flags();
        assert!(!flags.contains(ChannelFlags::INPUT_AVAILABLE));
        assert!(!flags.contains(ChannelFlags::INPUT_REQUESTED));
    }

    #[test]
    fn gets_with_one_byte_buffer_reads_nothing() {
        let mut region = vec![0u8; 2048];
        let mut ch = LogChannel::create(&mut region).unwrap();
        feed_input(&mut region, b"x");

        let mut buf = [0u8; 1];
        assert!(matches!(
            ch.input_gets(&mut buf),
            Err(ChannelError::Ring(RingError::Empty))
        ));
        assert_eq!(buf[0], 0);
        // The byte is still there for a properly sized read.
        assert!(ch.input_available());
    }

    #[test]
    fn getc_drains_byte_by_byte() {
        let mut region = vec![0u8; 2048];
        let mut ch = LogChannel::create(&mut region).unwrap();
        feed_input(&mut region, b"ab");

        assert_eq!(ch.input_getc(), Some(b'a'));
        assert_eq!(ch.input_getc(), Some(b'b'));
        assert_eq!(ch.input_getc(), None);
    }

    #[test]
    fn free_space_shrinks_as_input_arrives() {
        let mut region = vec![0u8; 2048];
        let mut ch = LogChannel::create(&mut region).unwrap();
        let before = ch.input_free_space();
        feed_input(&mut region, b"1234");
        assert_eq!(ch.input_free_space(), before - 4);
    }
}
