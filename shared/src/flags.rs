use bitflags::bitflags;

bitflags! {
    /// Command/status bits of the control block's `flags` word.
    ///
    /// Every bit is set and cleared individually; unknown bits coming from
    /// the target are preserved across read-modify-write cycles, so the two
    /// sides can disagree on extensions without clobbering each other.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        /// Monitor asks the firmware to clear both rings; the firmware
        /// clears the bit once done.
        const CLEAR_BUFFER = 0x0000_0001;
        /// Mutual-exclusion token over the control block, held by whichever
        /// side is currently mutating it.
        const BUSY = 0x0000_0002;
        /// Monitor placed new bytes in the input ring.
        const INPUT_AVAILABLE = 0x0000_0004;
        /// Firmware is blocked on input; the monitor should prompt and feed.
        const INPUT_REQUESTED = 0x0000_0008;
        /// Input-request mode hint: the firmware echoes, the terminal must not.
        const INPUT_ECHO_OFF = 0x0000_0010;
        /// Input-request mode hint: line-buffered rather than per-character.
        const INPUT_LINE_MODE = 0x0000_0020;
        /// Firmware published a file chunk for the host to consume.
        const FILE_SEND_REQ = 0x0000_0040;
        /// Firmware wants the next chunk of a host file.
        const FILE_RECV_REQ = 0x0000_0080;
        /// Firmware asks the monitor to shut down its loop.
        const EXIT_REQUESTED = 0x0000_0100;
    }
}

impl ChannelFlags {
    /// The mode hints that accompany an input request.
    pub const INPUT_MODE_MASK: ChannelFlags = ChannelFlags::INPUT_ECHO_OFF
        .union(ChannelFlags::INPUT_LINE_MODE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_match_the_wire_values() {
        assert_eq!(ChannelFlags::CLEAR_BUFFER.bits(), 0x01);
        assert_eq!(ChannelFlags::BUSY.bits(), 0x02);
        assert_eq!(ChannelFlags::INPUT_AVAILABLE.bits(), 0x04);
        assert_eq!(ChannelFlags::INPUT_REQUESTED.bits(), 0x08);
        assert_eq!(ChannelFlags::INPUT_ECHO_OFF.bits(), 0x10);
        assert_eq!(ChannelFlags::INPUT_LINE_MODE.bits(), 0x20);
        assert_eq!(ChannelFlags::FILE_SEND_REQ.bits(), 0x40);
        assert_eq!(ChannelFlags::FILE_RECV_REQ.bits(), 0x80);
        assert_eq!(ChannelFlags::EXIT_REQUESTED.bits(), 0x100);
    }

    #[test]
    fn unknown_bits_survive_a_round_trip() {
        let raw = 0x8000_0042u32;
        let flags = ChannelFlags::from_bits_retain(raw);
        assert!(flags.contains(ChannelFlags::BUSY));
        assert_eq!(flags.bits(), raw);
    }
}
