//! The polling session: reads the control block, drains log output to
//! stdout, feeds input, services file transfers, and recovers from a
//! desynchronized or reset target.

use std::io::{self, Read, Seek, Write};
use std::time::{Duration, Instant};

use chrono::Local;

use shared::errors::MonitorError;
use shared::flags::ChannelFlags;
use shared::layout::{CTRL_SIZE, ControlBlock, FILE_BLOCK_SIZE, FileTransferBlock, MAGIC, ctrl};
use shared::ring;

use crate::backend::MemoryBackend;
use crate::input::InputSource;
use crate::terminal::{self, TermGuard};

/// Bytes pulled from the output ring per backend read in live mode.
const READ_BATCH: u32 = 512;

const BUSY_POLL: Duration = Duration::from_millis(10);
const BUSY_POLL_LIMIT: u32 = 1_000;

const SPACE_POLL: Duration = Duration::from_millis(10);
const SPACE_POLL_LIMIT: u32 = 500;

const CLEAR_POLL: Duration = Duration::from_millis(100);
const CLEAR_POLL_LIMIT: u32 = 100;

/// Snapshot mode trades latency for target-read bandwidth.
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(300);

/// Errno-style status codes written into a failed transfer descriptor.
const STATUS_ENOENT: i32 = -2;
const STATUS_EIO: i32 = -5;
const STATUS_EINVAL: i32 = -22;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub snapshot: bool,
    pub blocking: bool,
    pub show_time: bool,
    pub interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            snapshot: false,
            blocking: false,
            show_time: false,
            interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of one poll iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    Exit,
}

pub struct Monitor {
    backend: Box<dyn MemoryBackend>,
    ring_addr: u64,
    ctrl: ControlBlock,
    /// Consumer cursor into the output ring. Ours alone; the target copy is
    /// only a mirror we push after draining.
    local_out_tail: u32,
    owns_busy: bool,
    opts: SessionOptions,
    input: InputSource,
    out: Box<dyn Write + Send>,
    last_refresh: Option<Instant>,
    at_line_start: bool,
    snapshot_buf: Vec<u8>,
}

impl Monitor {
    /// Reads and validates the control block, then sets up the session.
    pub fn connect(
        backend: Box<dyn MemoryBackend>,
        ring_addr: u64,
        opts: SessionOptions,
    ) -> Result<Self, MonitorError> {
        let mut monitor = Self {
            backend,
            ring_addr,
            ctrl: ControlBlock::default(),
            local_out_tail: 0,
            owns_busy: false,
            opts,
            input: InputSource::stdin(),
            out: Box::new(io::stdout()),
            last_refresh: None,
            at_line_start: true,
            snapshot_buf: Vec::new(),
        };
        monitor.refresh()?;
        if !monitor.ctrl.is_valid() {
            return Err(MonitorError::Desync);
        }
        monitor.local_out_tail = monitor.ctrl.out_tail;
        if monitor.opts.snapshot {
            let total =
                CTRL_SIZE + monitor.ctrl.out_size as usize + monitor.ctrl.in_size as usize;
            monitor.snapshot_buf = vec![0u8; total];
        }
        log::info!(
            "attached to channel at {ring_addr:#010x} (out {} B, in {} B)",
            monitor.ctrl.out_size,
            monitor.ctrl.in_size
        );
        Ok(monitor)
    }

    /// Replaces the input source (defaults to stdin).
    pub fn set_input(&mut self, input: InputSource) {
        self.input = input;
    }

    /// Replaces the output sink (defaults to stdout).
    pub fn set_output(&mut self, out: Box<dyn Write + Send>) {
        self.out = out;
    }

    pub fn control(&self) -> &ControlBlock {
        &self.ctrl
    }

    // ---- control-block refresh -----------------------------------------

    /// Re-reads the control block and accounts for new output since the
    /// last refresh.
    pub fn refresh(&mut self) -> Result<(), MonitorError> {
        let previous_head = self.ctrl.out_head;
        let mut raw = [0u8; CTRL_SIZE];
        self.backend.read_memory(self.ring_addr, &mut raw)?;
        let block = ControlBlock::parse(&raw);
        if block.magic != MAGIC {
            return Err(MonitorError::BadMagic { got: block.magic });
        }

        let new_bytes = if block.out_size > 0 {
            ring::used(block.out_head, previous_head.min(block.out_size - 1), block.out_size)
        } else {
            0
        };
        let now = Instant::now();
        if let Some(last) = self.last_refresh {
            let secs = now.duration_since(last).as_secs_f64();
            if secs > 0.0 {
                log::trace!(
                    "ring update: head={} tail={} new_bytes={} rate={:.1} B/s",
                    block.out_head,
                    block.out_tail,
                    new_bytes,
                    new_bytes as f64 / secs
                );
            }
        }
        self.last_refresh = Some(now);
        self.ctrl = block;
        Ok(())
    }

    fn flags(&self) -> ChannelFlags {
        ChannelFlags::from_bits_retain(self.ctrl.flags)
    }

    /// Writes the flag word directly, without any busy handshake. Used on
    /// the paths that must make progress while the firmware parks inside
    /// its own lock.
    fn write_flags_raw(&mut self, flags: ChannelFlags) -> Result<(), MonitorError> {
        self.backend.write_memory(
            self.ring_addr + ctrl::FLAGS as u64,
            &flags.bits().to_le_bytes(),
        )?;
        self.ctrl.flags = flags.bits();
        Ok(())
    }

    /// Full write-and-verify cycle for command flags.
    fn write_flags_checked(&mut self, flags: ChannelFlags) -> Result<(), MonitorError> {
        self.wait_until_not_busy()?;
        self.backend.write_memory(
            self.ring_addr + ctrl::FLAGS as u64,
            &flags.bits().to_le_bytes(),
        )?;
        self.refresh()?;
        if self.ctrl.flags != flags.bits() {
            return Err(MonitorError::Desync);
        }
        Ok(())
    }

    fn wait_until_not_busy(&mut self) -> Result<(), MonitorError> {
        if self.owns_busy {
            return Ok(());
        }
        for _ in 0..BUSY_POLL_LIMIT {
            if !self.flags().contains(ChannelFlags::BUSY) {
                return Ok(());
            }
            std::thread::sleep(BUSY_POLL);
            self.refresh()?;
        }
        Err(MonitorError::BusyTimeout)
    }

    /// Takes the busy flag for a blocking-mode read.
    pub fn set_busy(&mut self) -> Result<(), MonitorError> {
        self.write_flags_checked(self.flags() | ChannelFlags::BUSY)?;
        self.owns_busy = true;
        Ok(())
    }

    pub fn clear_busy(&mut self) -> Result<(), MonitorError> {
        self.write_flags_checked(self.flags() & !ChannelFlags::BUSY)?;
        self.owns_busy = false;
        Ok(())
    }

    // ---- output drain ---------------------------------------------------

    fn used_output(&self) -> u32 {
        ring::used(self.ctrl.out_head, self.local_out_tail, self.ctrl.out_size)
    }

    /// Drains everything buffered in the output ring to the sink, pushing
    /// the consumed tail back to the target. Returns whether anything came
    /// out.
    pub fn drain_output(&mut self) -> Result<bool, MonitorError> {
        if self.opts.blocking {
            self.set_busy()?;
        } else {
            self.wait_until_not_busy()?;
        }
        let result = self.drain_output_inner();
        if self.opts.blocking {
            // Release even when the drain failed halfway.
            let release = self.clear_busy();
            if result.is_ok() {
                release?;
            }
        }
        Ok(result? > 0)
    }

    fn drain_output_inner(&mut self) -> Result<u32, MonitorError> {
        let mut total = 0u32;
        let mut batch = [0u8; READ_BATCH as usize];
        while self.used_output() > 0 {
            let n = self.used_output().min(READ_BATCH);
            let (first, second) = ring::spans(self.local_out_tail, n, self.ctrl.out_size);
            let mut filled = 0usize;
            for (off, len) in std::iter::once(first).chain(second) {
                self.backend.read_memory(
                    self.ctrl.out_buffer + u64::from(off),
                    &mut batch[filled..filled + len as usize],
                )?;
                filled += len as usize;
            }
            self.emit(&batch[..filled])?;
            self.local_out_tail = ring::advance(self.local_out_tail, n, self.ctrl.out_size);
            total += n;
        }
        if total > 0 {
            self.push_out_tail()?;
        }
        self.out.flush()?;
        Ok(total)
    }

    fn push_out_tail(&mut self) -> Result<(), MonitorError> {
        self.backend.write_memory(
            self.ring_addr + ctrl::OUT_TAIL as u64,
            &self.local_out_tail.to_le_bytes(),
        )?;
        self.ctrl.out_tail = self.local_out_tail;
        Ok(())
    }

    /// Writes drained bytes to the sink, optionally prefixing each line
    /// with the local wall-clock time.
    fn emit(&mut self, bytes: &[u8]) -> Result<(), MonitorError> {
        if !self.opts.show_time {
            self.out.write_all(bytes)?;
            return Ok(());
        }
        for piece in bytes.split_inclusive(|&b| b == b'\n') {
            if self.at_line_start {
                let stamp = Local::now().format("[%H:%M:%S] ");
                write!(self.out, "{stamp}")?;
            }
            self.out.write_all(piece)?;
            self.at_line_start = piece.ends_with(b"\n");
        }
        Ok(())
    }

    // ---- input ----------------------------------------------------------

    /// Writes `data` into the input ring and completes the request
    /// handshake.
    ///
    /// This path deliberately skips the busy-wait: the firmware typically
    /// holds `BUSY` while it sits in its input loop, and it can only get
    /// out of it if we deliver the bytes anyway. `BUSY` protects the
    /// control block's consistency, not the input bytes.
    pub fn send_input(&mut self, data: &[u8]) -> Result<(), MonitorError> {
        if data.is_empty() {
            return Ok(());
        }
        self.refresh()?;

        let mut waited = 0u32;
        loop {
            let free = ring::free_space(self.ctrl.in_head, self.ctrl.in_tail, self.ctrl.in_size);
            if free >= data.len() as u32 {
                break;
            }
            if waited >= SPACE_POLL_LIMIT {
                return Err(MonitorError::InputStalled);
            }
            waited += 1;
            std::thread::sleep(SPACE_POLL);
            self.refresh()?;
        }

        let mut head = self.ctrl.in_head;
        let (first, second) = ring::spans(head, data.len() as u32, self.ctrl.in_size);
        let mut consumed = 0usize;
        for (off, len) in std::iter::once(first).chain(second) {
            self.backend.write_memory(
                self.ctrl.in_buffer + u64::from(off),
                &data[consumed..consumed + len as usize],
            )?;
            consumed += len as usize;
        }
        head = ring::advance(head, data.len() as u32, self.ctrl.in_size);
        self.backend.write_memory(
            self.ring_addr + ctrl::IN_HEAD as u64,
            &head.to_le_bytes(),
        )?;
        self.ctrl.in_head = head;

        let flags =
            (self.flags() | ChannelFlags::INPUT_AVAILABLE) & !ChannelFlags::INPUT_REQUESTED;
        self.write_flags_raw(flags)?;
        self.backend.on_idle()?;
        log::trace!("sent {} input bytes", data.len());
        Ok(())
    }

    /// Answers a pending input request from the configured source.
    pub fn handle_input_request(&mut self) -> Result<(), MonitorError> {
        if !self.flags().contains(ChannelFlags::INPUT_REQUESTED) {
            return Ok(());
        }
        let line_mode = self.flags().contains(ChannelFlags::INPUT_LINE_MODE);

        // Terminal echo stays off regardless of the firmware's echo hint:
        // the firmware echoes through the output ring, and doubling it up
        // here would duplicate every character on screen.
        let chunk = {
            let _term = TermGuard::configure(false, line_mode);
            self.input.next_chunk(line_mode)?
        };
        let Some(chunk) = chunk else {
            return Err(MonitorError::InputEnded);
        };
        self.send_input(&chunk)
    }

    // ---- file transfers -------------------------------------------------

    fn read_descriptor(&mut self, addr: u64) -> Result<FileTransferBlock, MonitorError> {
        let mut raw = [0u8; FILE_BLOCK_SIZE];
        self.backend.read_memory(addr, &mut raw)?;
        Ok(FileTransferBlock::parse(&raw))
    }

    fn write_descriptor(
        &mut self,
        addr: u64,
        desc: &FileTransferBlock,
    ) -> Result<(), MonitorError> {
        self.backend.write_memory(addr, &desc.encode())?;
        Ok(())
    }

    /// Reports a host-side failure into the descriptor and acknowledges the
    /// request so the firmware aborts instead of spinning out its timeout.
    fn fail_descriptor(
        &mut self,
        addr: u64,
        mut desc: FileTransferBlock,
        status: i32,
        flag: ChannelFlags,
    ) -> Result<(), MonitorError> {
        desc.status = status;
        self.write_descriptor(addr, &desc)?;
        self.write_flags_raw(self.flags() & !flag)?;
        self.backend.on_idle()?;
        Ok(())
    }

    /// Services one published chunk of a firmware→host transfer.
    pub fn handle_file_send(&mut self) -> Result<(), MonitorError> {
        if !self.flags().contains(ChannelFlags::FILE_SEND_REQ) {
            return Ok(());
        }
        let desc_addr = self.ctrl.file_transfer;
        if desc_addr == 0 {
            log::error!("file send requested without a descriptor");
            return self.write_flags_raw(self.flags() & !ChannelFlags::FILE_SEND_REQ);
        }
        let desc = self.read_descriptor(desc_addr)?;
        let Some(path) = desc.host_path().map(str::to_owned) else {
            log::error!("file send descriptor carries a non-UTF-8 path");
            return self.fail_descriptor(desc_addr, desc, STATUS_EINVAL, ChannelFlags::FILE_SEND_REQ);
        };
        if desc.chunk_size == 0 || desc.buffer_addr == 0 || desc.total_size == 0 {
            log::error!(
                "invalid send parameters: total={} chunk={} buffer={:#x}",
                desc.total_size,
                desc.chunk_size,
                desc.buffer_addr
            );
            return self.fail_descriptor(desc_addr, desc, STATUS_EINVAL, ChannelFlags::FILE_SEND_REQ);
        }

        let mut chunk = vec![0u8; desc.chunk_size as usize];
        self.backend.read_memory(desc.buffer_addr, &mut chunk)?;

        let write_chunk = || -> io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(desc.offset == 0)
                .open(&path)?;
            file.seek(io::SeekFrom::Start(desc.offset))?;
            file.write_all(&chunk)
        };
        if let Err(e) = write_chunk() {
            log::error!("failed to write `{path}`: {e}");
            return self.fail_descriptor(desc_addr, desc, STATUS_EIO, ChannelFlags::FILE_SEND_REQ);
        }
        log::debug!(
            "wrote chunk {} ({} bytes at offset {}) to `{path}`",
            desc.chunk_no,
            desc.chunk_size,
            desc.offset
        );

        self.write_flags_raw(self.flags() & !ChannelFlags::FILE_SEND_REQ)?;
        self.backend.on_idle()?;
        Ok(())
    }

    /// Services one chunk request of a host→firmware transfer.
    pub fn handle_file_recv(&mut self) -> Result<(), MonitorError> {
        if !self.flags().contains(ChannelFlags::FILE_RECV_REQ) {
            return Ok(());
        }
        let desc_addr = self.ctrl.file_transfer;
        if desc_addr == 0 {
            log::error!("file receive requested without a descriptor");
            return self.write_flags_raw(self.flags() & !ChannelFlags::FILE_RECV_REQ);
        }
        let mut desc = self.read_descriptor(desc_addr)?;
        let Some(path) = desc.host_path().map(str::to_owned) else {
            log::error!("file receive descriptor carries a non-UTF-8 path");
            return self.fail_descriptor(desc_addr, desc, STATUS_EINVAL, ChannelFlags::FILE_RECV_REQ);
        };
        if desc.chunk_size == 0 || desc.buffer_addr == 0 {
            log::error!(
                "invalid receive parameters: chunk={} buffer={:#x}",
                desc.chunk_size,
                desc.buffer_addr
            );
            return self.fail_descriptor(desc_addr, desc, STATUS_EINVAL, ChannelFlags::FILE_RECV_REQ);
        }

        let serve_chunk = || -> io::Result<(Vec<u8>, u64)> {
            let mut file = std::fs::File::open(&path)?;
            let total = file.metadata()?.len();
            file.seek(io::SeekFrom::Start(desc.offset))?;
            let mut chunk = vec![0u8; desc.chunk_size as usize];
            let mut filled = 0usize;
            loop {
                let n = file.read(&mut chunk[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
                if filled == chunk.len() {
                    break;
                }
            }
            chunk.truncate(filled);
            Ok((chunk, total))
        };
        let (chunk, total) = match serve_chunk() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::error!("host file `{path}` does not exist");
                return self.fail_descriptor(
                    desc_addr,
                    desc,
                    STATUS_ENOENT,
                    ChannelFlags::FILE_RECV_REQ,
                );
            }
            Err(e) => {
                log::error!("failed to read `{path}`: {e}");
                return self.fail_descriptor(
                    desc_addr,
                    desc,
                    STATUS_EIO,
                    ChannelFlags::FILE_RECV_REQ,
                );
            }
        };

        if !chunk.is_empty() {
            self.backend.write_memory(desc.buffer_addr, &chunk)?;
        }
        desc.chunk_size = chunk.len() as u32; // zero is the EOF sentinel
        desc.total_size = total.min(u64::from(u32::MAX)) as u32;
        desc.status = 0;
        self.write_descriptor(desc_addr, &desc)?;
        log::debug!(
            "served chunk {} ({} bytes at offset {}) from `{path}`",
            desc.chunk_no,
            desc.chunk_size,
            desc.offset
        );

        self.write_flags_raw(self.flags() & !ChannelFlags::FILE_RECV_REQ)?;
        self.backend.on_idle()?;
        Ok(())
    }

    // ---- recovery -------------------------------------------------------

    /// First-stage recovery: adopt the target's own view of the tail.
    pub fn synchronize(&mut self) -> Result<(), MonitorError> {
        self.refresh()?;
        if !self.ctrl.is_valid() {
            return Err(MonitorError::Desync);
        }
        self.local_out_tail = self.ctrl.out_tail;
        log::info!("resynchronized at tail {}", self.local_out_tail);
        Ok(())
    }

    /// Asks the firmware to clear the channel.
    pub fn request_clear(&mut self) -> Result<(), MonitorError> {
        log::info!("sending clear command");
        self.write_flags_checked(self.flags() | ChannelFlags::CLEAR_BUFFER)
    }

    /// Waits for the firmware to complete a clear cycle: flag dropped and
    /// offsets back at zero.
    pub fn await_clear(&mut self, attempts: u32) -> Result<(), MonitorError> {
        for _ in 0..attempts {
            self.refresh()?;
            if !self.flags().contains(ChannelFlags::CLEAR_BUFFER)
                && self.ctrl.out_head == 0
                && self.ctrl.out_tail == 0
            {
                self.local_out_tail = 0;
                self.at_line_start = true;
                log::info!("clear completed");
                return Ok(());
            }
            std::thread::sleep(CLEAR_POLL);
        }
        Err(MonitorError::ClearTimeout)
    }

    fn recover(&mut self) -> Result<(), MonitorError> {
        log::warn!("channel state invalid, resynchronizing");
        if self.synchronize().is_ok() {
            return Ok(());
        }
        self.request_clear()?;
        self.await_clear(CLEAR_POLL_LIMIT)
    }

    // ---- the loop -------------------------------------------------------

    /// One poll iteration: refresh, drain, then service requests.
    pub fn poll(&mut self) -> Result<PollOutcome, MonitorError> {
        if self.opts.snapshot {
            self.poll_snapshot()
        } else {
            self.poll_live()
        }
    }

    fn poll_live(&mut self) -> Result<PollOutcome, MonitorError> {
        self.refresh()?;
        if !self.ctrl.is_valid() {
            self.recover()?;
        }
        if let Err(e) = self.drain_output() {
            log::warn!("drain failed: {e}");
            self.recover()?;
        }
        self.service_requests()
    }

    fn poll_snapshot(&mut self) -> Result<PollOutcome, MonitorError> {
        if self.opts.blocking {
            self.set_busy()?;
        } else {
            self.wait_until_not_busy()?;
        }
        let loaded = self.load_snapshot();
        if self.opts.blocking {
            self.clear_busy()?;
        }
        loaded?;
        self.service_requests()
    }

    /// Reads the whole shared region in one transaction and drains records
    /// from the local copy. Flag observations made here are stale by up to
    /// one polling period; the handlers re-check against the copy.
    fn load_snapshot(&mut self) -> Result<(), MonitorError> {
        let mut buf = std::mem::take(&mut self.snapshot_buf);
        let read = self.backend.read_memory(self.ring_addr, &mut buf);
        self.snapshot_buf = buf;
        read?;

        let mut raw = [0u8; CTRL_SIZE];
        raw.copy_from_slice(&self.snapshot_buf[..CTRL_SIZE]);
        let block = ControlBlock::parse(&raw);
        if !block.is_valid() {
            self.recover()?;
            return Ok(());
        }
        self.ctrl = block;

        let out = &self.snapshot_buf[CTRL_SIZE..CTRL_SIZE + self.ctrl.out_size as usize];
        let used = ring::used(self.ctrl.out_head, self.local_out_tail, self.ctrl.out_size);
        if used > 0 {
            let (first, second) = ring::spans(self.local_out_tail, used, self.ctrl.out_size);
            let mut bytes =
                Vec::from(&out[first.0 as usize..(first.0 + first.1) as usize]);
            if let Some((off, len)) = second {
                bytes.extend_from_slice(&out[off as usize..(off + len) as usize]);
            }
            self.emit(&bytes)?;
            self.out.flush()?;
            self.local_out_tail =
                ring::advance(self.local_out_tail, used, self.ctrl.out_size);
            self.push_out_tail()?;
        }
        Ok(())
    }

    fn service_requests(&mut self) -> Result<PollOutcome, MonitorError> {
        self.handle_input_request()?;
        if let Err(e) = self.handle_file_send() {
            log::error!("file send handling failed: {e}");
        }
        if let Err(e) = self.handle_file_recv() {
            log::error!("file receive handling failed: {e}");
        }
        if self.flags().contains(ChannelFlags::EXIT_REQUESTED) {
            log::info!("firmware requested exit");
            return Ok(PollOutcome::Exit);
        }
        self.backend.on_idle()?;
        Ok(PollOutcome::Continue)
    }

    /// Runs until the firmware requests exit, the input source ends, or a
    /// shutdown signal arrives. Transient errors keep the loop alive.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        let interval = if self.opts.snapshot {
            self.opts.interval.max(SNAPSHOT_INTERVAL)
        } else {
            self.opts.interval
        };
        log::info!(
            "monitoring in {} mode",
            if self.opts.snapshot { "snapshot" } else { "live" }
        );
        loop {
            if terminal::shutdown_requested() {
                log::info!("shutdown requested");
                return Ok(());
            }
            match self.poll() {
                Ok(PollOutcome::Exit) => return Ok(()),
                Ok(PollOutcome::Continue) => {}
                Err(MonitorError::InputEnded) => {
                    log::info!("input source ended, leaving the loop");
                    return Ok(());
                }
                Err(e @ MonitorError::ClearTimeout) => {
                    log::error!("unable to recover the channel: {e}");
                    return Err(e);
                }
                Err(e) => {
                    // Transient by policy: trace it and poll again.
                    log::warn!("poll failed: {e}");
                }
            }
            std::thread::sleep(interval);
        }
    }

    /// Tears the backend link down.
    pub fn disconnect(&mut self) {
        self.backend.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firmware::{ChannelError, LogChannel};
    use shared::errors::BackendError;
    use std::io::Write as _;
    use std::sync::{Arc, Mutex};

    /// Backend over this process's own memory: target addresses are real
    /// pointers into a leaked channel region, so the full protocol runs
    /// without a debug server.
    struct LoopbackBackend;

    impl MemoryBackend for LoopbackBackend {
        fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BackendError> {
            let src = addr as usize as *const u8;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = unsafe { core::ptr::read_volatile(src.add(i)) };
            }
            Ok(())
        }

        fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), BackendError> {
            let dst = addr as usize as *mut u8;
            for (i, b) in data.iter().enumerate() {
                unsafe { core::ptr::write_volatile(dst.add(i), *b) };
            }
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn leak_region(size: usize) -> (&'static mut [u8], u64) {
        let region = Box::leak(vec![0u8; size].into_boxed_slice());
        let addr = region.as_ptr() as usize as u64;
        (region, addr)
    }

    fn attach(addr: u64, opts: SessionOptions) -> (Monitor, SharedSink) {
        let mut monitor = Monitor::connect(Box::new(LoopbackBackend), addr, opts).unwrap();
        let sink = SharedSink::default();
        monitor.set_output(Box::new(sink.clone()));
        (monitor, sink)
    }

    #[test]
    fn basic_log_round_trip() {
        let (region, addr) = leak_region(8192);
        let mut fw = LogChannel::create(region).unwrap();
        let (mut monitor, sink) = attach(addr, SessionOptions::default());

        fw.puts("Hello\n").unwrap();
        monitor.refresh().unwrap();
        assert!(monitor.drain_output().unwrap());

        let output = sink.0.lock().unwrap().clone();
        assert!(output.starts_with(b"memlog "));
        assert!(output.ends_with(b"Hello\n"));

        // The consumed tail was pushed back: the firmware sees an empty ring.
        assert!(!fw.read_next().unwrap());
        assert!(!monitor.drain_output().unwrap());
    }

    #[test]
    fn overflow_keeps_only_the_most_recent_lines() {
        let (region, addr) = leak_region(shared::layout::CTRL_SIZE + 320);
        let mut fw = LogChannel::create(region).unwrap();
        let (mut monitor, sink) = attach(addr, SessionOptions::default());

        for i in 0..100 {
            fw.puts(&format!("{i}\n")).unwrap();
        }
        // The producer outran us and moved the shared tail; adopt it the
        // way a reconnecting monitor would.
        monitor.synchronize().unwrap();
        monitor.drain_output().unwrap();

        let output = sink.0.lock().unwrap().clone();
        let text = String::from_utf8_lossy(&output);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(*lines.last().unwrap(), "99");
        assert!(!text.contains("memlog"), "version line must have been evicted");
        // Complete lines (the first may be sheared by the eviction) ascend.
        let numbers: Vec<u32> = lines
            .iter()
            .skip(1)
            .filter_map(|l| l.parse().ok())
            .collect();
        for pair in numbers.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert!(numbers[0] > 0);
    }

    #[test]
    fn input_request_round_trip() {
        let (region, addr) = leak_region(4096);
        let mut fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());

        fw.input_request(firmware::ChannelFlags::INPUT_LINE_MODE)
            .unwrap();

        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "answer").unwrap();
        script.flush().unwrap();
        monitor.set_input(InputSource::from_file(script.path(), false).unwrap());

        monitor.refresh().unwrap();
        monitor.handle_input_request().unwrap();

        let mut buf = [0u8; 64];
        let n = fw.input_gets(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"answer\n");

        // Handshake fully unwound on both sides.
        monitor.refresh().unwrap();
        let flags = ChannelFlags::from_bits_retain(monitor.control().flags);
        assert!(!flags.contains(ChannelFlags::INPUT_REQUESTED));
        assert!(!flags.contains(ChannelFlags::INPUT_AVAILABLE));
    }

    #[test]
    fn input_request_from_ended_file_ends_the_session() {
        let (region, addr) = leak_region(4096);
        let mut fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());

        fw.input_request(firmware::ChannelFlags::INPUT_LINE_MODE)
            .unwrap();
        let script = tempfile::NamedTempFile::new().unwrap();
        monitor.set_input(InputSource::from_file(script.path(), false).unwrap());

        monitor.refresh().unwrap();
        assert!(matches!(
            monitor.handle_input_request(),
            Err(MonitorError::InputEnded)
        ));
    }

    #[test]
    fn clear_command_cycle() {
        let (region, addr) = leak_region(4096);
        let mut fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());

        fw.puts("one\n").unwrap();
        fw.puts("two\n").unwrap();
        fw.puts("three\n").unwrap();

        monitor.refresh().unwrap();
        monitor.request_clear().unwrap();
        // The firmware notices the command on its next producer call.
        fw.putc(b'x').unwrap();
        monitor.await_clear(3).unwrap();

        assert!(!fw.read_next().unwrap());
        assert_eq!(monitor.control().out_head, 0);
        assert_eq!(monitor.control().out_tail, 0);
    }

    #[test]
    fn desync_recovery_via_clear() {
        let (region, addr) = leak_region(4096);
        let mut fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());
        fw.puts("before corruption\n").unwrap();

        // Corrupt the consumer index beyond the ring size.
        let bogus = (monitor.control().out_size + 1).to_le_bytes();
        LoopbackBackend
            .write_memory(addr + ctrl::OUT_TAIL as u64, &bogus)
            .unwrap();

        monitor.refresh().unwrap();
        assert!(!monitor.control().is_valid());
        assert!(matches!(
            monitor.synchronize(),
            Err(MonitorError::Desync)
        ));

        monitor.request_clear().unwrap();
        fw.putc(b'x').unwrap();
        monitor.await_clear(3).unwrap();

        monitor.refresh().unwrap();
        assert!(monitor.control().is_valid());
        assert_eq!(monitor.control().out_head, 0);
        assert!(!fw.read_next().unwrap());
    }

    #[test]
    fn exit_request_stops_the_loop() {
        let (region, addr) = leak_region(4096);
        let mut fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());

        fw.request_monitor_exit().unwrap();
        assert_eq!(monitor.poll().unwrap(), PollOutcome::Exit);
    }

    #[test]
    fn snapshot_mode_drains_from_the_local_copy() {
        let (region, addr) = leak_region(8192);
        let mut fw = LogChannel::create(region).unwrap();
        let opts = SessionOptions {
            snapshot: true,
            ..Default::default()
        };
        let (mut monitor, sink) = attach(addr, opts);

        fw.puts("first\n").unwrap();
        fw.puts("second\n").unwrap();
        assert_eq!(monitor.poll().unwrap(), PollOutcome::Continue);

        let output = sink.0.lock().unwrap().clone();
        assert!(output.ends_with(b"first\nsecond\n"));

        // Flag reaction is eventual, not immediate: a request raised after
        // the snapshot is only seen on the next poll.
        fw.request_monitor_exit().unwrap();
        let outcome = monitor.poll().unwrap();
        assert_eq!(outcome, PollOutcome::Exit);
    }

    #[test]
    fn file_send_chunking_end_to_end() {
        let (region, addr) = leak_region(4096);
        let fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());

        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("source.bin");
        let dst_path = dir.path().join("received.bin");
        let payload: Vec<u8> = (0..100u8).collect();
        std::fs::write(&src_path, &payload).unwrap();

        let src = src_path.to_str().unwrap().to_owned();
        let dst = dst_path.to_str().unwrap().to_owned();
        let fw_thread = std::thread::spawn(move || {
            let mut fw = fw;
            fw.send_file(&firmware::transfer::StdFileSystem, &src, &dst, 32)
        });

        let mut chunks = 0;
        while !fw_thread.is_finished() {
            monitor.refresh().unwrap();
            if (monitor.control().flags & ChannelFlags::FILE_SEND_REQ.bits()) != 0 {
                monitor.handle_file_send().unwrap();
                chunks += 1;
            }
            std::thread::yield_now();
        }
        fw_thread.join().unwrap().unwrap();

        assert_eq!(chunks, 4, "100 bytes at chunk size 32");
        assert_eq!(std::fs::read(&dst_path).unwrap(), payload);
    }

    #[test]
    fn file_recv_end_to_end() {
        let (region, addr) = leak_region(4096);
        let fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());

        let dir = tempfile::tempdir().unwrap();
        let host_path = dir.path().join("host.bin");
        let target_path = dir.path().join("target.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(&host_path, &payload).unwrap();

        let host = host_path.to_str().unwrap().to_owned();
        let target = target_path.to_str().unwrap().to_owned();
        let fw_thread = std::thread::spawn(move || {
            let mut fw = fw;
            fw.recv_file(&firmware::transfer::StdFileSystem, &target, &host, 0)
        });

        while !fw_thread.is_finished() {
            monitor.refresh().unwrap();
            if (monitor.control().flags & ChannelFlags::FILE_RECV_REQ.bits()) != 0 {
                monitor.handle_file_recv().unwrap();
            }
            std::thread::yield_now();
        }
        fw_thread.join().unwrap().unwrap();

        assert_eq!(std::fs::read(&target_path).unwrap(), payload);
    }

    #[test]
    fn recv_of_missing_host_file_aborts_cleanly() {
        let (region, addr) = leak_region(4096);
        let fw = LogChannel::create(region).unwrap();
        let (mut monitor, _sink) = attach(addr, SessionOptions::default());

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.bin").to_str().unwrap().to_owned();
        let fw_thread = std::thread::spawn(move || {
            let mut fw = fw;
            fw.recv_file(
                &firmware::transfer::StdFileSystem,
                &target,
                "/definitely/not/here.bin",
                64,
            )
        });

        while !fw_thread.is_finished() {
            monitor.refresh().unwrap();
            if (monitor.control().flags & ChannelFlags::FILE_RECV_REQ.bits()) != 0 {
                monitor.handle_file_recv().unwrap();
            }
            std::thread::yield_now();
        }
        let err = fw_thread.join().unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::HostStatus(s) if s == STATUS_ENOENT));
    }

    #[test]
    fn blocking_drain_takes_and_releases_the_busy_flag() {
        let (region, addr) = leak_region(4096);
        let mut fw = LogChannel::create(region).unwrap();
        let opts = SessionOptions {
            blocking: true,
            ..Default::default()
        };
        let (mut monitor, sink) = attach(addr, opts);

        fw.puts("locked read\n").unwrap();
        monitor.refresh().unwrap();
        monitor.drain_output().unwrap();

        assert!(sink.0.lock().unwrap().ends_with(b"locked read\n"));
        monitor.refresh().unwrap();
        let flags = ChannelFlags::from_bits_retain(monitor.control().flags);
        assert!(!flags.contains(ChannelFlags::BUSY));
    }
}
