//! GDB remote-serial backend.
//!
//! Packets are framed `$<payload>#<checksum>` with a two-digit hex checksum
//! (sum of payload bytes mod 256) and acknowledged with `+`/`-`. Memory is
//! read with `m<addr>,<len>` and written with `M<addr>,<len>:<hex>`.
//!
//! The extra contract of this transport is halt semantics: the target must
//! be stopped for memory access. The backend tracks a `running` flag,
//! interrupts with the 0x03 byte (waiting for the stop reply) before an
//! operation, and resumes with `c` afterwards and from `on_idle`, so the
//! firmware actually gets to execute between polls. Stop replies can also
//! arrive unsolicited; when one shows up in place of memory data it is
//! drained and the operation retried once.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use shared::errors::BackendError;

use super::MemoryBackend;

const IO_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// Grace period after the initial `c`, letting a freshly spawned target
/// reach its main loop before the first halt.
const STARTUP_RUN: Duration = Duration::from_secs(1);

/// Conservative per-`M`-packet payload limit.
const MAX_WRITE_CHUNK: usize = 1024;

pub struct GdbBackend {
    stream: TcpStream,
    running: bool,
}

impl GdbBackend {
    pub fn connect(host: &str, port: u16) -> Result<Self, BackendError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port)).map_err(|source| BackendError::Connect {
            addr: addr.clone(),
            source,
        })?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        let mut backend = Self {
            stream,
            running: false,
        };

        // Some servers push an unsolicited stop reply right after accept.
        backend.drain_pending()?;

        // A gdbserver-launched process sits at its entry point; run it so
        // the firmware can initialize, then halt for the first poll.
        backend.send_packet("c")?;
        backend.running = true;
        std::thread::sleep(STARTUP_RUN);
        backend.interrupt()?;

        log::info!("connected to GDB server at {addr}, target halted");
        Ok(backend)
    }

    fn send_packet(&mut self, payload: &str) -> Result<(), BackendError> {
        let frame = format!("${payload}#{:02x}", checksum(payload.as_bytes()));
        log::trace!("gdb send: {frame}");
        self.stream.write_all(frame.as_bytes())?;
        Ok(())
    }

    /// Reads one framed packet, verifying its checksum and acking it.
    /// Leading non-frame bytes (stray acks) are skipped.
    fn recv_packet(&mut self) -> Result<String, BackendError> {
        let mut byte = [0u8; 1];
        loop {
            self.read_exact(&mut byte)?;
            if byte[0] == b'$' {
                break;
            }
        }

        let mut payload = Vec::new();
        loop {
            self.read_exact(&mut byte)?;
            if byte[0] == b'#' {
                break;
            }
            payload.push(byte[0]);
            if payload.len() > 1 << 20 {
                return Err(BackendError::MalformedReply("unterminated packet".into()));
            }
        }

        let mut cksum = [0u8; 2];
        self.read_exact(&mut cksum)?;
        let received = u8::from_str_radix(std::str::from_utf8(&cksum).unwrap_or("zz"), 16)
            .map_err(|_| BackendError::MalformedReply("bad checksum digits".into()))?;
        let computed = checksum(&payload);
        if received != computed {
            self.stream.write_all(b"-")?;
            return Err(BackendError::Protocol(format!(
                "checksum mismatch: received {received:02x}, computed {computed:02x}"
            )));
        }
        self.stream.write_all(b"+")?;

        let text = String::from_utf8_lossy(&payload).into_owned();
        log::trace!("gdb recv: ${text}#{received:02x}");
        Ok(text)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BackendError> {
        self.stream.read_exact(buf).map_err(BackendError::Io)
    }

    /// Waits for the server's `+`; anything else in between is skipped the
    /// way stale acks from `c` commands must be.
    fn wait_ack(&mut self) -> Result<(), BackendError> {
        let mut byte = [0u8; 1];
        loop {
            self.read_exact(&mut byte)?;
            match byte[0] {
                b'+' => return Ok(()),
                b'-' => return Err(BackendError::Protocol("server sent NAK".into())),
                _ => {}
            }
        }
    }

    /// Discards buffered packets (unsolicited stop replies and the like).
    fn drain_pending(&mut self) -> Result<usize, BackendError> {
        self.stream.set_read_timeout(Some(DRAIN_TIMEOUT))?;
        let mut count = 0;
        for _ in 0..5 {
            match self.recv_packet() {
                Ok(p) => {
                    log::debug!("drained pending packet: {p}");
                    count += 1;
                }
                Err(_) => break,
            }
        }
        self.stream.set_read_timeout(Some(IO_TIMEOUT))?;
        Ok(count)
    }

    /// Halts a running target and consumes the stop reply.
    fn interrupt(&mut self) -> Result<(), BackendError> {
        if !self.running {
            return Ok(());
        }
        self.stream.write_all(&[0x03])?;
        loop {
            let reply = self.recv_packet()?;
            if is_stop_reply(&reply) {
                break;
            }
            log::debug!("ignoring non-stop packet while halting: {reply}");
        }
        self.running = false;
        log::trace!("target interrupted");
        Ok(())
    }

    /// Resumes execution. The server only reports back at the next stop, so
    /// no reply is awaited here.
    fn resume(&mut self) -> Result<(), BackendError> {
        if self.running {
            return Ok(());
        }
        self.send_packet("c")?;
        self.running = true;
        log::trace!("target resumed");
        Ok(())
    }

    /// Runs `op` with the target halted, restoring the previous run state.
    fn while_halted<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        let was_running = self.running;
        if was_running {
            self.interrupt()?;
        }
        let result = op(self);
        if was_running {
            let _ = self.resume();
        }
        result
    }

    /// Sends a command and fetches its reply, retrying once if an
    /// asynchronous stop reply lands where the data should be.
    fn transact(&mut self, command: &str) -> Result<String, BackendError> {
        self.send_packet(command)?;
        self.wait_ack()?;
        let mut reply = self.recv_packet()?;
        if is_stop_reply(&reply) {
            log::warn!("stop reply `{reply}` instead of data, retrying");
            self.drain_pending()?;
            self.send_packet(command)?;
            self.wait_ack()?;
            reply = self.recv_packet()?;
        }
        if reply.starts_with('E') && reply.len() == 3 {
            return Err(BackendError::Target(reply));
        }
        Ok(reply)
    }
}

impl MemoryBackend for GdbBackend {
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BackendError> {
        let len = buf.len();
        self.while_halted(|backend| {
            let reply = backend.transact(&format!("m{addr:x},{len:x}"))?;
            let decoded = decode_rle(&reply)?;
            if decoded.len() < len * 2 {
                return Err(BackendError::Short {
                    expected: len,
                    got: decoded.len() / 2,
                });
            }
            let bytes = hex::decode(&decoded[..len * 2])
                .map_err(|e| BackendError::MalformedReply(format!("bad hex payload: {e}")))?;
            buf.copy_from_slice(&bytes);
            Ok(())
        })
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), BackendError> {
        self.while_halted(|backend| {
            let mut offset = 0usize;
            for chunk in data.chunks(MAX_WRITE_CHUNK) {
                let command = format!(
                    "M{:x},{:x}:{}",
                    addr + offset as u64,
                    chunk.len(),
                    hex::encode(chunk)
                );
                let reply = backend.transact(&command)?;
                if reply != "OK" {
                    return Err(BackendError::Target(reply));
                }
                offset += chunk.len();
            }
            Ok(())
        })
    }

    fn on_idle(&mut self) -> Result<(), BackendError> {
        self.resume()
    }

    fn disconnect(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        log::info!("disconnected from GDB server");
    }
}

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// `S<sig>` / `T<sig>...` packets announce that the target halted.
fn is_stop_reply(payload: &str) -> bool {
    let bytes = payload.as_bytes();
    bytes.len() >= 3
        && (bytes[0] == b'S' || bytes[0] == b'T')
        && bytes[1].is_ascii_hexdigit()
        && bytes[2].is_ascii_hexdigit()
}

/// Expands run-length encoding: `*` followed by a count character means
/// "repeat the previous character count-minus-29 times".
fn decode_rle(input: &str) -> Result<String, BackendError> {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'*' {
            let Some(&count_char) = bytes.get(i + 1) else {
                return Err(BackendError::MalformedReply(
                    "run-length marker at end of payload".into(),
                ));
            };
            let repeat = count_char as i32 - 29;
            let Some(prev) = out.chars().last() else {
                return Err(BackendError::MalformedReply(
                    "run-length marker with no preceding character".into(),
                ));
            };
            if repeat <= 0 {
                return Err(BackendError::MalformedReply(format!(
                    "invalid run length {repeat}"
                )));
            }
            for _ in 0..repeat {
                out.push(prev);
            }
            i += 2;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    Ok(out)
}
