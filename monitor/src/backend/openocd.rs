//! OpenOCD telnet backend.
//!
//! Talks to the line-oriented command interpreter on the debug server's
//! telnet port. Reads use `mdw` and parse the `0xADDR: w0 w1 ...` hex dump
//! (the interpreter echoes the command and terminates responses with a
//! `> ` prompt); writes use one `mww` per word, with read-modify-write at
//! unaligned edges. The interpreter is word-addressed and 32-bit, so target
//! addresses are truncated here.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use shared::errors::BackendError;

use super::MemoryBackend;

const PROMPT: &str = "> ";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes moved per `mdw` command; larger reads are split.
const MAX_READ_BYTES: usize = 1024;

pub struct OpenocdBackend {
    stream: TcpStream,
}

impl OpenocdBackend {
    pub fn connect(host: &str, port: u16) -> Result<Self, BackendError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port)).map_err(|source| BackendError::Connect {
            addr: addr.clone(),
            source,
        })?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;

        let mut backend = Self { stream };
        // The interpreter greets with a banner ending in its prompt.
        let banner = backend.read_until_prompt()?;
        log::info!("connected to OpenOCD at {addr}");
        log::debug!("banner: {}", banner.trim());
        Ok(backend)
    }

    /// Sends one command line and returns everything up to the next prompt,
    /// with the command echo stripped.
    fn send_command(&mut self, cmd: &str) -> Result<String, BackendError> {
        log::trace!("openocd> {cmd}");
        self.stream.write_all(cmd.as_bytes())?;
        self.stream.write_all(b"\n")?;
        let raw = self.read_until_prompt()?;
        let body = raw
            .lines()
            .filter(|line| !line.contains(cmd))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(body)
    }

    fn read_until_prompt(&mut self) -> Result<String, BackendError> {
        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(BackendError::Protocol(
                    "connection closed by debug server".into(),
                ));
            }
            response.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&response);
            if let Some(pos) = text.rfind(PROMPT) {
                let mut body = text.into_owned();
                body.truncate(pos);
                return Ok(body);
            }
            if response.len() > 1 << 20 {
                return Err(BackendError::MalformedReply(
                    "response exceeded 1 MiB without a prompt".into(),
                ));
            }
        }
    }

    /// One aligned `mdw` transaction covering `len` bytes at `addr`.
    fn read_chunk(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BackendError> {
        let align_off = (addr % 4) as usize;
        let aligned = addr - align_off as u32;
        let words_needed = (align_off + buf.len()).div_ceil(4);

        let response = self.send_command(&format!("mdw 0x{aligned:08x} {words_needed}"))?;
        let bytes = parse_mdw_dump(&response);
        if bytes.len() < align_off + buf.len() {
            return Err(BackendError::Short {
                expected: align_off + buf.len(),
                got: bytes.len(),
            });
        }
        buf.copy_from_slice(&bytes[align_off..align_off + buf.len()]);
        Ok(())
    }
}

impl MemoryBackend for OpenocdBackend {
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), BackendError> {
        let mut done = 0usize;
        while done < buf.len() {
            let n = (buf.len() - done).min(MAX_READ_BYTES);
            self.read_chunk((addr + done as u64) as u32, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), BackendError> {
        if data.is_empty() {
            return Ok(());
        }
        let addr = addr as u32;
        let head_off = (addr % 4) as usize;
        let aligned_start = addr - head_off as u32;
        let total = head_off + data.len();
        let word_count = total.div_ceil(4);

        // Unaligned edges keep their surrounding bytes via read-modify-write.
        let mut bytes = vec![0u8; word_count * 4];
        if head_off != 0 {
            self.read_chunk(aligned_start, &mut bytes[..4])?;
        }
        if total % 4 != 0 && (word_count > 1 || head_off == 0) {
            let last = (word_count - 1) * 4;
            self.read_chunk(aligned_start + last as u32, &mut bytes[last..last + 4])?;
        }
        bytes[head_off..head_off + data.len()].copy_from_slice(data);

        for (i, word) in bytes.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            let cmd = format!("mww 0x{:08x} 0x{value:08x}", aligned_start + (i * 4) as u32);
            let reply = self.send_command(&cmd)?;
            if reply.to_ascii_lowercase().contains("error") {
                return Err(BackendError::Target(reply.trim().into()));
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        log::info!("disconnected from OpenOCD");
    }
}

/// Parses `0xADDR: w0 w1 ...` dump lines into little-endian bytes. Echo
/// lines, blank lines, and anything that is not a dump row are skipped.
fn parse_mdw_dump(response: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with("0x") || line.contains("mdw") {
            continue;
        }
        let Some((_, values)) = line.split_once(':') else {
            continue;
        };
        for token in values.split_whitespace() {
            if token.len() == 8
                && let Ok(word) = u32::from_str_radix(token, 16)
            {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
    }
    bytes
}
