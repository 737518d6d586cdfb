//! Chunked file transfer between the target filesystem and the host,
//! mediated by the monitor.
//!
//! The firmware publishes a descriptor (path on the host, chunk buffer
//! address, sizes) through the control block's `file_transfer` pointer, then
//! drives one `FILE_SEND_REQ`/`FILE_RECV_REQ` handshake per chunk. The
//! monitor acknowledges a chunk by clearing the request bit after it has
//! moved the bytes; a cleared bit with a negative `status` aborts the
//! transfer.
//!
//! File access goes through the [`FileSystem`] seam so targets without a
//! real filesystem (and tests) can plug their own; the `std` feature ships
//! [`StdFileSystem`]. Chunk buffers are heap-allocated by default, or
//! caller-supplied via the `*_in` variants for allocation-free firmware.

use alloc::boxed::Box;
use alloc::vec;
use core::ptr;
use core::sync::atomic::{Ordering, fence};

use shared::errors::ChannelError;
use shared::flags::ChannelFlags;
use shared::layout::{DEFAULT_CHUNK_SIZE, FILE_BLOCK_SIZE, FileTransferBlock, ctrl};

use crate::channel::LogChannel;

/// Handshake spins tolerated before a send chunk counts as unacknowledged.
const SEND_ACK_SPIN_LIMIT: u32 = 1_000_000;

/// Receive waits longer: the host may be opening and seeking a cold file.
const RECV_ACK_SPIN_LIMIT: u32 = 10_000_000;

/// One open file on the target side of a transfer.
pub trait TargetFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError>;
    fn size(&mut self) -> Result<u64, ChannelError>;
}

/// The firmware's view of its filesystem.
pub trait FileSystem {
    type File: TargetFile;

    fn open_read(&self, path: &str) -> Result<Self::File, ChannelError>;
    fn open_write(&self, path: &str) -> Result<Self::File, ChannelError>;
}

impl LogChannel {
    /// Sends `target_path` to the host as `host_path`, allocating a chunk
    /// buffer of `chunk_size` (0 selects the 512-byte default).
    pub fn send_file<F: FileSystem>(
        &mut self,
        fs: &F,
        target_path: &str,
        host_path: &str,
        chunk_size: u32,
    ) -> Result<(), ChannelError> {
        let size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let mut chunk = vec![0u8; size as usize];
        self.send_file_in(fs, target_path, host_path, &mut chunk)
    }

    /// Fetches `host_path` from the host into `target_path`.
    pub fn recv_file<F: FileSystem>(
        &mut self,
        fs: &F,
        target_path: &str,
        host_path: &str,
        chunk_size: u32,
    ) -> Result<(), ChannelError> {
        let size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let mut chunk = vec![0u8; size as usize];
        self.recv_file_in(fs, target_path, host_path, &mut chunk)
    }

    /// [`send_file`](Self::send_file) with a caller-supplied chunk buffer;
    /// the buffer's length is the chunk size.
    pub fn send_file_in<F: FileSystem>(
        &mut self,
        fs: &F,
        target_path: &str,
        host_path: &str,
        chunk: &mut [u8],
    ) -> Result<(), ChannelError> {
        if !self.is_valid() {
            return Err(ChannelError::InvalidContext);
        }
        if chunk.is_empty() {
            return Err(ChannelError::Ring(shared::errors::RingError::NoSpace {
                needed: 1,
                available: 0,
            }));
        }

        let mut file = fs.open_read(target_path)?;
        let total = file.size()?.min(u64::from(u32::MAX)) as u32;

        let mut desc = FileTransferBlock::default();
        desc.set_host_path(host_path)?;
        desc.buffer_addr = chunk.as_ptr() as usize as u64;
        desc.chunk_size = chunk.len() as u32;
        desc.total_size = total;

        let mut desc_mem: Box<[u8; FILE_BLOCK_SIZE]> = Box::new([0u8; FILE_BLOCK_SIZE]);
        let desc_ptr = desc_mem.as_mut_ptr();
        write_descriptor(desc_ptr, &desc);
        self.with_lock(|ch| ch.store64(ctrl::FILE_TRANSFER, desc_ptr as usize as u64));

        let result = (|| {
            let mut offset: u64 = 0;
            while offset < u64::from(total) {
                let n = file.read(chunk)?;
                if n == 0 {
                    log::warn!("file shrank mid-transfer at offset {offset}");
                    break;
                }
                desc.chunk_size = n as u32;
                desc.offset = offset;
                write_descriptor(desc_ptr, &desc);
                fence(Ordering::Release);
                self.set_flag(ChannelFlags::FILE_SEND_REQ);

                self.wait_flag_clear(ChannelFlags::FILE_SEND_REQ, SEND_ACK_SPIN_LIMIT)?;
                fence(Ordering::Acquire);
                let ack = read_descriptor(desc_ptr);
                if ack.status < 0 {
                    return Err(ChannelError::HostStatus(ack.status));
                }
                offset += n as u64;
                desc.chunk_no += 1;
            }
            Ok(())
        })();

        self.end_transfer(ChannelFlags::FILE_SEND_REQ);
        result
    }

    /// [`recv_file`](Self::recv_file) with a caller-supplied chunk buffer.
    pub fn recv_file_in<F: FileSystem>(
        &mut self,
        fs: &F,
        target_path: &str,
        host_path: &str,
        chunk: &mut [u8],
    ) -> Result<(), ChannelError> {
        if !self.is_valid() {
            return Err(ChannelError::InvalidContext);
        }
        if chunk.is_empty() {
            return Err(ChannelError::Ring(shared::errors::RingError::NoSpace {
                needed: 1,
                available: 0,
            }));
        }

        let mut file = fs.open_write(target_path)?;

        let mut desc = FileTransferBlock::default();
        desc.set_host_path(host_path)?;
        desc.buffer_addr = chunk.as_ptr() as usize as u64;
        desc.chunk_size = chunk.len() as u32;

        let mut desc_mem: Box<[u8; FILE_BLOCK_SIZE]> = Box::new([0u8; FILE_BLOCK_SIZE]);
        let desc_ptr = desc_mem.as_mut_ptr();
        write_descriptor(desc_ptr, &desc);
        self.with_lock(|ch| ch.store64(ctrl::FILE_TRANSFER, desc_ptr as usize as u64));
        self.set_flag(ChannelFlags::FILE_RECV_REQ);

        let result = (|| {
            let mut offset: u64 = 0;
            let mut expected_chunk: u32 = 0;
            loop {
                self.wait_flag_clear(ChannelFlags::FILE_RECV_REQ, RECV_ACK_SPIN_LIMIT)?;
                fence(Ordering::Acquire);
                let reply = read_descriptor(desc_ptr);
                if reply.status < 0 {
                    return Err(ChannelError::HostStatus(reply.status));
                }
                if reply.chunk_no != expected_chunk {
                    return Err(ChannelError::ChunkMismatch {
                        expected: expected_chunk,
                        got: reply.chunk_no,
                    });
                }
                if reply.chunk_size == 0 {
                    break; // end-of-transfer sentinel
                }
                let got = reply.chunk_size as usize;
                if got > chunk.len() {
                    return Err(ChannelError::Corrupted);
                }
                // The host wrote through the debug link; re-read volatile.
                let base = chunk.as_mut_ptr();
                for i in 0..got {
                    chunk[i] = unsafe { ptr::read_volatile(base.add(i)) };
                }
                file.write(&chunk[..got])?;
                offset += got as u64;
                if reply.total_size > 0 && offset >= u64::from(reply.total_size) {
                    break;
                }
                expected_chunk += 1;
                desc.offset = offset;
                desc.chunk_no = expected_chunk;
                desc.chunk_size = chunk.len() as u32;
                desc.total_size = reply.total_size;
                write_descriptor(desc_ptr, &desc);
                fence(Ordering::Release);
                self.set_flag(ChannelFlags::FILE_RECV_REQ);
            }
            Ok(())
        })();

        self.end_transfer(ChannelFlags::FILE_RECV_REQ);
        result
    }

    fn wait_flag_clear(&self, flag: ChannelFlags, limit: u32) -> Result<(), ChannelError> {
        let mut spins = 0u32;
        while self.flags().contains(flag) {
            if spins >= limit {
                log::warn!("transfer acknowledgement timed out ({flag:?})");
                return Err(ChannelError::AckTimeout);
            }
            spins += 1;
            ack_pause();
        }
        Ok(())
    }

    /// Retracts the descriptor and the request bit whether the transfer
    /// finished or died.
    fn end_transfer(&mut self, flag: ChannelFlags) {
        self.with_lock(|ch| {
            ch.store64(ctrl::FILE_TRANSFER, 0);
            ch.clear_flag(flag);
        });
    }
}

fn write_descriptor(ptr: *mut u8, desc: &FileTransferBlock) {
    let raw = desc.encode();
    for (i, b) in raw.iter().enumerate() {
        unsafe { ptr::write_volatile(ptr.add(i), *b) };
    }
}

fn read_descriptor(ptr: *const u8) -> FileTransferBlock {
    let mut raw = [0u8; FILE_BLOCK_SIZE];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = unsafe { ptr::read_volatile(ptr.add(i)) };
    }
    FileTransferBlock::parse(&raw)
}

#[cfg(feature = "std")]
fn ack_pause() {
    std::thread::yield_now();
}

#[cfg(not(feature = "std"))]
fn ack_pause() {
    core::hint::spin_loop();
}

/// [`FileSystem`] over `std::fs`, for hosted targets and tests.
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

#[cfg(feature = "std")]
pub struct StdFile(std::fs::File);

#[cfg(feature = "std")]
impl TargetFile for StdFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        use std::io::Read as _;
        Ok(self.0.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        use std::io::Write as _;
        Ok(self.0.write(buf)?)
    }

    fn size(&mut self) -> Result<u64, ChannelError> {
        Ok(self.0.metadata()?.len())
    }
}

#[cfg(feature = "std")]
impl FileSystem for StdFileSystem {
    type File = StdFile;

    fn open_read(&self, path: &str) -> Result<Self::File, ChannelError> {
        Ok(StdFile(std::fs::File::open(path)?))
    }

    fn open_write(&self, path: &str) -> Result<Self::File, ChannelError> {
        Ok(StdFile(std::fs::File::create(path)?))
    }
}
