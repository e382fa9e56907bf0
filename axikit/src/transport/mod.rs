//! Transport contracts: a command transport carries request/reply byte
//! exchanges plus typed register I/O; a stream transport carries bulk DMA
//! into pre-allocated buffers.
//!
//! The register operations have provided implementations speaking the
//! virtual-register frame protocol over `transact`; that is what makes a
//! plain byte pipe (TCP, serial) look like a register bus. The PCIe command
//! transport overrides all of them with real MMIO.

use std::time::{Duration, Instant};

use crate::api::KitConfig;
use crate::frame::{self, VRegCmd, HEAD_LEN};
use crate::{Error, Result};

pub mod pcie;
pub mod serial;
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

/// How `transact` should read the reply.
#[derive(Clone, Copy, Debug)]
pub enum ReplyMode {
    /// Read a 16-byte head, verify magic and the echoed command id and
    /// serial against the request, then read the body length it announces.
    HeadChecked,
    /// Read exactly this many bytes, no interpretation.
    Fixed(usize),
}

/// Address walk for multi-word register I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkMode {
    /// Consecutive addresses: B, B+W, B+2W, …
    Increment,
    /// Every word goes to the base address.
    Loop,
}

/// Register access exposed by stream transports that also reach the
/// device's register file (the PCIe one does; TCP streaming does not).
/// The virtual-channel middleware requires this capability.
pub trait RegOps {
    fn reg_write(&self, addr: u32, value: u32) -> Result<()>;
    fn reg_read(&self, addr: u32) -> Result<u32>;
}

/// Backing store for a stream buffer that wraps caller memory instead of
/// driver-allocated pinned memory.
pub struct BufBacking(pub(crate) Backing);

pub(crate) enum Backing {
    Words(Vec<u32>),
    Raw { addr: usize, len_words: usize },
}

impl BufBacking {
    /// Wrap a caller-owned word vector. Ownership moves to the transport
    /// until the buffer is freed.
    pub fn words(words: Vec<u32>) -> BufBacking {
        BufBacking(Backing::Words(words))
    }

    /// Wrap raw caller memory. The transport never deallocates it.
    ///
    /// # Safety
    /// `ptr` must point to at least `len_words` writable u32 words that stay
    /// valid (and, for DMA transports, pinned) until `free_buffer`, and must
    /// not be touched by other code while a transfer is in flight.
    pub unsafe fn raw(ptr: *mut u32, len_words: usize) -> BufBacking {
        BufBacking(Backing::Raw {
            addr: ptr as usize,
            len_words,
        })
    }
}

// Transfers poll for cancellation at this granularity.
pub(crate) const WAIT_SLICE: Duration = Duration::from_secs(1);

pub trait CmdTransport: Send + Sync {
    /// Bring the link up. Which `KitConfig` fields matter depends on the
    /// transport flavor.
    fn accept(&self, cfg: &KitConfig) -> Result<()>;
    /// Tear the link down; safe to call twice.
    fn close(&self);
    fn set_timeout(&self, timeout: Duration);
    /// Deliver every byte or fail with `SendTimeout`.
    fn send_bytes(&self, data: &[u8]) -> Result<usize>;
    /// Return exactly `len` bytes or fail with `RecvTimeout`.
    fn recv_bytes(&self, len: usize) -> Result<Vec<u8>>;
    /// One request/reply exchange under a single acquisition of the
    /// per-connection lock: no other request interleaves.
    fn transact(&self, request: &[u8], mode: ReplyMode) -> Result<Vec<u8>>;
    /// Monotone exchange number, stamped into frame headers. Starts at 0.
    fn next_serial(&self) -> u32;

    fn write(&self, addr: u32, value: &[u8]) -> Result<()> {
        let value = pad_to(value, 4);
        let req = frame::vreg_frame(VRegCmd::WriteReg, self.next_serial(), addr, &value);
        let reply = self.transact(&req, ReplyMode::HeadChecked)?;
        vreg_payload(&reply, "write-reg").map(|_| ())
    }

    fn read(&self, addr: u32) -> Result<u32> {
        let req = frame::vreg_frame(VRegCmd::ReadReg, self.next_serial(), addr, &[]);
        let reply = self.transact(&req, ReplyMode::HeadChecked)?;
        let payload = vreg_payload(&reply, "read-reg")?;
        if payload.len() < 4 {
            return Err(Error::MalformedFrame(format!(
                "read-reg payload is {} bytes",
                payload.len()
            )));
        }
        Ok(u32::from_le_bytes(payload[..4].try_into().unwrap()))
    }

    /// Ordered vector of single writes.
    fn multi_write(&self, regs: &[(u32, [u8; 4])]) -> Result<()> {
        for (addr, value) in regs {
            self.write(*addr, value)?;
        }
        Ok(())
    }

    /// Ordered vector of single reads.
    fn multi_read(&self, addrs: &[u32]) -> Result<Vec<u32>> {
        addrs.iter().map(|addr| self.read(*addr)).collect()
    }

    /// Write `data` across consecutive registers starting at `addr`,
    /// `reg_width` bytes per register, zero-padded to a register multiple.
    fn increment_write(&self, addr: u32, data: &[u8], reg_width: usize) -> Result<()> {
        let data = pad_to(data, reg_width);
        for (i, chunk) in data.chunks(reg_width).enumerate() {
            let reg = addr + (i * reg_width) as u32;
            let req = frame::vreg_frame(VRegCmd::IncrWrite, self.next_serial(), reg, chunk);
            let reply = self.transact(&req, ReplyMode::HeadChecked)?;
            vreg_payload(&reply, "increment-write")?;
        }
        Ok(())
    }

    /// Read `byte_len` bytes from consecutive registers starting at `addr`.
    fn increment_read(&self, addr: u32, byte_len: usize, reg_width: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(byte_len);
        for i in 0..byte_len.div_ceil(reg_width) {
            let reg = addr + (i * reg_width) as u32;
            let req = frame::vreg_frame(VRegCmd::IncrRead, self.next_serial(), reg, &[]);
            let reply = self.transact(&req, ReplyMode::HeadChecked)?;
            let payload = vreg_payload(&reply, "increment-read")?;
            out.extend_from_slice(&payload[..payload.len().min(reg_width)]);
        }
        out.truncate(byte_len);
        Ok(out)
    }

    /// Write every register-width chunk of `data` to the same address.
    fn loop_write(&self, addr: u32, data: &[u8], reg_width: usize) -> Result<()> {
        let data = pad_to(data, reg_width);
        for chunk in data.chunks(reg_width) {
            let req = frame::vreg_frame(VRegCmd::LoopWrite, self.next_serial(), addr, chunk);
            let reply = self.transact(&req, ReplyMode::HeadChecked)?;
            vreg_payload(&reply, "loop-write")?;
        }
        Ok(())
    }

    /// Read `byte_len` bytes by hammering the same address.
    fn loop_read(&self, addr: u32, byte_len: usize, reg_width: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(byte_len);
        for _ in 0..byte_len.div_ceil(reg_width) {
            let req = frame::vreg_frame(VRegCmd::LoopRead, self.next_serial(), addr, &[]);
            let reply = self.transact(&req, ReplyMode::HeadChecked)?;
            let payload = vreg_payload(&reply, "loop-read")?;
            out.extend_from_slice(&payload[..payload.len().min(reg_width)]);
        }
        out.truncate(byte_len);
        Ok(out)
    }
}

pub trait StreamTransport: Send + Sync {
    fn accept(&self, cfg: &KitConfig) -> Result<()>;
    fn close(&self);
    /// Allocate (or wrap) a buffer of `byte_len` bytes; `byte_len` must be a
    /// multiple of 4.
    fn alloc_buffer(&self, byte_len: usize, backing: Option<BufBacking>) -> Result<u32>;
    /// Release a buffer. `BufferBusy` while a DMA is outstanding; never
    /// deallocates caller-supplied memory.
    fn free_buffer(&self, buf: u32) -> Result<()>;
    /// Word view of the buffer's first `byte_len` bytes.
    fn get_buffer(&self, buf: u32, byte_len: usize) -> Result<Vec<u32>>;
    /// Start a non-blocking host-to-device transfer.
    fn open_send(&self, chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()>;
    /// Start a non-blocking device-to-host transfer. One DMA per handle.
    fn open_recv(&self, chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()>;
    /// Block until done or `timeout`; returns bytes delivered so far.
    fn wait_stream(&self, buf: u32, timeout: Duration) -> Result<usize>;
    /// Cancel the in-flight transfer; whatever already landed stays readable.
    fn break_stream(&self, buf: u32) -> Result<usize>;
    /// Register capability for the virtual-channel middleware.
    fn reg_ops(&self) -> Option<&dyn RegOps> {
        None
    }

    /// Open + wait until `byte_len` bytes arrive, polling `stop` between
    /// waits. Returns the partial count if stopped, `DmaTimeout` past the
    /// deadline.
    fn stream_recv(
        &self,
        chnl: u32,
        buf: u32,
        byte_len: usize,
        byte_offset: usize,
        stop: &dyn Fn() -> bool,
        timeout: Duration,
    ) -> Result<usize> {
        self.open_recv(chnl, buf, byte_len, byte_offset)?;
        self.drive_stream(buf, byte_len, stop, timeout)
    }

    /// Send-direction twin of `stream_recv`.
    fn stream_send(
        &self,
        chnl: u32,
        buf: u32,
        byte_len: usize,
        byte_offset: usize,
        stop: &dyn Fn() -> bool,
        timeout: Duration,
    ) -> Result<usize> {
        self.open_send(chnl, buf, byte_len, byte_offset)?;
        self.drive_stream(buf, byte_len, stop, timeout)
    }

    /// Wait loop shared by the convenience calls.
    fn drive_stream(
        &self,
        buf: u32,
        byte_len: usize,
        stop: &dyn Fn() -> bool,
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if stop() {
                return self.break_stream(buf);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let done = self.wait_stream(buf, WAIT_SLICE.min(remaining))?;
            if done >= byte_len {
                return Ok(done);
            }
            if Instant::now() >= deadline {
                self.break_stream(buf)?;
                return Err(Error::DmaTimeout);
            }
        }
    }
}

/// Reply-side half of a `transact`, shared by the concrete transports:
/// `recv` must return exactly the requested byte count (or fail).
pub(crate) fn read_reply<R>(mut recv: R, request: &[u8], mode: ReplyMode) -> Result<Vec<u8>>
where
    R: FnMut(usize) -> Result<Vec<u8>>,
{
    match mode {
        ReplyMode::Fixed(n) => recv(n),
        ReplyMode::HeadChecked => {
            let req_head = frame::FrameHead::unpack(request)?;
            let head_bytes = recv(HEAD_LEN)?;
            let reply_head = frame::FrameHead::unpack(&head_bytes)?;
            let total = frame::check_reply_head(&req_head, &reply_head)?;
            let mut out = head_bytes;
            out.extend_from_slice(&recv(total - HEAD_LEN)?);
            Ok(out)
        }
    }
}

/// Zero-pad to a multiple of `width`.
pub(crate) fn pad_to(data: &[u8], width: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    let rem = out.len() % width;
    if rem != 0 {
        out.resize(out.len() + width - rem, 0);
    }
    out
}

/// Split a register-class reply into status + payload; non-zero status is a
/// device-side failure.
fn vreg_payload<'a>(reply: &'a [u8], what: &str) -> Result<&'a [u8]> {
    let body = &reply[HEAD_LEN.min(reply.len())..];
    if body.len() < 4 {
        return Err(Error::MalformedFrame(format!(
            "{} reply body is {} bytes, no room for a status word",
            what,
            body.len()
        )));
    }
    let status = u32::from_le_bytes(body[..4].try_into().unwrap());
    if status != 0 {
        return Err(Error::Command {
            name: what.to_string(),
            detail: format!("device status {:#x}", status),
        });
    }
    Ok(&body[4..])
}

#[cfg(test)]
mod tests {
    use super::mock::MockCmd;
    use super::*;
    use crate::frame::{FrameHead, REPLY_MAGIC};

    fn reply_frame(req: &[u8], status: u32, payload: &[u8]) -> Vec<u8> {
        let req_head = FrameHead::unpack(req).unwrap();
        let head = FrameHead {
            magic: REPLY_MAGIC,
            cmd_id: req_head.cmd_id,
            serial: req_head.serial,
            total_len: (HEAD_LEN + 4 + payload.len()) as u32,
        };
        let mut out = head.pack().to_vec();
        out.extend_from_slice(&status.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn nonzero_status_is_a_command_error() {
        let itf = MockCmd::new();
        itf.script(|req| reply_frame(req, 1, &[]));
        match itf.read(0x10) {
            Err(Error::Command { name, .. }) => assert_eq!(name, "read-reg"),
            other => panic!("expected Command error, got {:?}", other),
        }
    }

    #[test]
    fn read_decodes_payload_word() {
        let itf = MockCmd::new();
        itf.script(|req| reply_frame(req, 0, &0xA5A5_0001u32.to_le_bytes()));
        assert_eq!(itf.read(0x10).unwrap(), 0xA5A5_0001);
    }

    #[test]
    fn increment_read_walks_three_registers() {
        // 10 bytes at base 0x20 with width 4: requests at 0x20, 0x24, 0x28
        let itf = MockCmd::new();
        for _ in 0..3 {
            itf.script(|req| reply_frame(req, 0, &[0xAA; 4]));
        }
        let data = itf.increment_read(0x20, 10, 4).unwrap();
        assert_eq!(data.len(), 10);

        let sent = itf.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let addrs: Vec<u32> = sent
            .iter()
            .map(|f| u32::from_le_bytes(f[16..20].try_into().unwrap()))
            .collect();
        assert_eq!(addrs, [0x20, 0x24, 0x28]);
        for f in sent.iter() {
            let head = FrameHead::unpack(f).unwrap();
            assert_eq!(head.cmd_id, VRegCmd::IncrRead as u32);
        }
    }

    #[test]
    fn loop_write_hammers_the_base_address() {
        let itf = MockCmd::new();
        for _ in 0..3 {
            itf.script(|req| reply_frame(req, 0, &[]));
        }
        // 10 bytes pad to 12, three frames, all at 0x40
        itf.loop_write(0x40, &[0x11; 10], 4).unwrap();
        let sent = itf.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        for f in sent.iter() {
            assert_eq!(u32::from_le_bytes(f[16..20].try_into().unwrap()), 0x40);
            assert_eq!(f.len(), 24);
        }
        // the padded tail is zeros
        assert_eq!(&sent[2][20..24], &[0x11, 0x11, 0x00, 0x00]);
    }

    #[test]
    fn serials_are_monotone_per_transport() {
        let itf = MockCmd::new();
        for _ in 0..4 {
            itf.script(|req| reply_frame(req, 0, &[0; 4]));
        }
        itf.write(0, &[0; 4]).unwrap();
        itf.read(0).unwrap();
        itf.write(4, &[0; 4]).unwrap();
        itf.read(4).unwrap();
        let sent = itf.sent.lock().unwrap();
        let serials: Vec<u32> = sent
            .iter()
            .map(|f| FrameHead::unpack(f).unwrap().serial)
            .collect();
        assert_eq!(serials, [0, 1, 2, 3]);
    }

    #[test]
    fn pad_to_rounds_up() {
        assert_eq!(pad_to(&[1, 2, 3], 4), vec![1, 2, 3, 0]);
        assert_eq!(pad_to(&[1, 2, 3, 4], 4), vec![1, 2, 3, 4]);
        assert_eq!(pad_to(&[], 4), Vec::<u8>::new());
    }
}
