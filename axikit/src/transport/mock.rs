//! Test doubles: a scriptable command transport and a stream transport with
//! a tiny device model behind its register file.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::KitConfig;
use crate::frame::{self, FrameHead, HEAD_LEN};
use crate::transport::{Backing, BufBacking, CmdTransport, RegOps, ReplyMode, StreamTransport};
use crate::vchnl::VchnlRegs;
use crate::{Error, Result};

type ReplyFn = Box<dyn Fn(&[u8]) -> Vec<u8> + Send>;

/// Command transport that records every request and answers from a script.
/// With an empty script it echoes the request head with a zero status and a
/// zeroed payload word, which satisfies both the write and read flavors.
pub(crate) struct MockCmd {
    pub sent: Mutex<Vec<Vec<u8>>>,
    replies: Mutex<VecDeque<ReplyFn>>,
    serial: AtomicU32,
}

impl MockCmd {
    pub fn new() -> MockCmd {
        MockCmd {
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            serial: AtomicU32::new(0),
        }
    }

    /// Queue the reply for the next exchange, built from the request bytes.
    pub fn script<F: Fn(&[u8]) -> Vec<u8> + Send + 'static>(&self, f: F) {
        self.replies.lock().unwrap().push_back(Box::new(f));
    }

    fn auto_reply(request: &[u8]) -> Vec<u8> {
        let req = FrameHead::unpack(request).unwrap();
        let head = FrameHead {
            magic: frame::REPLY_MAGIC,
            cmd_id: req.cmd_id,
            serial: req.serial,
            total_len: (HEAD_LEN + 8) as u32,
        };
        let mut out = head.pack().to_vec();
        out.extend_from_slice(&[0; 8]); // status 0 + zero payload word
        out
    }
}

impl CmdTransport for MockCmd {
    fn accept(&self, _cfg: &KitConfig) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn set_timeout(&self, _timeout: Duration) {}

    fn send_bytes(&self, data: &[u8]) -> Result<usize> {
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn recv_bytes(&self, _len: usize) -> Result<Vec<u8>> {
        Err(Error::Unsupported("recv_bytes on the mock"))
    }

    fn transact(&self, request: &[u8], mode: ReplyMode) -> Result<Vec<u8>> {
        self.sent.lock().unwrap().push(request.to_vec());
        let reply = match self.replies.lock().unwrap().pop_front() {
            Some(f) => f(request),
            None => match mode {
                ReplyMode::HeadChecked => Self::auto_reply(request),
                ReplyMode::Fixed(n) => vec![0; n],
            },
        };
        // Verify the same way the real transports do, so scripted garbage
        // exercises the same error paths.
        if let ReplyMode::HeadChecked = mode {
            let req_head = FrameHead::unpack(request)?;
            let reply_head = FrameHead::unpack(&reply)?;
            let total = frame::check_reply_head(&req_head, &reply_head)?;
            if reply.len() < total {
                return Err(Error::RecvTimeout {
                    got: reply.len(),
                    want: total,
                });
            }
        }
        Ok(reply)
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }
}

struct MockBuf {
    words: Vec<u32>,
    requested_bytes: usize,
    transferred_bytes: usize,
    in_use: bool,
}

/// Stream transport whose register file models the virtual-channel handshake:
/// pulsing the parameter doorbell latches the selected channel into the
/// status register with a zero residue (or a corrupted channel when `desync`
/// is set).
pub(crate) struct MockStream {
    vregs: VchnlRegs,
    regs: Mutex<HashMap<u32, u32>>,
    bufs: Mutex<HashMap<u32, MockBuf>>,
    next_id: AtomicU32,
    pub desync: AtomicBool,
    pub log: Mutex<Vec<String>>,
}

impl MockStream {
    pub fn new(vregs: VchnlRegs) -> MockStream {
        MockStream {
            vregs,
            regs: Mutex::new(HashMap::new()),
            bufs: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            desync: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    fn note(&self, what: String) {
        self.log.lock().unwrap().push(what);
    }
}

impl StreamTransport for MockStream {
    fn accept(&self, _cfg: &KitConfig) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn alloc_buffer(&self, byte_len: usize, backing: Option<BufBacking>) -> Result<u32> {
        if byte_len % 4 != 0 {
            return Err(Error::Schema(format!(
                "buffer length {} is not a word multiple",
                byte_len
            )));
        }
        let words = match backing {
            None => vec![0u32; byte_len / 4],
            Some(BufBacking(Backing::Words(v))) => v,
            Some(BufBacking(Backing::Raw { .. })) => {
                return Err(Error::Unsupported("raw backing on the mock"))
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.bufs.lock().unwrap().insert(
            id,
            MockBuf {
                words,
                requested_bytes: 0,
                transferred_bytes: 0,
                in_use: false,
            },
        );
        Ok(id)
    }

    fn free_buffer(&self, buf: u32) -> Result<()> {
        let mut bufs = self.bufs.lock().unwrap();
        match bufs.get(&buf) {
            Some(b) if b.in_use => Err(Error::BufferBusy(buf)),
            Some(_) => {
                bufs.remove(&buf);
                Ok(())
            }
            None => Err(Error::Schema(format!("unknown buffer {}", buf))),
        }
    }

    fn get_buffer(&self, buf: u32, byte_len: usize) -> Result<Vec<u32>> {
        let bufs = self.bufs.lock().unwrap();
        let b = bufs
            .get(&buf)
            .ok_or_else(|| Error::Schema(format!("unknown buffer {}", buf)))?;
        Ok(b.words[..byte_len / 4].to_vec())
    }

    fn open_send(&self, chnl: u32, buf: u32, byte_len: usize, _byte_offset: usize) -> Result<()> {
        self.note(format!("open_send {} {} {}", chnl, buf, byte_len));
        let mut bufs = self.bufs.lock().unwrap();
        let b = bufs
            .get_mut(&buf)
            .ok_or_else(|| Error::Schema(format!("unknown buffer {}", buf)))?;
        if b.in_use {
            return Err(Error::BufferBusy(buf));
        }
        b.in_use = true;
        b.requested_bytes = byte_len;
        b.transferred_bytes = byte_len;
        Ok(())
    }

    fn open_recv(&self, chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()> {
        self.note(format!("open_recv {} {} {}", chnl, buf, byte_len));
        let mut bufs = self.bufs.lock().unwrap();
        let b = bufs
            .get_mut(&buf)
            .ok_or_else(|| Error::Schema(format!("unknown buffer {}", buf)))?;
        if b.in_use {
            return Err(Error::BufferBusy(buf));
        }
        if byte_offset + byte_len > b.words.len() * 4 {
            return Err(Error::Schema("transfer exceeds buffer".to_string()));
        }
        for (i, w) in b.words[byte_offset / 4..(byte_offset + byte_len) / 4]
            .iter_mut()
            .enumerate()
        {
            *w = i as u32;
        }
        b.in_use = true;
        b.requested_bytes = byte_len;
        b.transferred_bytes = byte_len;
        Ok(())
    }

    fn wait_stream(&self, buf: u32, _timeout: Duration) -> Result<usize> {
        let mut bufs = self.bufs.lock().unwrap();
        let b = bufs
            .get_mut(&buf)
            .ok_or_else(|| Error::Schema(format!("unknown buffer {}", buf)))?;
        if b.transferred_bytes >= b.requested_bytes {
            b.in_use = false;
        }
        Ok(b.transferred_bytes)
    }

    fn break_stream(&self, buf: u32) -> Result<usize> {
        self.note(format!("break_stream {}", buf));
        let mut bufs = self.bufs.lock().unwrap();
        let b = bufs
            .get_mut(&buf)
            .ok_or_else(|| Error::Schema(format!("unknown buffer {}", buf)))?;
        b.in_use = false;
        Ok(b.transferred_bytes)
    }

    fn reg_ops(&self) -> Option<&dyn RegOps> {
        Some(self)
    }
}

impl RegOps for MockStream {
    fn reg_write(&self, addr: u32, value: u32) -> Result<()> {
        let mut regs = self.regs.lock().unwrap();
        regs.insert(addr, value);
        // Device model: the parameter doorbell latches the selected channel
        // into the status register with all words consumed.
        if addr == self.vregs.param_wr && value == 0xFFFF_FFFF {
            let param = *regs.get(&self.vregs.param).unwrap_or(&0);
            let selected = (param >> 27) & 0x7;
            self.note(format!("grant {}", selected));
            let source = if self.desync.load(Ordering::Relaxed) {
                (selected + 1) & 0x7
            } else {
                selected
            };
            regs.insert(self.vregs.status, source << 27);
        }
        Ok(())
    }

    fn reg_read(&self, addr: u32) -> Result<u32> {
        Ok(*self.regs.lock().unwrap().get(&addr).unwrap_or(&0))
    }
}
