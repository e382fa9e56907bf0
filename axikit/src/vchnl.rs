//! Virtual-channel middleware: N logical upstream channels multiplexed over
//! one physical DMA pipe.
//!
//! In real mode everything passes straight through to the stream transport.
//! In virtual mode a wheel thread grants turns off a priority queue keyed by
//! each channel's service counter (ties go to whoever asked first), and the
//! granted caller programs the device's channel-select registers before
//! running a normal DMA on the shared physical channel. The counter bump
//! after every served turn is what makes a hungry channel yield: a channel
//! that just ran loses future ties against one that has been waiting.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::api::{KitConfig, StreamMode};
use crate::sync::Event;
use crate::transport::{BufBacking, StreamTransport, WAIT_SLICE};
use crate::{Error, Result};

/// Logical upstream channels multiplexed over the physical pipe.
pub const VCHNL_NUM: usize = 8;
/// The physical channel that carries every virtual transfer.
const R2V_CHNL: u32 = 0;
/// Word-count field of the parameter/status registers, bits [26:0].
const WORD_MASK: u32 = 0x07FF_FFFF;
/// Channel-select field, bits [29:27].
const CHNL_SHIFT: u32 = 27;
const PARAM_SETTLE: Duration = Duration::from_millis(5);
const WHEEL_POLL: Duration = Duration::from_secs(1);

/// Device registers for the channel-select handshake.
#[derive(Clone, Copy, Debug)]
pub struct VchnlRegs {
    /// Transfer parameter word: length and source channel.
    pub param: u32,
    /// Parameter strobe (write all-ones, settle, write zero).
    pub param_wr: u32,
    /// Completion status word: residue and source channel.
    pub status: u32,
}

impl Default for VchnlRegs {
    fn default() -> Self {
        VchnlRegs {
            param: 0x0000_0000,
            param_wr: 0x0000_0000,
            status: 0x0000_0000,
        }
    }
}

// Queue key: service counter first, then arrival order. Derived Ord gives
// exactly that lexicographic comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ChnlEntry {
    priority: u64,
    seq: u64,
    chnl: usize,
}

struct Shared {
    queue: Mutex<BinaryHeap<Reverse<ChnlEntry>>>,
    queue_cv: Condvar,
    seq: AtomicU64,
    counters: Mutex<[u64; VCHNL_NUM]>,
    events: Vec<Event>,
    /// Held by whichever caller owns the physical pipe; the wheel also takes
    /// it around each dequeue so grants cannot move mid-transfer.
    running: Mutex<()>,
    cancel: Event,
    canceled: Event,
}

pub struct VirtualChnl {
    itf: Arc<dyn StreamTransport>,
    mode: Mutex<StreamMode>,
    regs: VchnlRegs,
    shared: Arc<Shared>,
    wheel: Mutex<Option<JoinHandle<()>>>,
}

fn wheel_loop(shared: Arc<Shared>) {
    loop {
        if shared.cancel.is_set() {
            break;
        }
        let entry = {
            let _turn = shared.running.lock().unwrap();
            let mut queue = shared.queue.lock().unwrap();
            if queue.is_empty() {
                let (q, _) = shared
                    .queue_cv
                    .wait_timeout(queue, WHEEL_POLL)
                    .unwrap();
                queue = q;
            }
            queue.pop()
        };
        if let Some(Reverse(granted)) = entry {
            for (ch, event) in shared.events.iter().enumerate() {
                if ch == granted.chnl {
                    event.set();
                } else {
                    event.clear();
                }
            }
        }
    }
    shared.canceled.set();
}

impl VirtualChnl {
    pub fn new(itf: Arc<dyn StreamTransport>) -> VirtualChnl {
        Self::with_regs(itf, VchnlRegs::default())
    }

    pub fn with_regs(itf: Arc<dyn StreamTransport>, regs: VchnlRegs) -> VirtualChnl {
        VirtualChnl {
            itf,
            mode: Mutex::new(StreamMode::Real),
            regs,
            shared: Arc::new(Shared {
                queue: Mutex::new(BinaryHeap::new()),
                queue_cv: Condvar::new(),
                seq: AtomicU64::new(0),
                counters: Mutex::new([0; VCHNL_NUM]),
                events: (0..VCHNL_NUM).map(|_| Event::new()).collect(),
                running: Mutex::new(()),
                cancel: Event::new(),
                canceled: Event::new(),
            }),
            wheel: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> StreamMode {
        *self.mode.lock().unwrap()
    }

    /// The wrapped stream transport.
    pub fn itf(&self) -> &dyn StreamTransport {
        self.itf.as_ref()
    }

    /// Switch modes. A running wheel is cancelled and drained first; virtual
    /// mode demands the register capability on the stream transport.
    pub fn config(&self, cfg: &KitConfig) -> Result<()> {
        let mut wheel = self.wheel.lock().unwrap();
        if let Some(handle) = wheel.take() {
            self.shared.cancel.set();
            self.shared.queue_cv.notify_all();
            let _ = handle.join();
            if !self.shared.canceled.is_set() {
                log::warn!("virtual channel wheel exited without acknowledging");
            }
        }
        self.shared.cancel.clear();
        self.shared.canceled.clear();
        *self.shared.counters.lock().unwrap() = [0; VCHNL_NUM];
        self.shared.queue.lock().unwrap().clear();
        for event in &self.shared.events {
            event.clear();
        }

        if cfg.stream_mode == StreamMode::Virtual && self.itf.reg_ops().is_none() {
            *self.mode.lock().unwrap() = StreamMode::Real;
            return Err(Error::Incompatible(
                "virtual channels need register access on the stream transport",
            ));
        }
        *self.mode.lock().unwrap() = cfg.stream_mode;
        if cfg.stream_mode == StreamMode::Virtual {
            let shared = self.shared.clone();
            *wheel = Some(
                thread::Builder::new()
                    .name("vchnl-wheel".to_string())
                    .spawn(move || wheel_loop(shared))?,
            );
            log::info!("virtual channel wheel running, {} channels", VCHNL_NUM);
        }
        Ok(())
    }

    // Buffer management always goes straight through.

    pub fn alloc_buffer(&self, byte_len: usize, backing: Option<BufBacking>) -> Result<u32> {
        self.itf.alloc_buffer(byte_len, backing)
    }

    pub fn free_buffer(&self, buf: u32) -> Result<()> {
        self.itf.free_buffer(buf)
    }

    pub fn get_buffer(&self, buf: u32, byte_len: usize) -> Result<Vec<u32>> {
        self.itf.get_buffer(buf, byte_len)
    }

    pub fn open_send(&self, chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()> {
        self.itf.open_send(chnl, buf, byte_len, byte_offset)
    }

    pub fn open_recv(&self, chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()> {
        self.itf.open_recv(chnl, buf, byte_len, byte_offset)
    }

    pub fn wait_stream(&self, buf: u32, timeout: Duration) -> Result<usize> {
        self.itf.wait_stream(buf, timeout)
    }

    pub fn break_stream(&self, buf: u32) -> Result<usize> {
        self.itf.break_stream(buf)
    }

    pub fn stream_recv(
        &self,
        chnl: u32,
        buf: u32,
        byte_len: usize,
        byte_offset: usize,
        stop: &dyn Fn() -> bool,
        timeout: Duration,
    ) -> Result<usize> {
        match self.mode() {
            StreamMode::Real => self
                .itf
                .stream_recv(chnl, buf, byte_len, byte_offset, stop, timeout),
            StreamMode::Virtual => self.virtual_recv(chnl, buf, byte_len, byte_offset, stop, timeout),
        }
    }

    pub fn stream_send(
        &self,
        chnl: u32,
        buf: u32,
        byte_len: usize,
        byte_offset: usize,
        stop: &dyn Fn() -> bool,
        timeout: Duration,
    ) -> Result<usize> {
        match self.mode() {
            StreamMode::Real => self
                .itf
                .stream_send(chnl, buf, byte_len, byte_offset, stop, timeout),
            StreamMode::Virtual => Err(Error::Unsupported("downstream in virtual channel mode")),
        }
    }

    fn virtual_recv(
        &self,
        chnl: u32,
        buf: u32,
        byte_len: usize,
        byte_offset: usize,
        stop: &dyn Fn() -> bool,
        timeout: Duration,
    ) -> Result<usize> {
        let ch = chnl as usize;
        if ch >= VCHNL_NUM {
            return Err(Error::Unsupported("virtual channel index beyond VCHNL_NUM"));
        }
        let regs_itf = self.itf.reg_ops().ok_or(Error::Incompatible(
            "virtual channels need register access on the stream transport",
        ))?;

        // ask the wheel for a turn
        {
            let counters = self.shared.counters.lock().unwrap();
            let entry = ChnlEntry {
                priority: counters[ch],
                seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
                chnl: ch,
            };
            self.shared.queue.lock().unwrap().push(Reverse(entry));
            self.shared.queue_cv.notify_all();
        }
        loop {
            if stop() {
                return Ok(0);
            }
            if self.shared.events[ch].wait_timeout(WAIT_SLICE) {
                break;
            }
        }
        self.shared.events[ch].clear();

        let _turn = self.shared.running.lock().unwrap();
        // only a successfully started DMA may program the device
        self.itf.open_recv(R2V_CHNL, buf, byte_len, byte_offset)?;
        let words = (byte_len / 4) as u32;
        regs_itf.reg_write(self.regs.param, (words & WORD_MASK) | (chnl << CHNL_SHIFT))?;
        regs_itf.reg_write(self.regs.param_wr, 0xFFFF_FFFF)?;
        thread::sleep(PARAM_SETTLE);
        regs_itf.reg_write(self.regs.param_wr, 0)?;

        let deadline = Instant::now() + timeout;
        let mut stopped = false;
        let delivered = loop {
            if stop() {
                stopped = true;
                break self.itf.break_stream(buf)?;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let got = self.itf.wait_stream(buf, WAIT_SLICE.min(remaining))?;
            if got >= byte_len {
                break got;
            }
            if Instant::now() >= deadline {
                self.itf.break_stream(buf)?;
                return Err(Error::DmaTimeout);
            }
        };

        if !stopped {
            let status = regs_itf.reg_read(self.regs.status)?;
            let residue = status & WORD_MASK;
            let source = (status >> CHNL_SHIFT) & 0x7;
            if residue != 0 || source != chnl {
                return Err(Error::ChannelDesync {
                    chnl,
                    source,
                    residue,
                });
            }
        }
        self.shared.counters.lock().unwrap()[ch] += 1;
        Ok(delivered)
    }
}

impl Drop for VirtualChnl {
    fn drop(&mut self) {
        if let Some(handle) = self.wheel.lock().unwrap().take() {
            self.shared.cancel.set();
            self.shared.queue_cv.notify_all();
            let _ = handle.join();
        }
    }
}
