//! Driver simulator: the same surface as the native backend, backed by a
//! register file and plain host memory. Register writes are stored and read
//! back verbatim; a receive DMA completes immediately and fills the buffer
//! with a word-counting pattern, which is enough for the upper layers' tests
//! to check lengths, offsets and completion plumbing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::{Backend, BufHandle, Error, Result};

enum SimData {
    Owned(Vec<u32>),
    // caller-owned memory registered through alloc_buffer_at
    Ext { ptr: usize, len: usize },
}

impl SimData {
    fn len(&self) -> usize {
        match self {
            SimData::Owned(v) => v.len(),
            SimData::Ext { len, .. } => *len,
        }
    }

    fn write(&mut self, offset: usize, data: &[u32]) {
        match self {
            SimData::Owned(v) => v[offset..offset + data.len()].copy_from_slice(data),
            SimData::Ext { ptr, .. } => unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    (*ptr as *mut u32).add(offset),
                    data.len(),
                );
            },
        }
    }

    fn read(&self, len: usize) -> Vec<u32> {
        match self {
            SimData::Owned(v) => v[..len].to_vec(),
            SimData::Ext { ptr, .. } => unsafe {
                std::slice::from_raw_parts(*ptr as *const u32, len).to_vec()
            },
        }
    }
}

struct SimBuf {
    data: SimData,
    transferred_words: usize,
}

pub(crate) struct SimBackend {
    regs: Mutex<HashMap<(u32, u32), u32>>,
    buffers: Mutex<HashMap<BufHandle, SimBuf>>,
    next_handle: AtomicUsize,
}

impl SimBackend {
    pub fn new() -> SimBackend {
        log::info!("xdma simulator backend active");
        SimBackend {
            regs: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicUsize::new(1),
        }
    }

    fn fill_pattern(buf: &mut SimBuf, len_words: usize, offset_words: usize) {
        let pattern: Vec<u32> = (0..len_words as u32).collect();
        buf.data.write(offset_words, &pattern);
        buf.transferred_words = len_words;
    }
}

impl Backend for SimBackend {
    fn open(&self, board: u32, _poll_ms: u32) -> Result<()> {
        log::debug!("sim: board {} open", board);
        Ok(())
    }

    fn close(&self, board: u32) {
        log::debug!("sim: board {} close", board);
    }

    fn info(&self, board: u32) -> String {
        format!("xdma-sim board {}", board)
    }

    fn wr_lite(&self, board: u32, addr: u32, data: u32) -> Result<()> {
        log::trace!("sim: board {} reg[{:#010x}] <- {:#010x}", board, addr, data);
        self.regs.lock().unwrap().insert((board, addr), data);
        Ok(())
    }

    fn rd_lite(&self, board: u32, addr: u32) -> Result<u32> {
        Ok(*self.regs.lock().unwrap().get(&(board, addr)).unwrap_or(&0))
    }

    fn alloc_dma(&self, _board: u32, len_words: usize, ext: Option<*mut u32>) -> Result<BufHandle> {
        let data = match ext {
            Some(ptr) => SimData::Ext {
                ptr: ptr as usize,
                len: len_words,
            },
            None => SimData::Owned(vec![0; len_words]),
        };
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().unwrap().insert(
            handle,
            SimBuf {
                data,
                transferred_words: 0,
            },
        );
        Ok(handle)
    }

    fn free_dma(&self, handle: BufHandle) -> Result<()> {
        self.buffers
            .lock()
            .unwrap()
            .remove(&handle)
            .map(|_| ())
            .ok_or(Error::BadHandle(handle))
    }

    fn read_buffer(&self, handle: BufHandle, len_words: usize) -> Result<Vec<u32>> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle).ok_or(Error::BadHandle(handle))?;
        if len_words > buf.data.len() {
            return Err(Error::Dma(format!(
                "view of {} words exceeds allocation of {}",
                len_words,
                buf.data.len()
            )));
        }
        Ok(buf.data.read(len_words))
    }

    fn write_buffer(&self, handle: BufHandle, offset_words: usize, data: &[u32]) -> Result<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers.get_mut(&handle).ok_or(Error::BadHandle(handle))?;
        if offset_words + data.len() > buf.data.len() {
            return Err(Error::Dma(format!(
                "write of {} words at offset {} exceeds allocation of {}",
                data.len(),
                offset_words,
                buf.data.len()
            )));
        }
        buf.data.write(offset_words, data);
        Ok(())
    }

    fn send_open(
        &self,
        _board: u32,
        _chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers.get_mut(&handle).ok_or(Error::BadHandle(handle))?;
        if offset_words + len_words > buf.data.len() {
            return Err(Error::Dma("send exceeds allocation".into()));
        }
        buf.transferred_words = len_words;
        Ok(())
    }

    fn recv_open(
        &self,
        _board: u32,
        chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers.get_mut(&handle).ok_or(Error::BadHandle(handle))?;
        if offset_words + len_words > buf.data.len() {
            return Err(Error::Dma("recv exceeds allocation".into()));
        }
        log::trace!("sim: recv_open chnl {} for {} words", chnl, len_words);
        Self::fill_pattern(buf, len_words, offset_words);
        Ok(())
    }

    fn wait_dma(&self, handle: BufHandle, _timeout_ms: i32) -> Result<usize> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle).ok_or(Error::BadHandle(handle))?;
        Ok(buf.transferred_words)
    }

    fn poll_dma(&self, handle: BufHandle) -> Result<usize> {
        self.wait_dma(handle, 0)
    }

    fn break_dma(&self, handle: BufHandle) -> Result<usize> {
        self.wait_dma(handle, 0)
    }

    fn wait_irq(&self, _board: u32, _irq: u32, _timeout_ms: i32) -> Result<()> {
        // No interrupt machinery here; the PCIe command transport falls back
        // to polling its irq register when it sees this.
        Err(Error::Unsupported("wait_irq"))
    }
}
