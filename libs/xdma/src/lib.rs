//! Safe handle onto the native XDMA board driver.
//!
//! The vendor library owns the PCIe device nodes, pinned DMA memory and the
//! AXI-lite register window; this crate wraps those entry points with checked
//! handles and keeps a process-wide refcount per board index so that several
//! toolkit objects can share one physical board. `Xdma::sim()` swaps the
//! whole driver for an in-process simulator with the same surface, which is
//! what the test suites run against.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_void;
use std::ptr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

mod ffi;
mod sim;

pub use ffi::LIB_ENV;

/// Opaque DMA buffer descriptor, as handed out by `alloc_buffer`.
pub type BufHandle = usize;

/// Failure sentinel returned by the driver's DMA entry points.
pub const DMA_FAIL: u64 = u64::MAX;

/// Global-reset register block (board address space).
const ADDR_RST: u32 = 0x0000_0000;
const RST_GLOBAL_RSTN: u32 = 0x0;

#[derive(Debug)]
pub enum Error {
    /// The driver library could not be loaded or is missing a symbol.
    Load(String),
    /// `fpga_open` refused the board index.
    Open(u32, String),
    /// Buffer allocation failed in the driver.
    Alloc(String),
    /// Operation on a handle this driver never handed out.
    BadHandle(BufHandle),
    /// A DMA entry point returned the failure sentinel.
    Dma(String),
    /// The IRQ wait elapsed without the line firing.
    IrqTimeout,
    /// The active backend cannot perform this operation.
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Load(m) => write!(f, "driver load failed: {}", m),
            Error::Open(b, m) => write!(f, "board {} open failed: {}", b, m),
            Error::Alloc(m) => write!(f, "dma alloc failed: {}", m),
            Error::BadHandle(h) => write!(f, "unknown buffer handle {:#x}", h),
            Error::Dma(m) => write!(f, "dma failed: {}", m),
            Error::IrqTimeout => write!(f, "irq wait timed out"),
            Error::Unsupported(what) => write!(f, "{} not supported by this backend", what),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The operations both the real driver and the simulator provide.
pub(crate) trait Backend: Send + Sync {
    fn open(&self, board: u32, poll_ms: u32) -> Result<()>;
    fn close(&self, board: u32);
    fn info(&self, board: u32) -> String;
    fn wr_lite(&self, board: u32, addr: u32, data: u32) -> Result<()>;
    fn rd_lite(&self, board: u32, addr: u32) -> Result<u32>;
    fn alloc_dma(&self, board: u32, len_words: usize, ext: Option<*mut u32>) -> Result<BufHandle>;
    fn free_dma(&self, handle: BufHandle) -> Result<()>;
    fn read_buffer(&self, handle: BufHandle, len_words: usize) -> Result<Vec<u32>>;
    fn write_buffer(&self, handle: BufHandle, offset_words: usize, data: &[u32]) -> Result<()>;
    fn send_open(
        &self,
        board: u32,
        chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()>;
    fn recv_open(
        &self,
        board: u32,
        chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()>;
    fn wait_dma(&self, handle: BufHandle, timeout_ms: i32) -> Result<usize>;
    fn poll_dma(&self, handle: BufHandle) -> Result<usize>;
    fn break_dma(&self, handle: BufHandle) -> Result<usize>;
    fn wait_irq(&self, board: u32, irq: u32, timeout_ms: i32) -> Result<()>;
}

struct Shared {
    backend: Box<dyn Backend>,
    // board index -> open count; only the 0 -> 1 transition opens the driver
    // and only the 1 -> 0 transition closes it.
    boards: Mutex<HashMap<u32, u32>>,
}

/// Cloneable driver handle. All clones of one `Xdma` share the same backend
/// and the same board refcount table.
#[derive(Clone)]
pub struct Xdma {
    inner: Arc<Shared>,
}

static REAL: OnceLock<Result<Arc<Shared>>> = OnceLock::new();

impl Xdma {
    /// Bind to the native driver library. All callers in the process share
    /// one binding (and thus one board refcount table).
    pub fn new() -> Result<Xdma> {
        let shared = REAL.get_or_init(|| {
            Ok(Arc::new(Shared {
                backend: Box::new(LibBackend {
                    api: ffi::XdmaApi::load()?,
                    buffers: Mutex::new(HashMap::new()),
                }),
                boards: Mutex::new(HashMap::new()),
            }))
        });
        match shared {
            Ok(s) => Ok(Xdma { inner: s.clone() }),
            Err(e) => Err(Error::Load(e.to_string())),
        }
    }

    /// A fresh in-process simulator with its own register file, buffers and
    /// refcount table.
    pub fn sim() -> Xdma {
        Xdma {
            inner: Arc::new(Shared {
                backend: Box::new(sim::SimBackend::new()),
                boards: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn open_board(&self, board: u32) -> Result<()> {
        self.open_board_polled(board, 0)
    }

    /// Open with an explicit driver poll interval (0 = driver default).
    pub fn open_board_polled(&self, board: u32, poll_ms: u32) -> Result<()> {
        let mut boards = self.inner.boards.lock().unwrap();
        match boards.get_mut(&board) {
            Some(count) => {
                *count += 1;
                log::debug!("board {} already open, refcount now {}", board, count);
            }
            None => {
                self.inner.backend.open(board, poll_ms)?;
                boards.insert(board, 1);
                log::info!("board {} opened", board);
            }
        }
        Ok(())
    }

    pub fn close_board(&self, board: u32) -> Result<()> {
        let mut boards = self.inner.boards.lock().unwrap();
        match boards.get_mut(&board) {
            Some(count) if *count > 1 => {
                *count -= 1;
                log::debug!("board {} refcount now {}", board, count);
            }
            Some(_) => {
                boards.remove(&board);
                self.inner.backend.close(board);
                log::info!("board {} closed", board);
            }
            None => log::warn!("close_board({}) without a matching open", board),
        }
        Ok(())
    }

    /// Current open count for a board (0 when closed).
    pub fn open_count(&self, board: u32) -> u32 {
        *self.inner.boards.lock().unwrap().get(&board).unwrap_or(&0)
    }

    pub fn info(&self, board: u32) -> String {
        self.inner.backend.info(board)
    }

    /// Pulse the global reset register.
    pub fn reset_board(&self, board: u32) -> Result<()> {
        self.alite_write(board, ADDR_RST + RST_GLOBAL_RSTN, 0)?;
        std::thread::sleep(Duration::from_millis(1));
        self.alite_write(board, ADDR_RST + RST_GLOBAL_RSTN, 1)
    }

    /// 32-bit AXI-lite register write.
    pub fn alite_write(&self, board: u32, addr: u32, data: u32) -> Result<()> {
        self.inner.backend.wr_lite(board, addr, data)
    }

    /// 32-bit AXI-lite register read.
    pub fn alite_read(&self, board: u32, addr: u32) -> Result<u32> {
        self.inner.backend.rd_lite(board, addr)
    }

    /// Allocate a driver-pinned DMA buffer of `len_words` 32-bit words.
    pub fn alloc_buffer(&self, board: u32, len_words: usize) -> Result<BufHandle> {
        self.inner.backend.alloc_dma(board, len_words, None)
    }

    /// Register caller-owned memory as a DMA buffer. The region must stay
    /// valid and pinned until `free_buffer`; the driver never deallocates it.
    ///
    /// # Safety
    /// `buf` must point to at least `len_words` writable u32 words.
    pub unsafe fn alloc_buffer_at(
        &self,
        board: u32,
        len_words: usize,
        buf: *mut u32,
    ) -> Result<BufHandle> {
        self.inner.backend.alloc_dma(board, len_words, Some(buf))
    }

    pub fn free_buffer(&self, handle: BufHandle) -> Result<()> {
        self.inner.backend.free_dma(handle)
    }

    /// Copy out the first `len_words` words of a buffer.
    pub fn read_buffer(&self, handle: BufHandle, len_words: usize) -> Result<Vec<u32>> {
        self.inner.backend.read_buffer(handle, len_words)
    }

    /// Copy words into a buffer ahead of a send DMA.
    pub fn write_buffer(&self, handle: BufHandle, offset_words: usize, data: &[u32]) -> Result<()> {
        self.inner.backend.write_buffer(handle, offset_words, data)
    }

    /// Start a non-blocking host-to-device DMA.
    pub fn send_open(
        &self,
        board: u32,
        chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()> {
        self.inner
            .backend
            .send_open(board, chnl, handle, len_words, offset_words)
    }

    /// Start a non-blocking device-to-host DMA.
    pub fn recv_open(
        &self,
        board: u32,
        chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()> {
        self.inner
            .backend
            .recv_open(board, chnl, handle, len_words, offset_words)
    }

    /// Block until the DMA on `handle` completes or `timeout` elapses;
    /// returns the number of words delivered so far either way.
    pub fn wait_dma(&self, handle: BufHandle, timeout: Duration) -> Result<usize> {
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        self.inner.backend.wait_dma(handle, ms)
    }

    /// Non-blocking progress check; words delivered so far.
    pub fn poll_dma(&self, handle: BufHandle) -> Result<usize> {
        self.inner.backend.poll_dma(handle)
    }

    /// Cancel an in-flight DMA; returns the words delivered before the break.
    pub fn break_dma(&self, handle: BufHandle) -> Result<usize> {
        self.inner.backend.break_dma(handle)
    }

    /// Block until the numbered IRQ line fires. `Error::Unsupported` when the
    /// backend has no IRQ machinery (callers fall back to register polling).
    pub fn wait_irq(&self, board: u32, irq: u32, timeout: Duration) -> Result<()> {
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        self.inner.backend.wait_irq(board, irq, ms)
    }
}

// --- native driver backend --------------------------------------------------

struct LibBackend {
    api: ffi::XdmaApi,
    // handle -> allocated word length, for bounds checks on buffer views
    buffers: Mutex<HashMap<BufHandle, usize>>,
}

impl LibBackend {
    fn err_msg(&self) -> String {
        unsafe {
            let msg = (self.api.fpga_err_msg)();
            if msg.is_null() {
                String::new()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }

    fn buffer_len(&self, handle: BufHandle) -> Result<usize> {
        self.buffers
            .lock()
            .unwrap()
            .get(&handle)
            .copied()
            .ok_or(Error::BadHandle(handle))
    }

    fn check_dma(&self, ret: u64) -> Result<usize> {
        if ret == DMA_FAIL {
            Err(Error::Dma(self.err_msg()))
        } else {
            Ok(ret as usize)
        }
    }
}

impl Backend for LibBackend {
    fn open(&self, board: u32, poll_ms: u32) -> Result<()> {
        if unsafe { (self.api.fpga_open)(board, poll_ms) } {
            Ok(())
        } else {
            Err(Error::Open(board, self.err_msg()))
        }
    }

    fn close(&self, board: u32) {
        unsafe { (self.api.fpga_close)(board) }
    }

    fn info(&self, board: u32) -> String {
        unsafe {
            let s = (self.api.fpga_info_string)(board);
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        }
    }

    fn wr_lite(&self, board: u32, addr: u32, data: u32) -> Result<()> {
        unsafe { (self.api.fpga_wr_lite)(board, addr, data) };
        Ok(())
    }

    fn rd_lite(&self, board: u32, addr: u32) -> Result<u32> {
        Ok(unsafe { (self.api.fpga_rd_lite)(board, addr) })
    }

    fn alloc_dma(&self, board: u32, len_words: usize, ext: Option<*mut u32>) -> Result<BufHandle> {
        let buf = ext.map(|p| p as *mut c_void).unwrap_or(ptr::null_mut());
        let fd =
            unsafe { (self.api.fpga_alloc_dma)(board, len_words as u64, buf, ptr::null_mut()) };
        if fd.is_null() {
            return Err(Error::Alloc(self.err_msg()));
        }
        let handle = fd as BufHandle;
        self.buffers.lock().unwrap().insert(handle, len_words);
        Ok(handle)
    }

    fn free_dma(&self, handle: BufHandle) -> Result<()> {
        self.buffers
            .lock()
            .unwrap()
            .remove(&handle)
            .ok_or(Error::BadHandle(handle))?;
        unsafe { (self.api.fpga_free_dma)(handle as *mut c_void) };
        Ok(())
    }

    fn read_buffer(&self, handle: BufHandle, len_words: usize) -> Result<Vec<u32>> {
        let alloc = self.buffer_len(handle)?;
        if len_words > alloc {
            return Err(Error::Dma(format!(
                "view of {} words exceeds allocation of {}",
                len_words, alloc
            )));
        }
        unsafe {
            let base = (self.api.fpga_get_dma_buffer)(handle as *mut c_void) as *const u32;
            if base.is_null() {
                return Err(Error::BadHandle(handle));
            }
            Ok(std::slice::from_raw_parts(base, len_words).to_vec())
        }
    }

    fn write_buffer(&self, handle: BufHandle, offset_words: usize, data: &[u32]) -> Result<()> {
        let alloc = self.buffer_len(handle)?;
        if offset_words + data.len() > alloc {
            return Err(Error::Dma(format!(
                "write of {} words at offset {} exceeds allocation of {}",
                data.len(),
                offset_words,
                alloc
            )));
        }
        unsafe {
            let base = (self.api.fpga_get_dma_buffer)(handle as *mut c_void) as *mut u32;
            if base.is_null() {
                return Err(Error::BadHandle(handle));
            }
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset_words), data.len());
        }
        Ok(())
    }

    fn send_open(
        &self,
        board: u32,
        chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()> {
        self.buffer_len(handle)?;
        let ret = unsafe {
            (self.api.fpga_send)(
                board,
                chnl,
                handle as *mut c_void,
                len_words as u64,
                offset_words as u64,
                1, // last
                0, // mm_addr
                0, // mm_addr_inc
                0, // non-blocking
            )
        };
        self.check_dma(ret).map(|_| ())
    }

    fn recv_open(
        &self,
        board: u32,
        chnl: u32,
        handle: BufHandle,
        len_words: usize,
        offset_words: usize,
    ) -> Result<()> {
        self.buffer_len(handle)?;
        let ret = unsafe {
            (self.api.fpga_recv)(
                board,
                chnl,
                handle as *mut c_void,
                len_words as u64,
                offset_words as u64,
                1,
                0,
                0,
                0,
            )
        };
        self.check_dma(ret).map(|_| ())
    }

    fn wait_dma(&self, handle: BufHandle, timeout_ms: i32) -> Result<usize> {
        self.buffer_len(handle)?;
        let ret = unsafe { (self.api.fpga_wait_dma)(handle as *mut c_void, timeout_ms) };
        self.check_dma(ret)
    }

    fn poll_dma(&self, handle: BufHandle) -> Result<usize> {
        self.buffer_len(handle)?;
        let ret = unsafe { (self.api.fpga_poll_dma)(handle as *mut c_void) };
        self.check_dma(ret)
    }

    fn break_dma(&self, handle: BufHandle) -> Result<usize> {
        self.buffer_len(handle)?;
        let ret = unsafe { (self.api.fpga_break_dma)(handle as *mut c_void) };
        self.check_dma(ret)
    }

    fn wait_irq(&self, board: u32, irq: u32, timeout_ms: i32) -> Result<()> {
        if unsafe { (self.api.fpga_wait_irq)(board, irq, timeout_ms) } != 0 {
            Ok(())
        } else {
            Err(Error::IrqTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_pairs_to_zero() {
        let xdma = Xdma::sim();
        for _ in 0..3 {
            xdma.open_board(2).unwrap();
        }
        assert_eq!(xdma.open_count(2), 3);
        for _ in 0..3 {
            xdma.close_board(2).unwrap();
        }
        assert_eq!(xdma.open_count(2), 0);
        // an unpaired close is tolerated
        xdma.close_board(2).unwrap();
        assert_eq!(xdma.open_count(2), 0);
    }

    #[test]
    fn clones_share_the_refcount_table() {
        let a = Xdma::sim();
        let b = a.clone();
        a.open_board(0).unwrap();
        b.open_board(0).unwrap();
        assert_eq!(a.open_count(0), 2);
        b.close_board(0).unwrap();
        assert_eq!(a.open_count(0), 1);
    }

    #[test]
    fn registers_hold_written_values() {
        let xdma = Xdma::sim();
        xdma.open_board(0).unwrap();
        xdma.alite_write(0, 0x3030, 0xDEAD_BEEF).unwrap();
        assert_eq!(xdma.alite_read(0, 0x3030).unwrap(), 0xDEAD_BEEF);
        assert_eq!(xdma.alite_read(0, 0x4040).unwrap(), 0);
    }

    #[test]
    fn sim_dma_roundtrip() {
        let xdma = Xdma::sim();
        xdma.open_board(0).unwrap();
        let buf = xdma.alloc_buffer(0, 16).unwrap();
        xdma.recv_open(0, 0, buf, 16, 0).unwrap();
        assert_eq!(xdma.wait_dma(buf, Duration::from_secs(1)).unwrap(), 16);
        let words = xdma.read_buffer(buf, 16).unwrap();
        assert_eq!(words[0], 0);
        assert_eq!(words[15], 15);
        xdma.free_buffer(buf).unwrap();
        assert!(xdma.read_buffer(buf, 1).is_err());
    }

    #[test]
    fn sim_has_no_irq_machinery() {
        let xdma = Xdma::sim();
        match xdma.wait_irq(0, 15, Duration::from_millis(1)) {
            Err(Error::Unsupported(_)) => (),
            other => panic!("expected Unsupported, got {:?}", other.map(|_| ())),
        }
    }
}
