//! Host-side toolkit for driving an FPGA accelerator board.
//!
//! One `Kit` speaks two planes to the device. The command plane does typed
//! register reads and writes plus named high-level commands described by an
//! ICD document, over whichever link the board offers: TCP, a serial line,
//! or PCIe MMIO mailboxes. The stream plane moves bulk data through
//! pre-allocated DMA buffers, either straight over one physical pipe or
//! time-multiplexed across logical channels by the virtual-channel
//! middleware.
//!
//! ```no_run
//! use std::sync::Arc;
//! use axikit::{Kit, KitConfig, TcpChnl, TcpCmd};
//!
//! let kit = Kit::new(Arc::new(TcpCmd::new()), Arc::new(TcpChnl::new()));
//! let cfg = KitConfig {
//!     cmd_ip: "192.168.1.40".to_string(),
//!     ..Default::default()
//! };
//! kit.link_cmd(&cfg)?;
//! kit.write(0x10, &0u32.to_le_bytes())?;
//! kit.set_param("dds0_freq_hz", 25_000_000u32)?;
//! kit.execute("set_dds0", &[])?;
//! # Ok::<(), axikit::Error>(())
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod api;
pub mod error;
pub mod frame;
pub mod icd;
mod sync;
pub mod transport;
pub mod vchnl;

pub use api::{KitConfig, StreamMode};
pub use error::{Error, Result};
pub use icd::{IcdEngine, Param, ParamValue, TypeTag};
pub use sync::StopFlag;
pub use transport::pcie::{PcieChnl, PcieCmd};
pub use transport::serial::SerialCmd;
pub use transport::tcp::{TcpChnl, TcpCmd};
pub use transport::{BufBacking, BulkMode, CmdTransport, RegOps, ReplyMode, StreamTransport};
pub use vchnl::{VchnlRegs, VirtualChnl, VCHNL_NUM};

/// The front-end object: one command transport, one stream transport, the
/// ICD engine and the channel middleware, linked and driven together.
pub struct Kit {
    itf_cmd: Arc<dyn CmdTransport>,
    icd: Mutex<IcdEngine>,
    vchnl: VirtualChnl,
}

impl Kit {
    pub fn new(itf_cmd: Arc<dyn CmdTransport>, itf_chnl: Arc<dyn StreamTransport>) -> Kit {
        Kit {
            itf_cmd,
            icd: Mutex::new(IcdEngine::new()),
            vchnl: VirtualChnl::new(itf_chnl),
        }
    }

    /// Like `new`, for boards whose virtual-channel register block is not at
    /// the default addresses.
    pub fn with_vchnl_regs(
        itf_cmd: Arc<dyn CmdTransport>,
        itf_chnl: Arc<dyn StreamTransport>,
        regs: VchnlRegs,
    ) -> Kit {
        Kit {
            itf_cmd,
            icd: Mutex::new(IcdEngine::new()),
            vchnl: VirtualChnl::with_regs(itf_chnl, regs),
        }
    }

    /// Bring up the command plane: connect the transport and load the ICD.
    pub fn link_cmd(&self, cfg: &KitConfig) -> Result<()> {
        self.itf_cmd.accept(cfg)?;
        self.icd.lock().unwrap().config(cfg)
    }

    pub fn unlink_cmd(&self) {
        self.itf_cmd.close();
    }

    /// Bring up the stream plane: connect the transport and configure the
    /// channel middleware.
    pub fn link_stream(&self, cfg: &KitConfig) -> Result<()> {
        self.vchnl.itf().accept(cfg)?;
        self.vchnl.config(cfg)
    }

    pub fn unlink_stream(&self) {
        self.vchnl.itf().close();
    }

    pub fn set_cmd_timeout(&self, timeout: Duration) {
        self.itf_cmd.set_timeout(timeout);
    }

    // --- register plane ------------------------------------------------------

    /// Write one register; `value` is at most 4 bytes, zero-extended.
    pub fn write(&self, addr: u32, value: &[u8]) -> Result<()> {
        check_reg_value(value)?;
        self.itf_cmd.write(addr, value)
    }

    pub fn read(&self, addr: u32) -> Result<u32> {
        self.itf_cmd.read(addr)
    }

    /// Ordered multi-register write.
    pub fn bulk_write(&self, regs: &[(u32, [u8; 4])]) -> Result<()> {
        self.itf_cmd.multi_write(regs)
    }

    /// Ordered multi-register read.
    pub fn bulk_read(&self, addrs: &[u32]) -> Result<Vec<u32>> {
        self.itf_cmd.multi_read(addrs)
    }

    /// Multi-word write walking consecutive addresses (`Increment`) or
    /// hammering the base (`Loop`).
    pub fn block_write(
        &self,
        addr: u32,
        data: &[u8],
        mode: BulkMode,
        reg_width: usize,
    ) -> Result<()> {
        check_reg_width(reg_width)?;
        match mode {
            BulkMode::Increment => self.itf_cmd.increment_write(addr, data, reg_width),
            BulkMode::Loop => self.itf_cmd.loop_write(addr, data, reg_width),
        }
    }

    /// Multi-word read; the address walk mirrors `block_write`.
    pub fn block_read(
        &self,
        addr: u32,
        byte_len: usize,
        mode: BulkMode,
        reg_width: usize,
    ) -> Result<Vec<u8>> {
        check_reg_width(reg_width)?;
        match mode {
            BulkMode::Increment => self.itf_cmd.increment_read(addr, byte_len, reg_width),
            BulkMode::Loop => self.itf_cmd.loop_read(addr, byte_len, reg_width),
        }
    }

    // --- command plane -------------------------------------------------------

    pub fn set_param(&self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        self.icd.lock().unwrap().set_param(name, value)
    }

    pub fn get_param(&self, name: &str) -> Result<ParamValue> {
        self.icd.lock().unwrap().get_param(name)
    }

    /// Run a named ICD command; `arrays` feeds any `__array__N` fields.
    pub fn execute(&self, name: &str, arrays: &[&[u8]]) -> Result<Vec<u8>> {
        self.icd
            .lock()
            .unwrap()
            .execute(self.itf_cmd.as_ref(), name, arrays)
    }

    /// Run every command whose send schema uses the parameter, in document
    /// order.
    pub fn execute_from_pname(&self, pname: &str) -> Result<Vec<Vec<u8>>> {
        self.icd
            .lock()
            .unwrap()
            .execute_from_pname(self.itf_cmd.as_ref(), pname)
    }

    /// Write the running ICD (current parameter values included) to a file.
    pub fn save_icd<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.icd.lock().unwrap().save(path)
    }

    // --- stream plane --------------------------------------------------------

    pub fn alloc_buffer(&self, byte_len: usize, backing: Option<BufBacking>) -> Result<u32> {
        self.vchnl.alloc_buffer(byte_len, backing)
    }

    pub fn free_buffer(&self, buf: u32) -> Result<()> {
        self.vchnl.free_buffer(buf)
    }

    pub fn get_buffer(&self, buf: u32, byte_len: usize) -> Result<Vec<u32>> {
        self.vchnl.get_buffer(buf, byte_len)
    }

    pub fn open_send(&self, chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()> {
        self.vchnl.open_send(chnl, buf, byte_len, byte_offset)
    }

    pub fn open_recv(&self, chnl: u32, buf: u32, byte_len: usize, byte_offset: usize) -> Result<()> {
        self.vchnl.open_recv(chnl, buf, byte_len, byte_offset)
    }

    pub fn wait_stream(&self, buf: u32, timeout: Duration) -> Result<usize> {
        self.vchnl.wait_stream(buf, timeout)
    }

    pub fn break_stream(&self, buf: u32) -> Result<usize> {
        self.vchnl.break_stream(buf)
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
        self.vchnl
            .stream_recv(chnl, buf, byte_len, byte_offset, stop, timeout)
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
        self.vchnl
            .stream_send(chnl, buf, byte_len, byte_offset, stop, timeout)
    }
}

fn check_reg_value(value: &[u8]) -> Result<()> {
    if value.is_empty() || value.len() > 4 {
        return Err(Error::Schema(format!(
            "register values are 1 to 4 bytes, not {}",
            value.len()
        )));
    }
    Ok(())
}

fn check_reg_width(reg_width: usize) -> Result<()> {
    if reg_width == 0 {
        return Err(Error::Schema("register width cannot be zero".to_string()));
    }
    Ok(())
}
