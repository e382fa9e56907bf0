//! Raw symbol table for the vendor `xdma_api` shared library.
//!
//! The library is resolved once at first use and stays mapped for the life of
//! the process; all symbols are plain C functions taking board indices and
//! DMA descriptor handles.

use std::env;
use std::os::raw::{c_char, c_int, c_uint, c_ulonglong, c_void};

use libloading::Library;

use crate::{Error, Result};

#[cfg(windows)]
const LIB_NAME: &str = "xdma_api.dll";
#[cfg(not(windows))]
const LIB_NAME: &str = "libxdma_api.so";

/// Environment override for the driver library path.
pub const LIB_ENV: &str = "XDMA_LIBRARY";

pub(crate) struct XdmaApi {
    pub fpga_open: unsafe extern "C" fn(c_uint, c_uint) -> bool,
    pub fpga_close: unsafe extern "C" fn(c_uint),
    pub fpga_info_string: unsafe extern "C" fn(c_uint) -> *const c_char,
    pub fpga_alloc_dma:
        unsafe extern "C" fn(c_uint, c_ulonglong, *mut c_void, *mut c_void) -> *mut c_void,
    pub fpga_get_dma_buffer: unsafe extern "C" fn(*mut c_void) -> *mut c_void,
    pub fpga_free_dma: unsafe extern "C" fn(*mut c_void),
    pub fpga_send: unsafe extern "C" fn(
        c_uint,
        c_uint,
        *mut c_void,
        c_ulonglong,
        c_ulonglong,
        c_uint,
        c_uint,
        c_uint,
        c_int,
    ) -> c_ulonglong,
    pub fpga_recv: unsafe extern "C" fn(
        c_uint,
        c_uint,
        *mut c_void,
        c_ulonglong,
        c_ulonglong,
        c_uint,
        c_uint,
        c_uint,
        c_int,
    ) -> c_ulonglong,
    pub fpga_wait_dma: unsafe extern "C" fn(*mut c_void, c_int) -> c_ulonglong,
    pub fpga_poll_dma: unsafe extern "C" fn(*mut c_void) -> c_ulonglong,
    pub fpga_break_dma: unsafe extern "C" fn(*mut c_void) -> c_ulonglong,
    pub fpga_wr_lite: unsafe extern "C" fn(c_uint, c_uint, c_uint),
    pub fpga_rd_lite: unsafe extern "C" fn(c_uint, c_uint) -> c_uint,
    pub fpga_wait_irq: unsafe extern "C" fn(c_uint, c_uint, c_int) -> c_uint,
    pub fpga_err_msg: unsafe extern "C" fn() -> *const c_char,
}

macro_rules! sym {
    ($lib:expr, $name:literal) => {
        *$lib
            .get(concat!($name, "\0").as_bytes())
            .map_err(|e| Error::Load(format!("{}: {}", $name, e)))?
    };
}

impl XdmaApi {
    pub fn load() -> Result<XdmaApi> {
        let path = env::var(LIB_ENV).unwrap_or_else(|_| LIB_NAME.to_string());
        // The driver is never unloaded once opened, so the mapping is leaked
        // on purpose and the symbol pointers below are 'static.
        let lib: &'static Library = Box::leak(Box::new(
            unsafe { Library::new(&path) }
                .map_err(|e| Error::Load(format!("{}: {}", path, e)))?,
        ));
        log::info!("xdma driver loaded from {}", path);
        unsafe {
            Ok(XdmaApi {
                fpga_open: sym!(lib, "fpga_open"),
                fpga_close: sym!(lib, "fpga_close"),
                fpga_info_string: sym!(lib, "fpga_info_string"),
                fpga_alloc_dma: sym!(lib, "fpga_alloc_dma"),
                fpga_get_dma_buffer: sym!(lib, "fpga_get_dma_buffer"),
                fpga_free_dma: sym!(lib, "fpga_free_dma"),
                fpga_send: sym!(lib, "fpga_send"),
                fpga_recv: sym!(lib, "fpga_recv"),
                fpga_wait_dma: sym!(lib, "fpga_wait_dma"),
                fpga_poll_dma: sym!(lib, "fpga_poll_dma"),
                fpga_break_dma: sym!(lib, "fpga_break_dma"),
                fpga_wr_lite: sym!(lib, "fpga_wr_lite"),
                fpga_rd_lite: sym!(lib, "fpga_rd_lite"),
                fpga_wait_irq: sym!(lib, "fpga_wait_irq"),
                fpga_err_msg: sym!(lib, "fpga_err_msg"),
            })
        }
    }
}
