//! Connection parameters for the toolkit. One `KitConfig` carries the knobs
//! for every transport flavor; each transport picks out the fields it knows.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How the channel middleware maps logical channels onto the physical pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Forward every stream operation straight to the transport.
    Real,
    /// Time-multiplex up to [`crate::vchnl::VCHNL_NUM`] logical channels over
    /// physical channel 0 via the device's parameter/status registers.
    Virtual,
}

impl Default for StreamMode {
    fn default() -> Self {
        StreamMode::Real
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KitConfig {
    /// Device address for the TCP command transport.
    pub cmd_ip: String,
    pub cmd_tcp_port: u16,
    /// Serial device for the serial command transport.
    pub cmd_serial_port: String,
    pub cmd_baud_rate: u32,
    /// Board index for the PCIe command transport.
    pub cmd_board: u32,
    /// Host-to-device scratchpad base (byte address).
    pub cmd_sent_base: u32,
    /// Device-to-host scratchpad base (byte address).
    pub cmd_recv_base: u32,
    /// IRQ flag/acknowledge register.
    pub cmd_irq_base: u32,
    /// Send-done doorbell register.
    pub cmd_sent_down_base: u32,
    /// Device address whose last octet derives the stream server port.
    pub stream_ip: String,
    /// Stream server port; 0 derives it from `stream_ip`.
    pub stream_tcp_port: u16,
    /// Board index for the PCIe stream transport.
    pub stream_board: u32,
    /// ICD document location; `None` loads the bundled default.
    pub icd_path: Option<PathBuf>,
    /// Verify reply headers (magic/id/serial) instead of summing the recv
    /// schema for the reply length.
    pub check_recv_head: bool,
    pub stream_mode: StreamMode,
}

impl Default for KitConfig {
    fn default() -> Self {
        KitConfig {
            cmd_ip: "127.0.0.1".to_string(),
            cmd_tcp_port: 5001,
            cmd_serial_port: "COM0".to_string(),
            cmd_baud_rate: 9600,
            cmd_board: 0,
            cmd_sent_base: 0,
            cmd_recv_base: 0,
            cmd_irq_base: 0x0000_002C,
            cmd_sent_down_base: 0x0000_3030,
            stream_ip: "127.0.0.1".to_string(),
            stream_tcp_port: 0,
            stream_board: 0,
            icd_path: None,
            check_recv_head: true,
            stream_mode: StreamMode::Real,
        }
    }
}

impl KitConfig {
    /// Load a configuration from a JSON file; absent fields fall back to the
    /// defaults above.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<KitConfig> {
        let text = fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(Error::Json)
    }
}
