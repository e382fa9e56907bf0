//! Serial-line command transport. Exactly the TCP command transport's
//! exchange discipline over a UART instead of a socket; the register
//! emulation comes from the provided trait methods.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::api::KitConfig;
use crate::transport::{read_reply, CmdTransport, ReplyMode};
use crate::{Error, Result};

const CMD_TIMEOUT: Duration = Duration::from_secs(15);
// Port-level poll granularity inside the deadline loops.
const POLL: Duration = Duration::from_millis(100);

pub struct SerialCmd {
    port: Mutex<Option<Box<dyn SerialPort>>>,
    timeout: Mutex<Duration>,
    serial: AtomicU32,
}

impl SerialCmd {
    pub fn new() -> SerialCmd {
        SerialCmd {
            port: Mutex::new(None),
            timeout: Mutex::new(CMD_TIMEOUT),
            serial: AtomicU32::new(0),
        }
    }
}

impl Default for SerialCmd {
    fn default() -> Self {
        SerialCmd::new()
    }
}

fn send_all(port: &mut dyn SerialPort, data: &[u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut sent = 0;
    while sent < data.len() {
        match port.write(&data[sent..]) {
            Ok(0) => {
                if Instant::now() >= deadline {
                    return Err(Error::SendTimeout {
                        sent,
                        want: data.len(),
                    });
                }
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if Instant::now() >= deadline {
                    return Err(Error::SendTimeout {
                        sent,
                        want: data.len(),
                    });
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

fn recv_exact(port: &mut dyn SerialPort, len: usize, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut out = vec![0u8; len];
    let mut got = 0;
    while got < len {
        match port.read(&mut out[got..]) {
            Ok(0) => {
                if Instant::now() >= deadline {
                    return Err(Error::RecvTimeout { got, want: len });
                }
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if Instant::now() >= deadline {
                    return Err(Error::RecvTimeout { got, want: len });
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(out)
}

impl CmdTransport for SerialCmd {
    fn accept(&self, cfg: &KitConfig) -> Result<()> {
        let opened = serialport::new(&cfg.cmd_serial_port, cfg.cmd_baud_rate)
            .timeout(POLL)
            .open()
            .map_err(|e| Error::Connect(format!("{}: {}", cfg.cmd_serial_port, e)))?;
        let mut port = self.port.lock().unwrap();
        *port = Some(opened);
        log::info!(
            "cmd link up on {} at {} baud",
            cfg.cmd_serial_port,
            cfg.cmd_baud_rate
        );
        Ok(())
    }

    fn close(&self) {
        // dropping the handle releases the device
        self.port.lock().unwrap().take();
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    fn send_bytes(&self, data: &[u8]) -> Result<usize> {
        let mut port = self.port.lock().unwrap();
        let port = port
            .as_mut()
            .ok_or_else(|| Error::Connect("serial port is not open".to_string()))?;
        send_all(port.as_mut(), data, *self.timeout.lock().unwrap())?;
        Ok(data.len())
    }

    fn recv_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut port = self.port.lock().unwrap();
        let port = port
            .as_mut()
            .ok_or_else(|| Error::Connect("serial port is not open".to_string()))?;
        recv_exact(port.as_mut(), len, *self.timeout.lock().unwrap())
    }

    fn transact(&self, request: &[u8], mode: ReplyMode) -> Result<Vec<u8>> {
        let mut port = self.port.lock().unwrap();
        let port = port
            .as_mut()
            .ok_or_else(|| Error::Connect("serial port is not open".to_string()))?;
        let timeout = *self.timeout.lock().unwrap();
        send_all(port.as_mut(), request, timeout)?;
        read_reply(|n| recv_exact(port.as_mut(), n, timeout), request, mode)
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_is_a_connect_error() {
        let itf = SerialCmd::new();
        let cfg = KitConfig {
            cmd_serial_port: "/definitely/not/a/serial/port".to_string(),
            ..Default::default()
        };
        assert!(matches!(itf.accept(&cfg), Err(Error::Connect(_))));
    }

    #[test]
    fn unlinked_exchange_is_a_connect_error() {
        let itf = SerialCmd::new();
        assert!(matches!(itf.read(0x10), Err(Error::Connect(_))));
        itf.close();
    }
}
