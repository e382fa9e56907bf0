use std::fmt;

/// Everything that can go wrong between the caller and the board.
#[derive(Debug)]
pub enum Error {
    /// The link could not be brought up (unreachable address, missing serial
    /// port, bad board index).
    Connect(String),
    /// Not all bytes of a request could be delivered before the deadline.
    SendTimeout { sent: usize, want: usize },
    /// The peer did not produce the expected bytes before the deadline.
    RecvTimeout { got: usize, want: usize },
    /// A DMA did not complete before the deadline.
    DmaTimeout,
    /// The buffer handle already has a DMA outstanding (or is being freed
    /// while one is).
    BufferBusy(u32),
    /// A frame violated the wire format (short header, impossible length).
    MalformedFrame(String),
    /// The reply header did not carry the reply magic.
    MagicMismatch { want: u32, got: u32 },
    /// The reply echoed a command id we never sent.
    CmdIdMismatch { want: u32, got: u32 },
    /// The reply echoed a serial we never sent.
    SerialMismatch { want: u32, got: u32 },
    /// A named command failed on the device or could not be decoded.
    Command { name: String, detail: String },
    /// The ICD document (or a value fed into it) is invalid.
    Schema(String),
    /// The configured middleware mode cannot work with this transport.
    Incompatible(&'static str),
    /// The device reported a different source channel or leftover words
    /// after a virtual-channel transfer.
    ChannelDesync { chnl: u32, source: u32, residue: u32 },
    /// The operation is not available on this transport.
    Unsupported(&'static str),
    Io(std::io::Error),
    Json(serde_json::Error),
    SerialPort(serialport::Error),
    Driver(xdma::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Connect(m) => write!(f, "connect failed: {}", m),
            Error::SendTimeout { sent, want } => {
                write!(f, "send timed out after {} of {} bytes", sent, want)
            }
            Error::RecvTimeout { got, want } => {
                write!(f, "receive timed out after {} of {} bytes", got, want)
            }
            Error::DmaTimeout => write!(f, "dma timed out"),
            Error::BufferBusy(id) => write!(f, "buffer {} already has a dma outstanding", id),
            Error::MalformedFrame(m) => write!(f, "malformed frame: {}", m),
            Error::MagicMismatch { want, got } => {
                write!(f, "bad reply magic {:#010x} (expected {:#010x})", got, want)
            }
            Error::CmdIdMismatch { want, got } => {
                write!(f, "reply answers command {:#x} while waiting for {:#x}", got, want)
            }
            Error::SerialMismatch { want, got } => {
                write!(f, "reply for exchange {:#x} arrived while waiting for {:#x}", got, want)
            }
            Error::Command { name, detail } => write!(f, "command '{}' failed: {}", name, detail),
            Error::Schema(m) => write!(f, "icd schema error: {}", m),
            Error::Incompatible(m) => write!(f, "incompatible transport: {}", m),
            Error::ChannelDesync { chnl, source, residue } => write!(
                f,
                "virtual channel {} desynchronized: device reports source {} with {} words left",
                chnl, source, residue
            ),
            Error::Unsupported(what) => write!(f, "{} not supported on this transport", what),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Json(e) => write!(f, "json error: {}", e),
            Error::SerialPort(e) => write!(f, "serial port error: {}", e),
            Error::Driver(e) => write!(f, "driver error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::SerialPort(e) => Some(e),
            Error::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::SerialPort(e)
    }
}

impl From<xdma::Error> for Error {
    fn from(e: xdma::Error) -> Self {
        Error::Driver(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
