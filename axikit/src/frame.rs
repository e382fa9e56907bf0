//! The command frame shared by every transport: a 16-byte little-endian
//! header (magic, command id, serial, total length) followed by a
//! per-command body. The same layout travels over TCP, the serial line and
//! the PCIe mailbox scratchpads.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::{Error, Result};

/// Request header magic.
pub const REQ_MAGIC: u32 = 0x5F5F_5F5F;
/// Reply header magic.
pub const REPLY_MAGIC: u32 = 0xCFCF_CFCF;
/// Header size; also the minimum legal frame length.
pub const HEAD_LEN: usize = 16;

/// Command ids reserved for register emulation over byte-stream transports.
/// Everything outside this range belongs to the ICD document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum VRegCmd {
    WriteReg = 0x3100_1000,
    ReadReg = 0x3100_1001,
    IncrWrite = 0x3100_1010,
    IncrRead = 0x3100_1011,
    LoopWrite = 0x3100_1020,
    LoopRead = 0x3100_1021,
}

impl VRegCmd {
    pub fn from_id(id: u32) -> Option<VRegCmd> {
        FromPrimitive::from_u32(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHead {
    pub magic: u32,
    pub cmd_id: u32,
    pub serial: u32,
    pub total_len: u32,
}

impl FrameHead {
    pub fn pack(&self) -> [u8; HEAD_LEN] {
        let mut out = [0u8; HEAD_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.cmd_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.serial.to_le_bytes());
        out[12..16].copy_from_slice(&self.total_len.to_le_bytes());
        out
    }

    pub fn unpack(data: &[u8]) -> Result<FrameHead> {
        if data.len() < HEAD_LEN {
            return Err(Error::MalformedFrame(format!(
                "{} bytes is too short for a frame head",
                data.len()
            )));
        }
        let word = |i: usize| u32::from_le_bytes(data[i..i + 4].try_into().unwrap());
        Ok(FrameHead {
            magic: word(0),
            cmd_id: word(4),
            serial: word(8),
            total_len: word(12),
        })
    }
}

/// Verify a reply head against the request it answers and return the total
/// reply length. The reply must carry the reply magic and echo the request's
/// command id and serial; its length must cover at least the header.
pub fn check_reply_head(request: &FrameHead, reply: &FrameHead) -> Result<usize> {
    if reply.magic != REPLY_MAGIC {
        return Err(Error::MagicMismatch {
            want: REPLY_MAGIC,
            got: reply.magic,
        });
    }
    if reply.cmd_id != request.cmd_id {
        return Err(Error::CmdIdMismatch {
            want: request.cmd_id,
            got: reply.cmd_id,
        });
    }
    if reply.serial != request.serial {
        return Err(Error::SerialMismatch {
            want: request.serial,
            got: reply.serial,
        });
    }
    if (reply.total_len as usize) < HEAD_LEN {
        return Err(Error::MalformedFrame(format!(
            "reply announces {} bytes, below the header size",
            reply.total_len
        )));
    }
    Ok(reply.total_len as usize)
}

/// Build a virtual-register request: header, register address, then the
/// value bytes (empty for the read flavors).
pub fn vreg_frame(cmd: VRegCmd, serial: u32, addr: u32, value: &[u8]) -> Vec<u8> {
    let head = FrameHead {
        magic: REQ_MAGIC,
        cmd_id: cmd as u32,
        serial,
        total_len: (HEAD_LEN + 4 + value.len()) as u32,
    };
    let mut out = Vec::with_capacity(HEAD_LEN + 4 + value.len());
    out.extend_from_slice(&head.pack());
    out.extend_from_slice(&addr.to_le_bytes());
    out.extend_from_slice(value);
    out
}

/// Overwrite a frame's serial field in place.
pub fn stamp_serial(frame: &mut [u8], serial: u32) {
    frame[8..12].copy_from_slice(&serial.to_le_bytes());
}

/// Overwrite a frame's length field with its actual length.
pub fn stamp_len(frame: &mut [u8]) {
    let len = frame.len() as u32;
    frame[12..16].copy_from_slice(&len.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_roundtrip() {
        let head = FrameHead {
            magic: REQ_MAGIC,
            cmd_id: 0x3100_1000,
            serial: 7,
            total_len: 24,
        };
        assert_eq!(FrameHead::unpack(&head.pack()).unwrap(), head);
    }

    #[test]
    fn write_frame_matches_wire_literal() {
        // write(0x10, 00 00 00 00), first exchange on the transport
        let frame = vreg_frame(VRegCmd::WriteReg, 0, 0x10, &[0, 0, 0, 0]);
        assert_eq!(
            frame,
            [
                0x5F, 0x5F, 0x5F, 0x5F, // magic
                0x00, 0x10, 0x00, 0x31, // command id
                0x00, 0x00, 0x00, 0x00, // serial
                0x18, 0x00, 0x00, 0x00, // total length 24
                0x10, 0x00, 0x00, 0x00, // register address
                0x00, 0x00, 0x00, 0x00, // value
            ]
        );
    }

    #[test]
    fn read_frame_is_twenty_bytes() {
        let frame = vreg_frame(VRegCmd::ReadReg, 3, 0x20, &[]);
        assert_eq!(frame.len(), 20);
        assert_eq!(&frame[12..16], &[20, 0, 0, 0]);
        assert_eq!(&frame[8..12], &[3, 0, 0, 0]);
    }

    #[test]
    fn reply_check_enforces_magic_and_serial() {
        let req = FrameHead {
            magic: REQ_MAGIC,
            cmd_id: 0x3100_1001,
            serial: 5,
            total_len: 20,
        };
        let mut reply = FrameHead {
            magic: REPLY_MAGIC,
            cmd_id: 0x3100_1001,
            serial: 5,
            total_len: 24,
        };
        assert_eq!(check_reply_head(&req, &reply).unwrap(), 24);

        reply.magic = REQ_MAGIC;
        assert!(matches!(
            check_reply_head(&req, &reply),
            Err(Error::MagicMismatch { .. })
        ));
        reply.magic = REPLY_MAGIC;

        reply.cmd_id = 0x3100_1000;
        assert!(matches!(
            check_reply_head(&req, &reply),
            Err(Error::CmdIdMismatch { .. })
        ));
        reply.cmd_id = 0x3100_1001;

        reply.serial = 6;
        assert!(matches!(
            check_reply_head(&req, &reply),
            Err(Error::SerialMismatch { .. })
        ));
        reply.serial = 5;

        reply.total_len = 8;
        assert!(matches!(
            check_reply_head(&req, &reply),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn reserved_ids_resolve() {
        assert_eq!(VRegCmd::from_id(0x3100_1011), Some(VRegCmd::IncrRead));
        assert_eq!(VRegCmd::from_id(0x3100_1002), None);
    }
}
