use crate::error::TouchError;
use crate::native::RawIo;
use std::io;

// TouchComm framing.
pub const TCM_MARKER: u8 = 0xA5;
pub const TCM_END_MARKER: u8 = 0x5A;
pub const TCM_HEADER_LEN: usize = 4;
/// Continued read = 2 header bytes + payload + end marker.
pub const TCM_FRAMING_OVERHEAD: usize = 3;

pub const TCM_STATUS_OK: u8 = 0x01;
pub const TCM_STATUS_CONTINUED_READ: u8 = 0x03;

pub const TCM_CMD_IDENTIFY: u8 = 0x02;
pub const TCM_CMD_ENABLE_REPORT: u8 = 0x05;
pub const TCM_CMD_DISABLE_REPORT: u8 = 0x06;
pub const TCM_CMD_GET_APPLICATION_INFO: u8 = 0x20;
pub const TCM_CMD_SET_DYNAMIC_CONFIG: u8 = 0x24;
pub const TCM_CMD_REZERO: u8 = 0x27;
pub const TCM_CMD_PRODUCTION_TEST: u8 = 0x2A;

pub const TCM_REPORT_TOUCH: u8 = 0x11;
pub const TCM_REPORT_DELTA: u8 = 0x12;
pub const TCM_REPORT_RAW: u8 = 0x13;

pub const TCM_DC_NO_DOZE: u8 = 0x01;

// RMI4 register map.
pub const RMI_PDT_START: u16 = 0x00E9;
pub const RMI_PDT_END: u16 = 0x000A;
pub const RMI_PDT_ENTRY_SIZE: u16 = 6;
pub const RMI_MAX_PAGES: u8 = 4;

pub const RMI_REPORT_DELTA: u8 = 0x02;
pub const RMI_REPORT_RAW: u8 = 0x03;
pub const RMI_REPORT_HIGH_RESISTANCE: u8 = 0x04;
pub const RMI_REPORT_TRX_SHORT: u8 = 0x1A;
pub const RMI_REPORT_ABS_RAW: u8 = 0x26;
pub const RMI_REPORT_TDDI_NOISE: u8 = 0x5E;
/// Bytes in the TRx short bitmap (one bit per pin).
pub const RMI_TRX_BITMAP_LEN: usize = 7;

pub const F54_CMD_GET_REPORT: u8 = 0x01;
pub const F54_CMD_FORCE_CAL: u8 = 0x02;
pub const F01_CTRL0_NO_SLEEP: u8 = 0x04;

/// Decoded 4-byte TouchComm response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcmHeader {
    pub marker: u8,
    pub status: u8,
    pub length: usize,
}

impl TcmHeader {
    pub fn parse(buf: &[u8; TCM_HEADER_LEN]) -> Self {
        Self {
            marker: buf[0],
            status: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]) as usize,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TCM_STATUS_OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcmResponse {
    pub header: [u8; TCM_HEADER_LEN],
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("command 0x{command:02X} returned status 0x{status:02X}")]
    Status { command: u8, status: u8 },
}

impl From<ExchangeError> for io::Error {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Io(e) => e,
            status @ ExchangeError::Status { .. } => {
                io::Error::new(io::ErrorKind::TimedOut, status.to_string())
            }
        }
    }
}

impl From<ExchangeError> for TouchError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Io(source) => TouchError::Io { op: "write", source },
            ExchangeError::Status { command, status } => {
                TouchError::CommandTimeout { command, status }
            }
        }
    }
}

/// Send a TouchComm command and collect its response.
///
/// The write returns only the header. A payload is fetched with a second
/// read of `length + 3` bytes, and only when the header reports success.
pub fn tcm_exchange<D: RawIo + ?Sized>(
    dev: &mut D,
    command: u8,
    payload: &[u8],
) -> Result<TcmResponse, ExchangeError> {
    let mut header = [0u8; TCM_HEADER_LEN];
    let n = dev.write(command as u16, payload, &mut header)?;
    if n < TCM_HEADER_LEN {
        return Err(short_read(n, TCM_HEADER_LEN).into());
    }

    let head = TcmHeader::parse(&header);
    if !head.is_ok() {
        return Err(ExchangeError::Status {
            command,
            status: head.status,
        });
    }

    let payload = if head.length > 0 {
        read_continued(dev, head.length)?
    } else {
        Vec::new()
    };

    Ok(TcmResponse { header, payload })
}

/// Read the `length + 3` byte continuation of a packet and strip its framing.
pub fn read_continued<D: RawIo + ?Sized>(dev: &mut D, length: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; length + TCM_FRAMING_OVERHEAD];
    let n = dev.read(0, &mut buf)?;
    if n < buf.len() {
        return Err(short_read(n, buf.len()));
    }
    if buf[0] != TCM_MARKER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad continuation marker 0x{:02X}", buf[0]),
        ));
    }
    Ok(buf[2..2 + length].to_vec())
}

/// Build the bytes the controller expects for a continued read.
pub fn frame_continued(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + TCM_FRAMING_OVERHEAD);
    buf.push(TCM_MARKER);
    buf.push(TCM_STATUS_CONTINUED_READ);
    buf.extend_from_slice(payload);
    buf.push(TCM_END_MARKER);
    buf
}

pub fn tcm_header(status: u8, length: usize) -> [u8; TCM_HEADER_LEN] {
    let len = (length as u16).to_le_bytes();
    [TCM_MARKER, status, len[0], len[1]]
}

fn short_read(got: usize, want: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short read: {} of {} bytes", got, want),
    )
}

/// One Page Description Table entry, with bases already made absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdtEntry {
    pub function: u8,
    pub query_base: u16,
    pub command_base: u16,
    pub control_base: u16,
    pub data_base: u16,
    pub interrupt_count: u8,
}

impl PdtEntry {
    /// `None` marks the end of a page (function number 0x00 or 0xFF).
    pub fn parse(page: u8, raw: &[u8; 6]) -> Option<Self> {
        let function = raw[5];
        if function == 0x00 || function == 0xFF {
            return None;
        }
        let base = (page as u16) << 8;
        Some(Self {
            function,
            query_base: base | raw[0] as u16,
            command_base: base | raw[1] as u16,
            control_base: base | raw[2] as u16,
            data_base: base | raw[3] as u16,
            interrupt_count: raw[4] & 0x07,
        })
    }
}

/// Little-endian 16-bit samples into `out`; delta images are signed, raw
/// images unsigned.
pub fn decode_samples(bytes: &[u8], signed: bool, out: &mut [i32]) -> io::Result<()> {
    if bytes.len() < out.len() * 2 {
        return Err(short_read(bytes.len(), out.len() * 2));
    }
    for (dst, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *dst = if signed {
            i16::from_le_bytes([pair[0], pair[1]]) as i32
        } else {
            u16::from_le_bytes([pair[0], pair[1]]) as i32
        };
    }
    Ok(())
}

/// A bound slice holds nothing (unbounded), one shared value, or one value
/// per sample.
pub fn within_limits(values: &[i32], min: &[i32], max: &[i32]) -> bool {
    let bound = |limits: &[i32], i: usize| -> Option<i32> {
        match limits.len() {
            0 => None,
            1 => Some(limits[0]),
            _ => limits.get(i).copied(),
        }
    };
    values.iter().enumerate().all(|(i, &v)| {
        bound(min, i).map_or(true, |lo| v >= lo) && bound(max, i).map_or(true, |hi| v <= hi)
    })
}

/// Expand a bitmap into one 0/1 value per pin, LSB first.
pub fn bitmap_to_pins(bytes: &[u8], pins: usize) -> Vec<i32> {
    (0..pins)
        .map(|pin| {
            bytes
                .get(pin / 8)
                .map_or(0, |b| ((b >> (pin % 8)) & 0x01) as i32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let head = TcmHeader::parse(&[0xA5, 0x01, 0x10, 0x01]);
        assert!(head.is_ok());
        assert_eq!(head.length, 0x0110);
        assert!(!TcmHeader::parse(&[0xA5, 0x02, 0, 0]).is_ok());
    }

    #[test]
    fn continued_framing_wraps_payload() {
        let framed = frame_continued(&[1, 2, 3]);
        assert_eq!(framed, vec![0xA5, 0x03, 1, 2, 3, 0x5A]);
        assert_eq!(framed.len(), 3 + TCM_FRAMING_OVERHEAD);
    }

    #[test]
    fn pdt_entry_is_page_relative() {
        let entry = PdtEntry::parse(1, &[0x10, 0x20, 0x30, 0x40, 0x02, 0x54]).unwrap();
        assert_eq!(entry.function, 0x54);
        assert_eq!(entry.query_base, 0x0110);
        assert_eq!(entry.data_base, 0x0140);
        assert_eq!(entry.interrupt_count, 2);
        assert!(PdtEntry::parse(0, &[0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn samples_signed_and_unsigned() {
        let bytes = [0xFF, 0xFF, 0x10, 0x00];
        let mut out = [0i32; 2];
        decode_samples(&bytes, true, &mut out).unwrap();
        assert_eq!(out, [-1, 16]);
        decode_samples(&bytes, false, &mut out).unwrap();
        assert_eq!(out, [65535, 16]);
        assert!(decode_samples(&bytes[..3], true, &mut out).is_err());
    }

    #[test]
    fn scalar_and_per_cell_limits() {
        assert!(within_limits(&[5, 6, 7], &[5], &[7]));
        assert!(!within_limits(&[5, 6, 8], &[5], &[7]));
        assert!(within_limits(&[1, 10], &[0, 9], &[2, 11]));
        assert!(!within_limits(&[1, 8], &[0, 9], &[2, 11]));
        assert!(within_limits(&[-300, 300], &[], &[]));
    }

    #[test]
    fn bitmap_pins_lsb_first() {
        assert_eq!(bitmap_to_pins(&[0b0000_0101, 0x01], 10), vec![1, 0, 1, 0, 0, 0, 0, 0, 1, 0]);
        assert_eq!(bitmap_to_pins(&[], 3), vec![0, 0, 0]);
    }
}
