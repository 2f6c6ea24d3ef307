use super::chardev::CharNode;
use super::{ErrorLog, Geometry, IdentifyInfo, InterfaceKind, NativeDevice, RawIo, StreamOptions};
use crate::protocol::{
    bitmap_to_pins, decode_samples, read_continued, tcm_exchange, within_limits, TcmHeader,
    TCM_CMD_DISABLE_REPORT, TCM_CMD_ENABLE_REPORT, TCM_CMD_GET_APPLICATION_INFO,
    TCM_CMD_IDENTIFY, TCM_CMD_PRODUCTION_TEST, TCM_CMD_REZERO, TCM_CMD_SET_DYNAMIC_CONFIG,
    TCM_DC_NO_DOZE, TCM_HEADER_LEN, TCM_MARKER, TCM_REPORT_DELTA, TCM_REPORT_TOUCH,
};
use std::io;
use std::path::Path;

/// Non-matching packets tolerated while waiting for a requested report.
const MAX_SKIPPED_PACKETS: usize = 64;

// Production tests whose result is a per-pin bitmap.
const PT_TRX_TRX_SHORT: u8 = 0x01;
const PT_TRX_SENSOR_OPEN: u8 = 0x02;
const PT_TRX_GROUND_SHORT: u8 = 0x03;

const IDENTIFY_MIN_LEN: usize = 22;
const APP_INFO_MIN_LEN: usize = 48;

/// TouchComm controller behind the kernel's `/dev/tcmN` packet node.
pub struct TcmDevice {
    node: CharNode,
    touch_disabled: bool,
    errors: ErrorLog,
}

impl TcmDevice {
    pub fn new(path: &Path) -> Self {
        Self {
            node: CharNode::new(path),
            touch_disabled: false,
            errors: ErrorLog::default(),
        }
    }

    fn command(&mut self, command: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
        Ok(tcm_exchange(self, command, payload)?.payload)
    }

    fn do_identify(&mut self) -> io::Result<IdentifyInfo> {
        let ident = self.command(TCM_CMD_IDENTIFY, &[])?;
        let (device_id, firmware_id) = parse_identify(&ident)?;
        let app = self.command(TCM_CMD_GET_APPLICATION_INFO, &[])?;
        let mut info = parse_app_info(&app)?;
        info.device_id = device_id;
        info.firmware_id = firmware_id;
        Ok(info)
    }

    fn do_prepare(&mut self, no_sleep: bool, rezero: bool) -> io::Result<()> {
        self.command(TCM_CMD_SET_DYNAMIC_CONFIG, &[TCM_DC_NO_DOZE, no_sleep as u8, 0x00])?;
        if rezero {
            self.command(TCM_CMD_REZERO, &[])?;
        }
        Ok(())
    }

    fn do_start_report(&mut self, code: u8, opts: StreamOptions) -> io::Result<()> {
        self.do_prepare(opts.no_sleep, opts.rezero)?;
        if !opts.touch_enabled {
            self.command(TCM_CMD_DISABLE_REPORT, &[TCM_REPORT_TOUCH])?;
            self.touch_disabled = true;
        }
        self.command(TCM_CMD_ENABLE_REPORT, &[code])?;
        Ok(())
    }

    /// Every step is attempted; the first failure is returned.
    fn do_stop_report(&mut self, code: u8) -> io::Result<()> {
        let mut first_err = None;
        if let Err(e) = self.command(TCM_CMD_DISABLE_REPORT, &[code]) {
            first_err.get_or_insert(e);
        }
        if self.touch_disabled {
            self.touch_disabled = false;
            if let Err(e) = self.command(TCM_CMD_ENABLE_REPORT, &[TCM_REPORT_TOUCH]) {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.command(TCM_CMD_SET_DYNAMIC_CONFIG, &[TCM_DC_NO_DOZE, 0x00, 0x00]) {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn do_request_report(&mut self, code: u8, out: &mut [i32]) -> io::Result<()> {
        for _ in 0..MAX_SKIPPED_PACKETS {
            let mut header = [0u8; TCM_HEADER_LEN];
            self.node.read_stream(&mut header)?;
            let head = TcmHeader::parse(&header);
            if head.marker != TCM_MARKER {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad packet marker 0x{:02X}", head.marker),
                ));
            }
            let payload = if head.length > 0 {
                read_continued(self, head.length)?
            } else {
                Vec::new()
            };
            if head.status == code {
                return decode_samples(&payload, code == TCM_REPORT_DELTA, out);
            }
            log::debug!("tcm: skipping packet 0x{:02X} ({} bytes)", head.status, head.length);
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("report 0x{:02X} not received", code),
        ))
    }

    fn do_run_test(&mut self, test_id: u8) -> io::Result<Vec<i32>> {
        let payload = self.command(TCM_CMD_PRODUCTION_TEST, &[test_id])?;
        match test_id {
            PT_TRX_TRX_SHORT | PT_TRX_SENSOR_OPEN | PT_TRX_GROUND_SHORT => {
                Ok(bitmap_to_pins(&payload, payload.len() * 8))
            }
            _ => {
                let mut values = vec![0i32; payload.len() / 2];
                decode_samples(&payload, true, &mut values)?;
                Ok(values)
            }
        }
    }
}

fn le16(buf: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([buf[offset], buf[offset + 1]]) as usize
}

fn too_short(what: &str, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{} packet too short ({} bytes)", what, len),
    )
}

/// IDENTIFY payload: version, mode, part number[16], build id (u32 LE), ...
fn parse_identify(payload: &[u8]) -> io::Result<(String, u32)> {
    if payload.len() < IDENTIFY_MIN_LEN {
        return Err(too_short("identify", payload.len()));
    }
    let part = String::from_utf8_lossy(&payload[2..18])
        .trim_end_matches('\0')
        .trim()
        .to_string();
    let build = u32::from_le_bytes([payload[18], payload[19], payload[20], payload[21]]);
    Ok((part, build))
}

fn parse_app_info(payload: &[u8]) -> io::Result<IdentifyInfo> {
    if payload.len() < APP_INFO_MIN_LEN {
        return Err(too_short("application info", payload.len()));
    }
    let config_id = payload[16..32].iter().map(|b| format!("{:02X}", b)).collect();
    Ok(IdentifyInfo {
        config_id,
        button_count: le16(payload, 38),
        image_rows: le16(payload, 40),
        image_cols: le16(payload, 42),
        has_hybrid: le16(payload, 44) != 0,
        force_electrode_count: le16(payload, 46),
        ..IdentifyInfo::default()
    })
}

/// `[command, len_lo, len_hi, data...]`
fn command_packet(command: u16, data: &[u8]) -> io::Result<Vec<u8>> {
    let command = u8::try_from(command).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("command 0x{:X} does not fit in one byte", command),
        )
    })?;
    let len = u16::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} byte payload exceeds the 16-bit length field", data.len()),
        )
    })?;
    let mut packet = Vec::with_capacity(data.len() + 3);
    packet.push(command);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(data);
    Ok(packet)
}

impl RawIo for TcmDevice {
    fn read(&mut self, _addr: u16, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.node.read_stream(buf);
        self.errors.track("read", res)
    }

    fn write(&mut self, command: u16, data: &[u8], resp: &mut [u8]) -> io::Result<usize> {
        let res = command_packet(command, data).and_then(|packet| {
            self.node.write_stream(&packet)?;
            let n = resp.len().min(TCM_HEADER_LEN);
            self.node.read_stream(&mut resp[..n])
        });
        self.errors.track("write", res)
    }
}

impl NativeDevice for TcmDevice {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Tcm
    }

    fn open(&mut self) -> io::Result<()> {
        let res = self.node.open();
        self.errors.track("open", res)
    }

    fn close(&mut self) -> io::Result<()> {
        let res = self.node.close();
        self.errors.track("close", res)
    }

    fn identify(&mut self) -> io::Result<IdentifyInfo> {
        let res = self.do_identify();
        self.errors.track("identify", res)
    }

    fn prepare(&mut self, no_sleep: bool, rezero: bool) -> io::Result<()> {
        let res = self.do_prepare(no_sleep, rezero);
        self.errors.track("prepare", res)
    }

    fn start_report(&mut self, code: u8, opts: StreamOptions) -> io::Result<()> {
        let res = self.do_start_report(code, opts);
        self.errors.track("start_report", res)
    }

    fn stop_report(&mut self, code: u8) -> io::Result<()> {
        let res = self.do_stop_report(code);
        self.errors.track("stop_report", res)
    }

    fn request_report(&mut self, code: u8, _geometry: Geometry, out: &mut [i32]) -> io::Result<()> {
        let res = self.do_request_report(code, out);
        self.errors.track("request_report", res)
    }

    fn run_test(
        &mut self,
        test_id: u8,
        _geometry: Geometry,
        min: &[i32],
        max: &[i32],
        out: &mut Vec<i32>,
    ) -> io::Result<bool> {
        let res = self.do_run_test(test_id);
        let values = self.errors.track("run_test", res)?;
        let pass = within_limits(&values, min, max);
        *out = values;
        Ok(pass)
    }

    fn error_messages(&self) -> String {
        self.errors.text()
    }

    fn clear_error_messages(&mut self) {
        self.errors.clear();
    }
}
