use super::chardev::CharNode;
use super::{
    ErrorLog, Geometry, HighResistanceLimit, IdentifyInfo, InterfaceKind, NativeDevice, RawIo,
    StreamOptions,
};
use crate::protocol::{
    bitmap_to_pins, decode_samples, within_limits, PdtEntry, F01_CTRL0_NO_SLEEP,
    F54_CMD_FORCE_CAL, F54_CMD_GET_REPORT, RMI_MAX_PAGES, RMI_PDT_END, RMI_PDT_ENTRY_SIZE,
    RMI_PDT_START, RMI_REPORT_ABS_RAW, RMI_REPORT_DELTA, RMI_REPORT_HIGH_RESISTANCE,
    RMI_REPORT_TDDI_NOISE, RMI_REPORT_TRX_SHORT, RMI_TRX_BITMAP_LEN,
};
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

const F01: u8 = 0x01;
const F1A: u8 = 0x1A;
const F34: u8 = 0x34;
const F54: u8 = 0x54;

const COMMAND_POLL_ATTEMPTS: usize = 500;
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(2);
const NOISE_FRAMES: usize = 20;

#[derive(Debug, Default, Clone, Copy)]
struct FunctionMap {
    f01: Option<PdtEntry>,
    f1a: Option<PdtEntry>,
    f34: Option<PdtEntry>,
    f54: Option<PdtEntry>,
}

/// RMI4 controller behind the kernel's `/dev/rmiN` register node.
pub struct RmiDevice {
    node: CharNode,
    map: Option<FunctionMap>,
    saved_int_enable: Option<u8>,
    errors: ErrorLog,
}

impl RmiDevice {
    pub fn new(path: &Path) -> Self {
        Self {
            node: CharNode::new(path),
            map: None,
            saved_int_enable: None,
            errors: ErrorLog::default(),
        }
    }

    /// Walk the Page Description Table on every page until a page comes
    /// back empty.
    fn scan_pdt(&mut self) -> io::Result<FunctionMap> {
        let mut map = FunctionMap::default();
        for page in 0..RMI_MAX_PAGES {
            let page_base = (page as u16) << 8;
            let mut addr = RMI_PDT_START;
            let mut found = false;
            while addr >= RMI_PDT_END {
                let mut raw = [0u8; 6];
                self.node.read_at(page_base | addr, &mut raw)?;
                let Some(entry) = PdtEntry::parse(page, &raw) else {
                    break;
                };
                found = true;
                log::debug!(
                    "rmi: F{:02X} on page {} query=0x{:04X} data=0x{:04X}",
                    entry.function,
                    page,
                    entry.query_base,
                    entry.data_base
                );
                match entry.function {
                    F01 => map.f01 = Some(entry),
                    F1A => map.f1a = Some(entry),
                    F34 => map.f34 = Some(entry),
                    F54 => map.f54 = Some(entry),
                    _ => {}
                }
                addr -= RMI_PDT_ENTRY_SIZE;
            }
            if !found {
                break;
            }
        }

        if map.f01.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "F01 not present in PDT"));
        }
        Ok(map)
    }

    fn function(&self, select: fn(&FunctionMap) -> Option<PdtEntry>, name: &str) -> io::Result<PdtEntry> {
        self.map.as_ref().and_then(select).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not present", name))
        })
    }

    fn f01(&self) -> io::Result<PdtEntry> {
        self.function(|m| m.f01, "F01")
    }

    fn f54(&self) -> io::Result<PdtEntry> {
        self.function(|m| m.f54, "F54")
    }

    fn read_byte(&mut self, addr: u16) -> io::Result<u8> {
        let mut b = [0u8];
        self.node.read_at(addr, &mut b)?;
        Ok(b[0])
    }

    fn wait_command_clear(&mut self, addr: u16, mask: u8) -> io::Result<()> {
        for _ in 0..COMMAND_POLL_ATTEMPTS {
            if self.read_byte(addr)? & mask == 0 {
                return Ok(());
            }
            thread::sleep(COMMAND_POLL_INTERVAL);
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("command bit 0x{:02X} at 0x{:04X} never cleared", mask, addr),
        ))
    }

    /// F54 diagnostic report: select type, trigger, wait, rewind index, read.
    fn get_report(&mut self, report_type: u8, len: usize) -> io::Result<Vec<u8>> {
        let f54 = self.f54()?;
        self.node.write_at(f54.data_base, &[report_type])?;
        self.node.write_at(f54.command_base, &[F54_CMD_GET_REPORT])?;
        self.wait_command_clear(f54.command_base, F54_CMD_GET_REPORT)?;
        self.node.write_at(f54.data_base + 1, &[0x00, 0x00])?;
        let mut buf = vec![0u8; len];
        self.node.read_at(f54.data_base + 3, &mut buf)?;
        Ok(buf)
    }

    fn report_samples(&mut self, report_type: u8, count: usize, signed: bool) -> io::Result<Vec<i32>> {
        let raw = self.get_report(report_type, count * 2)?;
        let mut values = vec![0i32; count];
        decode_samples(&raw, signed, &mut values)?;
        Ok(values)
    }

    fn set_no_sleep(&mut self, enable: bool) -> io::Result<()> {
        let ctrl = self.f01()?.control_base;
        let value = self.read_byte(ctrl)?;
        let value = if enable {
            value | F01_CTRL0_NO_SLEEP
        } else {
            value & !F01_CTRL0_NO_SLEEP
        };
        self.node.write_at(ctrl, &[value])?;
        Ok(())
    }

    fn rezero(&mut self) -> io::Result<()> {
        let cmd = self.f54()?.command_base;
        self.node.write_at(cmd, &[F54_CMD_FORCE_CAL])?;
        self.wait_command_clear(cmd, F54_CMD_FORCE_CAL)
    }

    fn do_identify(&mut self) -> io::Result<IdentifyInfo> {
        let map = self.scan_pdt()?;
        self.map = Some(map);

        let f01 = self.f01()?;
        let mut product = [0u8; 10];
        self.node.read_at(f01.query_base + 11, &mut product)?;
        let device_id = String::from_utf8_lossy(&product)
            .trim_end_matches('\0')
            .trim()
            .to_string();

        let mut build = [0u8; 3];
        self.node.read_at(f01.query_base + 18, &mut build)?;
        let firmware_id = u32::from_le_bytes([build[0], build[1], build[2], 0]);

        let config_id = match map.f34 {
            Some(f34) => {
                let mut id = [0u8; 4];
                self.node.read_at(f34.control_base, &mut id)?;
                id.iter().map(|b| format!("{:02X}", b)).collect()
            }
            None => String::new(),
        };

        let f54 = self.f54()?;
        let rx = self.read_byte(f54.query_base)? as usize;
        let tx = self.read_byte(f54.query_base + 1)? as usize;

        let button_count = match map.f1a {
            Some(f1a) => self.read_byte(f1a.query_base + 1)? as usize,
            None => 0,
        };

        Ok(IdentifyInfo {
            device_id,
            firmware_id,
            config_id,
            image_rows: tx,
            image_cols: rx,
            button_count,
            force_electrode_count: 0,
            has_hybrid: false,
        })
    }

    fn do_start_report(&mut self, code: u8, opts: StreamOptions) -> io::Result<()> {
        self.do_prepare(opts.no_sleep, opts.rezero)?;
        if !opts.touch_enabled {
            let int_enable = self.f01()?.control_base + 1;
            let saved = self.read_byte(int_enable)?;
            self.node.write_at(int_enable, &[0x00])?;
            self.saved_int_enable = Some(saved);
        }
        let f54 = self.f54()?;
        self.node.write_at(f54.data_base, &[code])?;
        Ok(())
    }

    fn do_stop_report(&mut self) -> io::Result<()> {
        let mut first_err = None;
        if let Some(saved) = self.saved_int_enable.take() {
            let res = self
                .f01()
                .and_then(|f01| self.node.write_at(f01.control_base + 1, &[saved]));
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.set_no_sleep(false) {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn do_prepare(&mut self, no_sleep: bool, rezero: bool) -> io::Result<()> {
        self.set_no_sleep(no_sleep)?;
        if rezero {
            self.rezero()?;
        }
        Ok(())
    }

    /// Peak-to-peak delta per cell over a burst of frames.
    fn noise(&mut self, geometry: Geometry) -> io::Result<Vec<i32>> {
        let cells = geometry.cells();
        let mut lo = vec![i32::MAX; cells];
        let mut hi = vec![i32::MIN; cells];
        for _ in 0..NOISE_FRAMES {
            let frame = self.report_samples(RMI_REPORT_DELTA, cells, true)?;
            for (i, v) in frame.into_iter().enumerate() {
                lo[i] = lo[i].min(v);
                hi[i] = hi[i].max(v);
            }
        }
        Ok(hi.iter().zip(&lo).map(|(h, l)| h - l).collect())
    }

    fn do_run_test(&mut self, test_id: u8, geometry: Geometry) -> io::Result<Vec<i32>> {
        let cells = geometry.cells();
        let edges = geometry.rows + geometry.cols;
        match test_id {
            RMI_REPORT_DELTA => self.noise(geometry),
            RMI_REPORT_HIGH_RESISTANCE => {
                self.report_samples(test_id, edges + cells, true)
            }
            RMI_REPORT_TRX_SHORT => {
                let raw = self.get_report(test_id, RMI_TRX_BITMAP_LEN)?;
                Ok(bitmap_to_pins(&raw, RMI_TRX_BITMAP_LEN * 8))
            }
            RMI_REPORT_ABS_RAW => {
                let raw = self.get_report(test_id, edges * 4)?;
                Ok(raw
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect())
            }
            RMI_REPORT_TDDI_NOISE => self.report_samples(test_id, cells, true),
            _ => self.report_samples(test_id, cells, false),
        }
    }
}

impl RawIo for RmiDevice {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.node.read_at(addr, buf);
        self.errors.track("read", res)
    }

    fn write(&mut self, addr: u16, data: &[u8], _resp: &mut [u8]) -> io::Result<usize> {
        let res = self.node.write_at(addr, data);
        self.errors.track("write", res)
    }
}

impl NativeDevice for RmiDevice {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Rmi
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

    fn stop_report(&mut self, _code: u8) -> io::Result<()> {
        let res = self.do_stop_report();
        self.errors.track("stop_report", res)
    }

    fn request_report(&mut self, code: u8, _geometry: Geometry, out: &mut [i32]) -> io::Result<()> {
        let res = self
            .get_report(code, out.len() * 2)
            .and_then(|raw| decode_samples(&raw, code == RMI_REPORT_DELTA, out));
        self.errors.track("request_report", res)
    }

    fn run_test(
        &mut self,
        test_id: u8,
        geometry: Geometry,
        min: &[i32],
        max: &[i32],
        out: &mut Vec<i32>,
    ) -> io::Result<bool> {
        let res = self.do_run_test(test_id, geometry);
        let values = self.errors.track("run_test", res)?;
        let pass = within_limits(&values, min, max);
        *out = values;
        Ok(pass)
    }

    fn run_extended_high_resistance(
        &mut self,
        geometry: Geometry,
        limit: HighResistanceLimit,
        out: &mut Vec<i32>,
    ) -> io::Result<bool> {
        let count = geometry.rows + geometry.cols + geometry.cells();
        let res = self.report_samples(RMI_REPORT_HIGH_RESISTANCE, count, true);
        let values = self.errors.track("run_extended_high_resistance", res)?;

        let milli = |f: f64| (f * 1000.0).round() as i32;
        let (rx, rest) = values.split_at(geometry.cols);
        let (tx, tixel) = rest.split_at(geometry.rows);
        let pass = rx.iter().all(|&v| v <= milli(limit.rx_roe))
            && tx.iter().all(|&v| v <= milli(limit.tx_roe))
            && tixel.iter().all(|&v| v <= milli(limit.tixel));
        *out = values;
        Ok(pass)
    }

    fn run_extended_trx_short(&mut self, expected: &[i32], out: &mut Vec<i32>) -> io::Result<bool> {
        let res = self.get_report(RMI_REPORT_TRX_SHORT, RMI_TRX_BITMAP_LEN);
        let raw = self.errors.track("run_extended_trx_short", res)?;
        let pins = bitmap_to_pins(&raw, expected.len());
        let pass = pins == expected;
        *out = pins;
        Ok(pass)
    }

    fn error_messages(&self) -> String {
        self.errors.text()
    }

    fn clear_error_messages(&mut self) {
        self.errors.clear();
    }
}
