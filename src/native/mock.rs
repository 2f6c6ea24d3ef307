//! In-process simulated controller.
//!
//! Backs `--mock` on the command line and the test suite. Every call is
//! appended to a shared [`CallLog`] that stays readable through a
//! [`MockProbe`] after the controller has been moved into a session.

use super::{
    ErrorLog, Geometry, HighResistanceLimit, IdentifyInfo, InterfaceKind, NativeDevice, RawIo,
    StreamOptions,
};
use crate::protocol::{frame_continued, tcm_header, within_limits, TCM_HEADER_LEN, TCM_STATUS_OK};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    Close,
    Identify,
    Read { addr: u16, len: usize },
    Write { addr: u16, data: Vec<u8> },
    Prepare { no_sleep: bool, rezero: bool },
    StartReport(u8),
    StopReport(u8),
    RequestReport(u8),
    RunTest(u8),
    ExtendedHighResistance,
    ExtendedTrxShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Open,
    Close,
    Identify,
    Prepare,
    StartReport,
    StopReport,
    Read,
    Write,
    RunTest(u8),
}

#[derive(Debug, Default)]
pub struct CallLog {
    pub calls: Vec<Call>,
}

/// Read-only view of a mock's call log.
#[derive(Debug, Clone)]
pub struct MockProbe(Arc<Mutex<CallLog>>);

impl MockProbe {
    fn lock(&self) -> MutexGuard<'_, CallLog> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn opens(&self) -> usize {
        self.count(|c| *c == Call::Open)
    }

    pub fn closes(&self) -> usize {
        self.count(|c| *c == Call::Close)
    }

    pub fn reads_of(&self, len: usize) -> usize {
        self.count(|c| matches!(c, Call::Read { len: l, .. } if *l == len))
    }

    pub fn tests_run(&self) -> Vec<u8> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::RunTest(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().calls.clear();
    }
}

pub struct MockController {
    kind: InterfaceKind,
    info: IdentifyInfo,
    open: bool,
    registers: HashMap<u16, u8>,
    tcm_status: u8,
    tcm_responses: HashMap<u8, Vec<u8>>,
    pending: VecDeque<u8>,
    failures: HashSet<FailPoint>,
    fail_request_after: Option<usize>,
    requests: usize,
    verdicts: HashMap<u8, bool>,
    extended_verdict: Option<bool>,
    log: Arc<Mutex<CallLog>>,
    errors: ErrorLog,
}

impl MockController {
    pub fn new(kind: InterfaceKind) -> Self {
        let info = match kind {
            InterfaceKind::Rmi => IdentifyInfo {
                device_id: "s3706".into(),
                firmware_id: 2_812_345,
                config_id: "0A1B2C3D".into(),
                image_rows: 16,
                image_cols: 28,
                button_count: 0,
                force_electrode_count: 0,
                has_hybrid: false,
            },
            InterfaceKind::Tcm => IdentifyInfo {
                device_id: "s3908".into(),
                firmware_id: 3_101_442,
                config_id: "00112233445566778899AABBCCDDEEFF".into(),
                image_rows: 18,
                image_cols: 32,
                button_count: 2,
                force_electrode_count: 0,
                has_hybrid: true,
            },
        };
        Self::with_info(kind, info)
    }

    /// Touch-and-display variant: device id carries the TDDI prefix.
    pub fn tddi(kind: InterfaceKind) -> Self {
        let mut mock = Self::new(kind);
        mock.info.device_id = match kind {
            InterfaceKind::Rmi => "td4310".into(),
            InterfaceKind::Tcm => "4322".into(),
        };
        mock.info.has_hybrid = false;
        mock.info.button_count = 0;
        mock
    }

    pub fn with_info(kind: InterfaceKind, info: IdentifyInfo) -> Self {
        Self {
            kind,
            info,
            open: false,
            registers: HashMap::new(),
            tcm_status: TCM_STATUS_OK,
            tcm_responses: HashMap::new(),
            pending: VecDeque::new(),
            failures: HashSet::new(),
            fail_request_after: None,
            requests: 0,
            verdicts: HashMap::new(),
            extended_verdict: None,
            log: Arc::new(Mutex::new(CallLog::default())),
            errors: ErrorLog::default(),
        }
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe(Arc::clone(&self.log))
    }

    pub fn fail(mut self, point: FailPoint) -> Self {
        self.failures.insert(point);
        self
    }

    /// Let `n` frame requests succeed, then fail every following one.
    pub fn fail_request_after(mut self, n: usize) -> Self {
        self.fail_request_after = Some(n);
        self
    }

    /// Status byte placed in every TouchComm response header.
    pub fn tcm_status(mut self, status: u8) -> Self {
        self.tcm_status = status;
        self
    }

    pub fn tcm_response(mut self, command: u8, payload: Vec<u8>) -> Self {
        self.tcm_responses.insert(command, payload);
        self
    }

    pub fn register(mut self, addr: u16, value: u8) -> Self {
        self.registers.insert(addr, value);
        self
    }

    pub fn verdict(mut self, test_id: u8, pass: bool) -> Self {
        self.verdicts.insert(test_id, pass);
        self
    }

    pub fn extended_verdict(mut self, pass: bool) -> Self {
        self.extended_verdict = Some(pass);
        self
    }

    fn record(&self, call: Call) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.calls.push(call);
    }

    fn check(&mut self, point: FailPoint, op: &str) -> io::Result<()> {
        if self.failures.contains(&point) {
            let err = io::Error::other(format!("simulated {} failure", op));
            self.errors.push(format!("{}: {}", op, err));
            return Err(err);
        }
        Ok(())
    }

    fn ensure_open(&mut self, op: &str) -> io::Result<()> {
        if !self.open {
            self.errors.push(format!("{}: node not open", op));
            return Err(io::Error::new(io::ErrorKind::NotConnected, "node not open"));
        }
        Ok(())
    }

    /// Deterministic moving pattern so consecutive frames differ.
    fn fill_frame(&self, code: u8, out: &mut [i32]) {
        let raw = matches!(code, 0x03 | 0x13);
        for (i, v) in out.iter_mut().enumerate() {
            let wave = ((i + self.requests) % 32) as i32 - 16;
            *v = if raw { 1000 + wave } else { wave };
        }
    }
}

impl RawIo for MockController {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> io::Result<usize> {
        self.record(Call::Read {
            addr,
            len: buf.len(),
        });
        self.ensure_open("read")?;
        self.check(FailPoint::Read, "read")?;
        match self.kind {
            InterfaceKind::Rmi => {
                for (i, b) in buf.iter_mut().enumerate() {
                    let reg = addr.wrapping_add(i as u16);
                    *b = self.registers.get(&reg).copied().unwrap_or(0);
                }
                Ok(buf.len())
            }
            InterfaceKind::Tcm => {
                let mut n = 0;
                for b in buf.iter_mut() {
                    match self.pending.pop_front() {
                        Some(v) => {
                            *b = v;
                            n += 1;
                        }
                        None => break,
                    }
                }
                Ok(n)
            }
        }
    }

    fn write(&mut self, addr: u16, data: &[u8], resp: &mut [u8]) -> io::Result<usize> {
        self.record(Call::Write {
            addr,
            data: data.to_vec(),
        });
        self.ensure_open("write")?;
        self.check(FailPoint::Write, "write")?;
        match self.kind {
            InterfaceKind::Rmi => {
                for (i, b) in data.iter().enumerate() {
                    self.registers.insert(addr.wrapping_add(i as u16), *b);
                }
                Ok(data.len())
            }
            InterfaceKind::Tcm => {
                let payload = self
                    .tcm_responses
                    .get(&(addr as u8))
                    .cloned()
                    .unwrap_or_default();
                let header = tcm_header(self.tcm_status, payload.len());
                let n = resp.len().min(TCM_HEADER_LEN);
                resp[..n].copy_from_slice(&header[..n]);
                self.pending.clear();
                if self.tcm_status == TCM_STATUS_OK && !payload.is_empty() {
                    self.pending.extend(frame_continued(&payload));
                }
                Ok(n)
            }
        }
    }
}

impl NativeDevice for MockController {
    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    fn open(&mut self) -> io::Result<()> {
        self.record(Call::Open);
        self.check(FailPoint::Open, "open")?;
        if self.open {
            self.errors.push("open: already open");
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already open"));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.record(Call::Close);
        self.ensure_open("close")?;
        self.open = false;
        self.pending.clear();
        self.check(FailPoint::Close, "close")
    }

    fn identify(&mut self) -> io::Result<IdentifyInfo> {
        self.record(Call::Identify);
        self.ensure_open("identify")?;
        self.check(FailPoint::Identify, "identify")?;
        Ok(self.info.clone())
    }

    fn prepare(&mut self, no_sleep: bool, rezero: bool) -> io::Result<()> {
        self.record(Call::Prepare { no_sleep, rezero });
        self.ensure_open("prepare")?;
        self.check(FailPoint::Prepare, "prepare")
    }

    fn start_report(&mut self, code: u8, opts: StreamOptions) -> io::Result<()> {
        self.record(Call::StartReport(code));
        self.ensure_open("start_report")?;
        self.check(FailPoint::StartReport, "start_report")?;
        log::debug!("mock: report 0x{:02X} enabled ({:?})", code, opts);
        Ok(())
    }

    fn stop_report(&mut self, code: u8) -> io::Result<()> {
        self.record(Call::StopReport(code));
        self.ensure_open("stop_report")?;
        self.check(FailPoint::StopReport, "stop_report")
    }

    fn request_report(&mut self, code: u8, _geometry: Geometry, out: &mut [i32]) -> io::Result<()> {
        self.record(Call::RequestReport(code));
        self.ensure_open("request_report")?;
        if let Some(limit) = self.fail_request_after {
            if self.requests >= limit {
                self.errors.push("request_report: simulated failure");
                return Err(io::Error::other("simulated request_report failure"));
            }
        }
        self.fill_frame(code, out);
        self.requests += 1;
        Ok(())
    }

    fn run_test(
        &mut self,
        test_id: u8,
        geometry: Geometry,
        min: &[i32],
        max: &[i32],
        out: &mut Vec<i32>,
    ) -> io::Result<bool> {
        self.record(Call::RunTest(test_id));
        self.ensure_open("run_test")?;
        self.check(FailPoint::RunTest(test_id), "run_test")?;

        // A healthy panel sits in the middle of its window.
        let value = match (min.first(), max.first()) {
            (Some(&lo), Some(&hi)) => ((i64::from(lo) + i64::from(hi)) / 2) as i32,
            (Some(lo), None) => *lo,
            (None, Some(hi)) => *hi,
            (None, None) => 0,
        };
        *out = vec![value; geometry.cells().max(1)];
        Ok(self
            .verdicts
            .get(&test_id)
            .copied()
            .unwrap_or_else(|| within_limits(out, min, max)))
    }

    fn run_extended_high_resistance(
        &mut self,
        geometry: Geometry,
        _limit: HighResistanceLimit,
        out: &mut Vec<i32>,
    ) -> io::Result<bool> {
        self.record(Call::ExtendedHighResistance);
        self.ensure_open("run_extended_high_resistance")?;
        if self.kind != InterfaceKind::Rmi {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "RMI only"));
        }
        *out = vec![0; geometry.rows + geometry.cols + geometry.cells()];
        Ok(self.extended_verdict.unwrap_or(true))
    }

    fn run_extended_trx_short(&mut self, expected: &[i32], out: &mut Vec<i32>) -> io::Result<bool> {
        self.record(Call::ExtendedTrxShort);
        self.ensure_open("run_extended_trx_short")?;
        if self.kind != InterfaceKind::Rmi {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "RMI only"));
        }
        *out = expected.to_vec();
        Ok(self.extended_verdict.unwrap_or(true))
    }

    fn error_messages(&self) -> String {
        self.errors.text()
    }

    fn clear_error_messages(&mut self) {
        self.errors.clear();
    }
}
