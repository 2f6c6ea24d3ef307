//! Transport boundary to the touch controller.
//!
//! [`RawIo`] is the byte level (register or packet) access, [`NativeDevice`]
//! adds the controller-level calls the session layer drives. Implementations
//! report failures as `io::Error` and never retry.

#[cfg(target_os = "linux")]
pub mod chardev;
pub mod mock;
#[cfg(target_os = "linux")]
pub mod rmi;
#[cfg(target_os = "linux")]
pub mod tcm;

use serde::Deserialize;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Rmi,
    Tcm,
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceKind::Rmi => write!(f, "RMI"),
            InterfaceKind::Tcm => write!(f, "TCM"),
        }
    }
}

/// Cached result of a successful identify.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub device_id: String,
    pub firmware_id: u32,
    pub config_id: String,
    pub image_rows: usize,
    pub image_cols: usize,
    pub button_count: usize,
    pub force_electrode_count: usize,
    pub has_hybrid: bool,
}

impl IdentifyInfo {
    pub fn geometry(&self) -> Geometry {
        Geometry {
            rows: self.image_rows,
            cols: self.image_cols,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub rows: usize,
    pub cols: usize,
}

impl Geometry {
    pub fn cells(&self) -> usize {
        self.rows * self.cols
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub touch_enabled: bool,
    pub no_sleep: bool,
    pub rezero: bool,
}

/// Limits for the extended high-resistance procedure, as fractions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighResistanceLimit {
    pub tixel: f64,
    pub rx_roe: f64,
    pub tx_roe: f64,
}

pub trait RawIo {
    /// RMI: fill `buf` from register `addr`. TCM: `addr` is ignored and the
    /// next `buf.len()` bytes of the response stream are read.
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> io::Result<usize>;

    /// RMI: write `data` at register `addr`, `resp` is untouched.
    /// TCM: send command `addr` with `data` as payload and read the fixed
    /// response header into `resp`.
    fn write(&mut self, addr: u16, data: &[u8], resp: &mut [u8]) -> io::Result<usize>;
}

pub trait NativeDevice: RawIo + Send {
    fn kind(&self) -> InterfaceKind;
    fn open(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
    fn identify(&mut self) -> io::Result<IdentifyInfo>;

    /// Apply no-sleep / rezero before a stream or a test batch.
    fn prepare(&mut self, no_sleep: bool, rezero: bool) -> io::Result<()>;

    fn start_report(&mut self, code: u8, opts: StreamOptions) -> io::Result<()>;
    fn stop_report(&mut self, code: u8) -> io::Result<()>;

    /// Fill `out` with one frame. `out.len()` may exceed `geometry.cells()`
    /// when the controller appends hybrid channels.
    fn request_report(&mut self, code: u8, geometry: Geometry, out: &mut [i32]) -> io::Result<()>;

    /// Run one limit-based production test. `min`/`max` hold either one
    /// value or one value per cell; the returned flag is the verdict.
    fn run_test(
        &mut self,
        test_id: u8,
        geometry: Geometry,
        min: &[i32],
        max: &[i32],
        out: &mut Vec<i32>,
    ) -> io::Result<bool>;

    /// Results are in thousandths: `rx_roe[cols] ++ tx_roe[rows] ++ tixel[rows*cols]`.
    fn run_extended_high_resistance(
        &mut self,
        _geometry: Geometry,
        _limit: HighResistanceLimit,
        _out: &mut Vec<i32>,
    ) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extended high resistance not supported by this interface",
        ))
    }

    /// One value per pin, compared against `expected`.
    fn run_extended_trx_short(&mut self, _expected: &[i32], _out: &mut Vec<i32>) -> io::Result<bool> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extended TRx short not supported by this interface",
        ))
    }

    fn error_messages(&self) -> String;
    fn clear_error_messages(&mut self);
}

/// Messages collected by a transport, drained by `get_error_messages`.
#[derive(Debug, Default)]
pub struct ErrorLog {
    lines: Vec<String>,
}

impl ErrorLog {
    pub fn push(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        log::debug!("native: {}", msg);
        self.lines.push(msg);
    }

    /// Record the error of a failed call and pass the result through.
    pub fn track<T>(&mut self, op: &str, res: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &res {
            self.push(format!("{}: {}", op, e));
        }
        res
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
