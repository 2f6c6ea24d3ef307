//! Delta/raw image streaming.

use crate::error::{Result, TouchError};
use crate::native::{Geometry, IdentifyInfo, InterfaceKind, StreamOptions};
use crate::protocol::{RMI_REPORT_DELTA, RMI_REPORT_RAW, TCM_REPORT_DELTA, TCM_REPORT_RAW};
use crate::session::DeviceSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportKind {
    Delta,
    Raw,
}

impl ReportKind {
    /// Report code the controller expects for this kind of image.
    pub fn code(self, interface: InterfaceKind) -> u8 {
        match (interface, self) {
            (InterfaceKind::Rmi, ReportKind::Delta) => RMI_REPORT_DELTA,
            (InterfaceKind::Rmi, ReportKind::Raw) => RMI_REPORT_RAW,
            (InterfaceKind::Tcm, ReportKind::Delta) => TCM_REPORT_DELTA,
            (InterfaceKind::Tcm, ReportKind::Raw) => TCM_REPORT_RAW,
        }
    }

    pub fn is_signed(self) -> bool {
        self == ReportKind::Delta
    }
}

/// Values per frame: the image, followed on hybrid controllers by one value
/// per row, per column, per button and per force electrode.
pub fn frame_len(info: &IdentifyInfo) -> usize {
    let cells = info.image_rows * info.image_cols;
    if info.has_hybrid {
        cells
            + info.image_rows
            + info.image_cols
            + info.button_count
            + info.force_electrode_count
    } else {
        cells
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFrame {
    pub index: u64,
    pub kind: ReportKind,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<i32>,
}

impl ReportFrame {
    pub fn image(&self) -> &[i32] {
        &self.data[..(self.rows * self.cols).min(self.data.len())]
    }

    /// Hybrid channels after the image, empty on plain controllers.
    pub fn extras(&self) -> &[i32] {
        &self.data[self.image().len()..]
    }

    pub fn get(&self, row: usize, col: usize) -> Option<i32> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get(row * self.cols + col).copied()
    }

    pub fn range(&self) -> Option<(i32, i32)> {
        let image = self.image();
        let lo = image.iter().copied().min()?;
        let hi = image.iter().copied().max()?;
        Some((lo, hi))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming(ReportKind),
}

/// Drives one report stream on a session. At most one stream is active;
/// the node stays open from `start` until `stop`.
#[derive(Debug)]
pub struct ReportStreamer {
    state: StreamState,
    frames: u64,
}

impl Default for ReportStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportStreamer {
    pub fn new() -> Self {
        Self {
            state: StreamState::Idle,
            frames: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn start(
        &mut self,
        session: &mut DeviceSession,
        kind: ReportKind,
        options: StreamOptions,
    ) -> Result<()> {
        if let StreamState::Streaming(active) = self.state {
            return Err(TouchError::InvalidState(format!(
                "{:?} stream already running",
                active
            )));
        }
        session.require_identified()?;
        let code = kind.code(session.kind());

        session.connect("start_report")?;
        let started = session
            .device("start_report")
            .and_then(|d| d.start_report(code, options).map_err(TouchError::io("start_report")));
        if let Err(e) = started {
            log::error!("{}: report 0x{:02X} not started: {}", session.describe(), code, e);
            let _ = session.disconnect("start_report");
            return Err(e);
        }

        log::info!(
            "{}: streaming {:?} (0x{:02X}) touch={} no_sleep={} rezero={}",
            session.describe(),
            kind,
            code,
            options.touch_enabled,
            options.no_sleep,
            options.rezero
        );
        self.state = StreamState::Streaming(kind);
        self.frames = 0;
        Ok(())
    }

    /// Fill `out` with the next frame. `out` is sized by the caller, see
    /// [`frame_len`].
    pub fn request_frame(
        &mut self,
        session: &mut DeviceSession,
        geometry: Geometry,
        out: &mut [i32],
    ) -> Result<()> {
        let StreamState::Streaming(kind) = self.state else {
            return Err(TouchError::InvalidState("no stream running".into()));
        };
        let code = kind.code(session.kind());
        session
            .device("request_report")?
            .request_report(code, geometry, out)
            .map_err(TouchError::io("request_report"))?;
        self.frames += 1;
        Ok(())
    }

    /// Allocate and fetch the next frame.
    pub fn next_frame(&mut self, session: &mut DeviceSession) -> Result<ReportFrame> {
        let StreamState::Streaming(kind) = self.state else {
            return Err(TouchError::InvalidState("no stream running".into()));
        };
        let info = session.require_identified()?;
        let geometry = info.geometry();
        let mut data = vec![0i32; frame_len(info)];
        let index = self.frames;
        self.request_frame(session, geometry, &mut data)?;
        Ok(ReportFrame {
            index,
            kind,
            rows: geometry.rows,
            cols: geometry.cols,
            data,
        })
    }

    /// Disable the report and close the node. Both steps always run; the
    /// first failure is returned.
    pub fn stop(&mut self, session: &mut DeviceSession) -> Result<()> {
        let StreamState::Streaming(kind) = self.state else {
            return Err(TouchError::InvalidState("no stream running".into()));
        };
        self.state = StreamState::Idle;
        let code = kind.code(session.kind());

        let disabled = session
            .device("stop_report")
            .and_then(|d| d.stop_report(code).map_err(TouchError::io("stop_report")));
        if let Err(e) = &disabled {
            log::warn!("{}: {}", session.describe(), e);
        }
        let closed = session.disconnect("stop_report");

        log::info!("{}: stream stopped after {} frames", session.describe(), self.frames);
        disabled?;
        closed
    }
}

/// Running per-cell extremes over a stream.
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub frames: u64,
    pub max: Vec<i32>,
    pub min: Vec<i32>,
}

impl FrameStats {
    pub fn update(&mut self, frame: &ReportFrame) {
        let image = frame.image();
        if self.max.len() != image.len() {
            self.max = image.to_vec();
            self.min = image.to_vec();
            self.frames = 0;
        } else {
            for ((hi, lo), &v) in self.max.iter_mut().zip(self.min.iter_mut()).zip(image) {
                *hi = (*hi).max(v);
                *lo = (*lo).min(v);
            }
        }
        self.frames += 1;
    }

    /// Largest peak-to-peak swing of any cell.
    pub fn peak_to_peak(&self) -> i32 {
        self.max
            .iter()
            .zip(&self.min)
            .map(|(hi, lo)| hi - lo)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{Call, FailPoint, MockController};

    fn identified(mock: MockController) -> DeviceSession {
        let mut s = DeviceSession::from_device("mock", Box::new(mock));
        s.identify().unwrap();
        s
    }

    #[test]
    fn codes_per_interface() {
        assert_eq!(ReportKind::Delta.code(InterfaceKind::Rmi), 0x02);
        assert_eq!(ReportKind::Raw.code(InterfaceKind::Rmi), 0x03);
        assert_eq!(ReportKind::Delta.code(InterfaceKind::Tcm), 0x12);
        assert_eq!(ReportKind::Raw.code(InterfaceKind::Tcm), 0x13);
    }

    #[test]
    fn hybrid_frames_carry_extras() {
        let info = IdentifyInfo {
            image_rows: 18,
            image_cols: 32,
            button_count: 2,
            force_electrode_count: 1,
            has_hybrid: true,
            ..IdentifyInfo::default()
        };
        assert_eq!(frame_len(&info), 18 * 32 + 18 + 32 + 2 + 1);
        let plain = IdentifyInfo {
            has_hybrid: false,
            ..info
        };
        assert_eq!(frame_len(&plain), 18 * 32);
    }

    #[test]
    fn start_requires_identify() {
        let mut s = DeviceSession::from_device("mock", Box::new(MockController::new(InterfaceKind::Rmi)));
        let mut streamer = ReportStreamer::new();
        assert!(matches!(
            streamer.start(&mut s, ReportKind::Delta, StreamOptions::default()),
            Err(TouchError::NotIdentified)
        ));
        assert!(!s.is_connected());
    }

    #[test]
    fn second_start_is_rejected() {
        let mock = MockController::new(InterfaceKind::Tcm);
        let probe = mock.probe();
        let mut s = identified(mock);
        let mut streamer = ReportStreamer::new();
        streamer.start(&mut s, ReportKind::Raw, StreamOptions::default()).unwrap();
        assert!(streamer.start(&mut s, ReportKind::Delta, StreamOptions::default()).is_err());
        assert_eq!(probe.count(|c| matches!(c, Call::StartReport(_))), 1);
        streamer.stop(&mut s).unwrap();
    }

    #[test]
    fn frames_match_geometry() {
        let mut s = identified(MockController::new(InterfaceKind::Tcm));
        let mut streamer = ReportStreamer::new();
        streamer.start(&mut s, ReportKind::Delta, StreamOptions::default()).unwrap();
        let a = streamer.next_frame(&mut s).unwrap();
        let b = streamer.next_frame(&mut s).unwrap();
        assert_eq!((a.rows, a.cols), (18, 32));
        assert_eq!(a.data.len(), 18 * 32 + 18 + 32 + 2);
        assert_eq!(a.extras().len(), 18 + 32 + 2);
        assert_eq!((a.index, b.index), (0, 1));
        assert_ne!(a.data, b.data);
        streamer.stop(&mut s).unwrap();
        assert_eq!(streamer.state(), StreamState::Idle);
    }

    #[test]
    fn failed_start_closes_node() {
        let mock = MockController::new(InterfaceKind::Rmi).fail(FailPoint::StartReport);
        let probe = mock.probe();
        let mut s = identified(mock);
        let mut streamer = ReportStreamer::new();
        assert!(streamer.start(&mut s, ReportKind::Delta, StreamOptions::default()).is_err());
        assert_eq!(probe.opens(), probe.closes());
        assert!(!s.is_connected());
        assert_eq!(streamer.state(), StreamState::Idle);
    }

    #[test]
    fn stop_closes_even_when_disable_fails() {
        let mock = MockController::new(InterfaceKind::Rmi).fail(FailPoint::StopReport);
        let probe = mock.probe();
        let mut s = identified(mock);
        let mut streamer = ReportStreamer::new();
        streamer.start(&mut s, ReportKind::Delta, StreamOptions::default()).unwrap();
        assert!(streamer.stop(&mut s).is_err());
        assert!(!s.is_connected());
        assert_eq!(probe.opens(), probe.closes());
    }

    #[test]
    fn stats_track_extremes() {
        let frame = |data: Vec<i32>| ReportFrame {
            index: 0,
            kind: ReportKind::Delta,
            rows: 1,
            cols: 3,
            data,
        };
        let mut stats = FrameStats::default();
        stats.update(&frame(vec![0, 5, -2]));
        stats.update(&frame(vec![3, 1, -4]));
        assert_eq!(stats.max, vec![3, 5, -2]);
        assert_eq!(stats.min, vec![0, 1, -4]);
        assert_eq!(stats.peak_to_peak(), 4);
        assert_eq!(stats.frames, 2);
    }
}
