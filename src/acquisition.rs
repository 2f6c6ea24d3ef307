//! Background frame acquisition.
//!
//! The session moves into the worker thread for the lifetime of the stream
//! and comes back through [`AcquisitionHandle::stop`].

use crate::error::{Result, TouchError};
use crate::native::StreamOptions;
use crate::report::{ReportFrame, ReportKind, ReportStreamer};
use crate::session::DeviceSession;
use crate::worker::{handoff, CancelToken, Consumer, HandoffMode, Producer};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy)]
pub struct AcquisitionConfig {
    pub kind: ReportKind,
    pub options: StreamOptions,
    pub handoff: HandoffMode,
    /// Stop on its own after this many frames.
    pub max_frames: Option<u64>,
}

impl AcquisitionConfig {
    pub fn new(kind: ReportKind) -> Self {
        Self {
            kind,
            options: StreamOptions::default(),
            handoff: HandoffMode::Synchronous,
            max_frames: None,
        }
    }
}

pub struct AcquisitionOutcome {
    pub session: DeviceSession,
    pub frames: u64,
    /// Set when the stream failed to start or a frame request failed.
    pub error: Option<TouchError>,
}

pub struct AcquisitionHandle {
    cancel: CancelToken,
    worker: JoinHandle<AcquisitionOutcome>,
}

impl AcquisitionHandle {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Request a stop and wait for the worker. In synchronous mode the
    /// frame consumer must be dropped (or still be draining) by now.
    pub fn stop(self) -> Result<AcquisitionOutcome> {
        self.cancel.cancel();
        self.worker
            .join()
            .map_err(|_| TouchError::InvalidState("acquisition worker panicked".into()))
    }
}

pub struct Acquisition {
    frames: Consumer<ReportFrame>,
    handle: AcquisitionHandle,
}

impl Acquisition {
    pub fn frames(&self) -> &Consumer<ReportFrame> {
        &self.frames
    }

    pub fn split(self) -> (Consumer<ReportFrame>, AcquisitionHandle) {
        (self.frames, self.handle)
    }

    pub fn stop(self) -> Result<AcquisitionOutcome> {
        let Acquisition { frames, handle } = self;
        drop(frames);
        handle.stop()
    }
}

pub fn spawn_acquisition(
    session: DeviceSession,
    config: AcquisitionConfig,
    cancel: CancelToken,
) -> Acquisition {
    let (producer, frames) = handoff(config.handoff);
    let token = cancel.clone();
    let worker = thread::spawn(move || run_acquisition(session, config, producer, token));
    Acquisition {
        frames,
        handle: AcquisitionHandle { cancel, worker },
    }
}

/// Worker body: start, fetch until cancelled or failed, stop.
pub fn run_acquisition(
    mut session: DeviceSession,
    config: AcquisitionConfig,
    producer: Producer<ReportFrame>,
    cancel: CancelToken,
) -> AcquisitionOutcome {
    let mut streamer = ReportStreamer::new();
    if let Err(e) = streamer.start(&mut session, config.kind, config.options) {
        return AcquisitionOutcome {
            session,
            frames: 0,
            error: Some(e),
        };
    }

    let mut frames = 0;
    let mut error = None;
    while !cancel.is_cancelled() && config.max_frames.map_or(true, |max| frames < max) {
        match streamer.next_frame(&mut session) {
            Ok(frame) => {
                frames += 1;
                if producer.deliver(frame).is_err() {
                    log::debug!("acquisition: frame consumer gone after {} frames", frames);
                    break;
                }
            }
            Err(e) => {
                log::error!("acquisition: frame {} failed: {}", frames, e);
                error = Some(e);
                break;
            }
        }
    }

    if let Err(e) = streamer.stop(&mut session) {
        error.get_or_insert(e);
    }
    AcquisitionOutcome {
        session,
        frames,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockController;
    use crate::native::InterfaceKind;

    fn identified(mock: MockController) -> DeviceSession {
        let mut s = DeviceSession::from_device("mock", Box::new(mock));
        s.identify().unwrap();
        s
    }

    #[test]
    fn bounded_run_delivers_every_frame() {
        let mock = MockController::new(InterfaceKind::Rmi);
        let probe = mock.probe();
        let config = AcquisitionConfig {
            max_frames: Some(5),
            ..AcquisitionConfig::new(ReportKind::Delta)
        };
        let acq = spawn_acquisition(identified(mock), config, CancelToken::new());
        let mut indices = Vec::new();
        while let Some(frame) = acq.frames().recv() {
            indices.push(frame.index);
        }
        let outcome = acq.stop().unwrap();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(outcome.frames, 5);
        assert!(outcome.error.is_none());
        assert!(!outcome.session.is_connected());
        assert_eq!(probe.opens(), probe.closes());
    }

    #[test]
    fn request_failure_ends_stream() {
        let mock = MockController::new(InterfaceKind::Tcm).fail_request_after(2);
        let acq = spawn_acquisition(
            identified(mock),
            AcquisitionConfig::new(ReportKind::Raw),
            CancelToken::new(),
        );
        let received = std::iter::from_fn(|| acq.frames().recv()).count();
        let outcome = acq.stop().unwrap();
        assert_eq!(received, 2);
        assert!(outcome.error.unwrap().is_io_failure());
        assert!(!outcome.session.is_connected());
    }

    #[test]
    fn unidentified_session_never_opens() {
        let mock = MockController::new(InterfaceKind::Rmi);
        let probe = mock.probe();
        let session = DeviceSession::from_device("mock", Box::new(mock));
        let acq = spawn_acquisition(
            session,
            AcquisitionConfig::new(ReportKind::Delta),
            CancelToken::new(),
        );
        let outcome = acq.stop().unwrap();
        assert!(matches!(outcome.error, Some(TouchError::NotIdentified)));
        assert_eq!(probe.opens(), 0);
    }
}
