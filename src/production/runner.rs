//! Batch execution of a [`TestPlan`].

use super::{Procedure, TestItem, TestKind, TestLimit, TestPlan, TestResult};
use crate::error::{Result, TouchError};
use crate::native::Geometry;
use crate::session::DeviceSession;
use crate::worker::{handoff, CancelToken, Consumer, HandoffMode};
use std::fmt::Write as _;
use std::io;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub no_sleep: bool,
    pub rezero: bool,
}

/// Outcome of one item as handed to the display side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub position: usize,
    pub kind: TestKind,
    pub test_id: u8,
    pub result: TestResult,
    pub message: String,
}

impl ItemReport {
    fn from_item(position: usize, item: &TestItem) -> Self {
        Self {
            position,
            kind: item.kind(),
            test_id: item.test_id(),
            result: item.last_result(),
            message: item.message().to_string(),
        }
    }

    pub fn line(&self) -> String {
        if self.message.is_empty() {
            format!("{}: {}", self.kind.name(), self.result)
        } else {
            format!("{}: {} ({})", self.kind.name(), self.result, self.message)
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
    pub passed: bool,
    pub transcript: String,
}

pub struct ProductionTestRunner {
    options: BatchOptions,
    cancel: CancelToken,
}

impl ProductionTestRunner {
    pub fn new(options: BatchOptions, cancel: CancelToken) -> Self {
        Self { options, cancel }
    }

    /// Open the node and prepare the controller. On failure the node is
    /// already closed again.
    pub fn begin(&self, session: &mut DeviceSession) -> Result<()> {
        session.require_identified()?;
        session.connect("begin")?;
        let prepared = session.device("prepare").and_then(|d| {
            d.prepare(self.options.no_sleep, self.options.rezero)
                .map_err(TouchError::io("prepare"))
        });
        if let Err(e) = prepared {
            log::error!("{}: production test setup failed: {}", session.describe(), e);
            let _ = session.disconnect("begin");
            return Err(e);
        }
        Ok(())
    }

    pub fn end(&self, session: &mut DeviceSession) -> Result<()> {
        session.disconnect("end")
    }

    /// Run every enabled item in plan order. `on_item` sees each outcome as
    /// soon as it is recorded.
    pub fn run(
        &self,
        session: &mut DeviceSession,
        plan: &mut TestPlan,
        mut on_item: impl FnMut(&ItemReport),
    ) -> Result<BatchReport> {
        let geometry = session.require_identified()?.geometry();
        if plan.enabled_count() == 0 {
            return Err(TouchError::Config("no production tests enabled".into()));
        }
        self.begin(session)?;
        session.clear_error_messages();

        let mut reports = Vec::new();
        for (position, item) in plan.iter_mut().enumerate().filter(|(_, i)| i.enabled) {
            if self.cancel.is_cancelled() {
                let message = TouchError::Cancelled.to_string();
                item.record(TestResult::Terminated, Vec::new(), message);
            } else {
                self.run_item(session, item, geometry);
            }
            let report = ItemReport::from_item(position, item);
            log::info!("production: {}", report.line());
            on_item(&report);
            reports.push(report);
        }

        if let Err(e) = self.end(session) {
            log::warn!("{}: {}", session.describe(), e);
        }

        let passed = plan.aggregate();
        let mut transcript = String::new();
        for r in &reports {
            let _ = writeln!(transcript, "{}", r.line());
        }
        let _ = writeln!(transcript, "Result: {}", if passed { "PASS" } else { "FAIL" });
        Ok(BatchReport {
            items: reports,
            passed,
            transcript,
        })
    }

    fn run_item(&self, session: &mut DeviceSession, item: &mut TestItem, geometry: Geometry) {
        let id = item.test_id();
        let mut values = Vec::new();
        let outcome = session.device("run_test").map_err(|e| e.to_string()).and_then(|device| {
            let res = match (item.procedure(), item.limit()) {
                (Procedure::Limit, TestLimit::Range { min, max }) => {
                    device.run_test(id, geometry, &[*min], &[*max], &mut values)
                }
                (Procedure::ExtendedHighResistance, TestLimit::HighResistance(limit)) => {
                    device.run_extended_high_resistance(geometry, *limit, &mut values)
                }
                (Procedure::ExtendedTrxShort, TestLimit::PinMask(pins)) => {
                    device.run_extended_trx_short(pins, &mut values)
                }
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "limit does not fit the test procedure",
                )),
            };
            res.map_err(|e| {
                let native = device.error_messages();
                device.clear_error_messages();
                if native.is_empty() {
                    e.to_string()
                } else {
                    format!("{}; {}", e, native.trim_end())
                }
            })
        });

        match outcome {
            Ok(pass) => {
                let message = summarize(&values);
                let result = if pass { TestResult::Pass } else { TestResult::Fail };
                item.record(result, values, message);
            }
            Err(message) => {
                log::error!("{}: {} (0x{:02X}) failed: {}", session.describe(), item.name(), id, message);
                item.record(TestResult::Fail, values, message);
            }
        }
    }
}

fn summarize(values: &[i32]) -> String {
    match (values.iter().min(), values.iter().max()) {
        (Some(lo), Some(hi)) => format!("{} values, min {} max {}", values.len(), lo, hi),
        _ => String::new(),
    }
}

pub struct ProductionOutcome {
    pub session: DeviceSession,
    pub plan: TestPlan,
    pub report: Result<BatchReport>,
}

/// Batch running on its own thread. Each item result waits for the
/// consumer to drop its ticket before the next item starts.
pub struct ProductionRun {
    results: Consumer<ItemReport>,
    cancel: CancelToken,
    worker: JoinHandle<ProductionOutcome>,
}

impl ProductionRun {
    pub fn results(&self) -> &Consumer<ItemReport> {
        &self.results
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Feed every item result to `on_item` until the batch ends, then join.
    /// The first error from `on_item` cancels the items still to run and
    /// replaces the batch report; the session comes back either way.
    pub fn drain(
        self,
        mut on_item: impl FnMut(&ItemReport) -> Result<()>,
    ) -> Result<ProductionOutcome> {
        let mut failure = None;
        while let Some(item) = self.results.recv() {
            if failure.is_some() {
                continue;
            }
            if let Err(e) = on_item(&item) {
                log::warn!("production: {}, cancelling the rest", e);
                self.cancel();
                failure = Some(e);
            }
        }
        let mut outcome = self.join()?;
        if let Some(e) = failure {
            outcome.report = Err(e);
        }
        Ok(outcome)
    }

    pub fn join(self) -> Result<ProductionOutcome> {
        let ProductionRun { results, worker, .. } = self;
        drop(results);
        worker
            .join()
            .map_err(|_| TouchError::InvalidState("production worker panicked".into()))
    }
}

pub fn spawn_production(
    mut session: DeviceSession,
    mut plan: TestPlan,
    options: BatchOptions,
    cancel: CancelToken,
) -> ProductionRun {
    let (producer, results) = handoff(HandoffMode::Synchronous);
    let runner = ProductionTestRunner::new(options, cancel.clone());
    let worker = thread::spawn(move || {
        let report = runner.run(&mut session, &mut plan, |item| {
            if producer.deliver(item.clone()).is_err() {
                log::debug!("production: result consumer gone");
            }
        });
        ProductionOutcome {
            session,
            plan,
            report,
        }
    });
    ProductionRun {
        results,
        cancel,
        worker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{Call, FailPoint, MockController};
    use crate::native::InterfaceKind;

    fn identified(mock: MockController) -> DeviceSession {
        let mut s = DeviceSession::from_device("mock", Box::new(mock));
        s.identify().unwrap();
        s
    }

    #[test]
    fn every_enabled_item_runs_once_in_order() {
        let mock = MockController::new(InterfaceKind::Tcm);
        let probe = mock.probe();
        let mut session = identified(mock);
        let mut plan = TestPlan::for_session(&session).unwrap();
        plan.set_enabled(TestKind::DynamicRange, false).unwrap();

        let runner = ProductionTestRunner::new(BatchOptions::default(), CancelToken::new());
        let report = runner.run(&mut session, &mut plan, |_| {}).unwrap();
        assert!(report.passed);
        assert_eq!(probe.tests_run(), vec![0x01, 0x02, 0x03, 0x05, 0x0A, 0x12]);
        assert_eq!(probe.opens(), probe.closes());
        assert_eq!(plan.get(TestKind::DynamicRange).unwrap().last_result(), TestResult::NotRun);
        assert!(report.transcript.ends_with("Result: PASS\n"));
    }

    #[test]
    fn native_verdict_is_recorded_as_is() {
        let mock = MockController::new(InterfaceKind::Rmi).verdict(0x14, false);
        let mut session = identified(mock);
        let mut plan = TestPlan::for_session(&session).unwrap();
        let runner = ProductionTestRunner::new(BatchOptions::default(), CancelToken::new());
        let report = runner.run(&mut session, &mut plan, |_| {}).unwrap();
        assert!(!report.passed);
        assert_eq!(plan.get(TestKind::FullRaw).unwrap().last_result(), TestResult::Fail);
        assert_eq!(plan.get(TestKind::Noise).unwrap().last_result(), TestResult::Pass);
    }

    #[test]
    fn item_failure_does_not_stop_batch() {
        let mock = MockController::new(InterfaceKind::Rmi).fail(FailPoint::RunTest(0x04));
        let probe = mock.probe();
        let mut session = identified(mock);
        let mut plan = TestPlan::for_session(&session).unwrap();
        let runner = ProductionTestRunner::new(BatchOptions::default(), CancelToken::new());
        runner.run(&mut session, &mut plan, |_| {}).unwrap();

        let hr = plan.get(TestKind::HighResistance).unwrap();
        assert_eq!(hr.last_result(), TestResult::Fail);
        assert!(hr.message().contains("simulated"));
        assert!(probe.tests_run().contains(&0x26));
        assert_eq!(probe.count(|c| *c == Call::ExtendedHighResistance), 1);
        assert_eq!(probe.count(|c| *c == Call::ExtendedTrxShort), 1);
    }

    #[test]
    fn failed_begin_closes_and_runs_nothing() {
        let mock = MockController::new(InterfaceKind::Tcm).fail(FailPoint::Prepare);
        let probe = mock.probe();
        let mut session = identified(mock);
        let mut plan = TestPlan::for_session(&session).unwrap();
        let runner = ProductionTestRunner::new(BatchOptions::default(), CancelToken::new());
        assert!(runner.run(&mut session, &mut plan, |_| {}).is_err());
        assert!(probe.tests_run().is_empty());
        assert_eq!(probe.opens(), probe.closes());
        assert!(!session.is_connected());
    }

    #[test]
    fn cancelled_before_start_terminates_all() {
        let mock = MockController::new(InterfaceKind::Tcm);
        let probe = mock.probe();
        let mut session = identified(mock);
        let mut plan = TestPlan::for_session(&session).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let runner = ProductionTestRunner::new(BatchOptions::default(), cancel);
        let report = runner.run(&mut session, &mut plan, |_| {}).unwrap();
        assert!(!report.passed);
        assert!(report.items.iter().all(|r| r.result == TestResult::Terminated));
        assert!(report.items[0].line().ends_with("(cancelled before it ran)"));
        assert!(probe.tests_run().is_empty());
    }

    #[test]
    fn consumer_error_cancels_and_still_returns_the_session() {
        let mock = MockController::new(InterfaceKind::Tcm);
        let probe = mock.probe();
        let session = identified(mock);
        let plan = TestPlan::for_session(&session).unwrap();
        let run = spawn_production(session, plan, BatchOptions::default(), CancelToken::new());

        let mut seen = 0;
        let outcome = run
            .drain(|item| {
                seen += 1;
                if item.position == 1 {
                    Err(TouchError::Config("disk full".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(seen, 2);
        assert!(matches!(outcome.report, Err(TouchError::Config(_))));
        assert_eq!(probe.tests_run(), vec![0x01, 0x02]);
        assert!(outcome
            .plan
            .items()
            .iter()
            .skip(2)
            .all(|i| i.last_result() == TestResult::Terminated));
        assert!(!outcome.session.is_connected());
        assert_eq!(probe.opens(), probe.closes());
    }

    #[test]
    fn nothing_enabled_is_refused_before_touching_the_device() {
        let mock = MockController::new(InterfaceKind::Tcm);
        let probe = mock.probe();
        let mut session = identified(mock);
        let mut plan = TestPlan::for_session(&session).unwrap();
        plan.enable_only(&[]).unwrap();
        probe.clear();

        let runner = ProductionTestRunner::new(BatchOptions::default(), CancelToken::new());
        let mut seen = 0;
        let res = runner.run(&mut session, &mut plan, |_| seen += 1);
        assert!(matches!(res, Err(TouchError::Config(_))));
        assert_eq!(seen, 0);
        assert!(probe.calls().is_empty());
    }
}
