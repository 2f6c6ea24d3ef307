//! Production test catalogue, per-item limits and the batch plan.

pub mod limits;
pub mod runner;

use crate::error::{Result, TouchError};
use crate::native::{HighResistanceLimit, InterfaceKind};
use crate::protocol::RMI_TRX_BITMAP_LEN;
use crate::session::DeviceSession;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKind {
    Noise,
    FullRaw,
    HighResistance,
    ExtendedHighResistance,
    TrxShort,
    ExtendedTrxShort,
    AdcRange,
    SensorSpeed,
    AbsRaw,
    TrxTrxShort,
    TrxSensorOpen,
    TrxGroundShort,
    DynamicRange,
}

const ALL_KINDS: [TestKind; 13] = [
    TestKind::Noise,
    TestKind::FullRaw,
    TestKind::HighResistance,
    TestKind::ExtendedHighResistance,
    TestKind::TrxShort,
    TestKind::ExtendedTrxShort,
    TestKind::AdcRange,
    TestKind::SensorSpeed,
    TestKind::AbsRaw,
    TestKind::TrxTrxShort,
    TestKind::TrxSensorOpen,
    TestKind::TrxGroundShort,
    TestKind::DynamicRange,
];

impl TestKind {
    /// Key used on the command line and in limits files.
    pub fn key(self) -> &'static str {
        match self {
            TestKind::Noise => "noise",
            TestKind::FullRaw => "full_raw",
            TestKind::HighResistance => "high_resistance",
            TestKind::ExtendedHighResistance => "ext_high_resistance",
            TestKind::TrxShort => "trx_short",
            TestKind::ExtendedTrxShort => "ext_trx_short",
            TestKind::AdcRange => "adc_range",
            TestKind::SensorSpeed => "sensor_speed",
            TestKind::AbsRaw => "abs_raw",
            TestKind::TrxTrxShort => "trx_trx_short",
            TestKind::TrxSensorOpen => "trx_sensor_open",
            TestKind::TrxGroundShort => "trx_ground_short",
            TestKind::DynamicRange => "dynamic_range",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TestKind::Noise => "Noise",
            TestKind::FullRaw => "Full Raw",
            TestKind::HighResistance => "High Resistance",
            TestKind::ExtendedHighResistance => "Extended High Resistance",
            TestKind::TrxShort => "TRx Short",
            TestKind::ExtendedTrxShort => "Extended TRx Short",
            TestKind::AdcRange => "ADC Range",
            TestKind::SensorSpeed => "Sensor Speed",
            TestKind::AbsRaw => "Abs Raw",
            TestKind::TrxTrxShort => "TRx-TRx Short",
            TestKind::TrxSensorOpen => "TRx Sensor Open",
            TestKind::TrxGroundShort => "TRx-Ground Short",
            TestKind::DynamicRange => "Dynamic Range",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        ALL_KINDS.iter().copied().find(|k| k.key() == key)
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the transport evaluates an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    /// Plain report compared against a min/max window.
    Limit,
    ExtendedHighResistance,
    ExtendedTrxShort,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestLimit {
    Range { min: i32, max: i32 },
    HighResistance(HighResistanceLimit),
    /// Expected value per TRx pin.
    PinMask(Vec<i32>),
}

impl TestLimit {
    fn same_shape(&self, other: &TestLimit) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for TestLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestLimit::Range { min, max } => write!(f, "{}..={}", min, max),
            TestLimit::HighResistance(l) => {
                write!(f, "tixel {} rx_roe {} tx_roe {}", l.tixel, l.rx_roe, l.tx_roe)
            }
            TestLimit::PinMask(pins) => {
                let text: Vec<String> = pins.iter().map(|p| p.to_string()).collect();
                f.write_str(&text.join(","))
            }
        }
    }
}

impl FromStr for TestLimit {
    type Err = String;

    /// Accepts `min,max`, `tixel,rx_roe,tx_roe` (fractions) or a pin list
    /// of 0/1 values longer than three entries.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        match parts.len() {
            2 => {
                let min = parts[0].parse().map_err(|_| format!("bad minimum {:?}", parts[0]))?;
                let max = parts[1].parse().map_err(|_| format!("bad maximum {:?}", parts[1]))?;
                Ok(TestLimit::Range { min, max })
            }
            3 => parse_high_resistance(&parts).map(TestLimit::HighResistance),
            _ => parse_pins(&parts).map(TestLimit::PinMask),
        }
    }
}

pub(crate) fn parse_high_resistance(parts: &[&str]) -> std::result::Result<HighResistanceLimit, String> {
    let [tixel, rx_roe, tx_roe] = parts else {
        return Err(format!("expected tixel, rx_roe, tx_roe, got {} values", parts.len()));
    };
    let num = |v: &str| v.parse::<f64>().map_err(|_| format!("bad fraction {:?}", v));
    Ok(HighResistanceLimit {
        tixel: num(*tixel)?,
        rx_roe: num(*rx_roe)?,
        tx_roe: num(*tx_roe)?,
    })
}

pub(crate) fn parse_pins(parts: &[&str]) -> std::result::Result<Vec<i32>, String> {
    parts
        .iter()
        .map(|p| match *p {
            "0" => Ok(0),
            "1" => Ok(1),
            other => Err(format!("pin value must be 0 or 1, got {:?}", other)),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    NotRun,
    Pass,
    Fail,
    /// Cancelled before it ran; counts as a failure.
    Terminated,
}

impl TestResult {
    pub fn is_pass(self) -> bool {
        self == TestResult::Pass
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestResult::NotRun => "NOT RUN",
            TestResult::Pass => "PASS",
            TestResult::Fail => "FAIL",
            TestResult::Terminated => "FAIL (terminated)",
        })
    }
}

struct TestSpec {
    kind: TestKind,
    id: u8,
    procedure: Procedure,
    limit: fn() -> TestLimit,
}

const fn spec(kind: TestKind, id: u8, procedure: Procedure, limit: fn() -> TestLimit) -> TestSpec {
    TestSpec {
        kind,
        id,
        procedure,
        limit,
    }
}

fn range(min: i32, max: i32) -> TestLimit {
    TestLimit::Range { min, max }
}

fn default_high_resistance() -> TestLimit {
    TestLimit::HighResistance(HighResistanceLimit {
        tixel: 0.40,
        rx_roe: 0.45,
        tx_roe: 0.45,
    })
}

fn default_pins() -> TestLimit {
    TestLimit::PinMask(vec![0; RMI_TRX_BITMAP_LEN * 8])
}

const RMI_TESTS: &[TestSpec] = &[
    spec(TestKind::Noise, 0x02, Procedure::Limit, || range(0, 40)),
    spec(TestKind::FullRaw, 0x14, Procedure::Limit, || range(600, 3200)),
    spec(TestKind::HighResistance, 0x04, Procedure::Limit, || range(-1000, 450)),
    spec(
        TestKind::ExtendedHighResistance,
        0x04,
        Procedure::ExtendedHighResistance,
        default_high_resistance,
    ),
    spec(TestKind::TrxShort, 0x1A, Procedure::Limit, || range(0, 0)),
    spec(TestKind::ExtendedTrxShort, 0x1A, Procedure::ExtendedTrxShort, default_pins),
    spec(TestKind::AdcRange, 0x17, Procedure::Limit, || range(1000, 3500)),
    spec(TestKind::SensorSpeed, 0x16, Procedure::Limit, || range(0, 2000)),
    spec(TestKind::AbsRaw, 0x26, Procedure::Limit, || range(0, 100_000)),
];

const RMI_TDDI_TESTS: &[TestSpec] = &[
    spec(TestKind::FullRaw, 0x5C, Procedure::Limit, || range(800, 2800)),
    spec(TestKind::Noise, 0x5E, Procedure::Limit, || range(0, 60)),
    spec(TestKind::ExtendedTrxShort, 0x1A, Procedure::ExtendedTrxShort, default_pins),
    spec(TestKind::AdcRange, 0x17, Procedure::Limit, || range(1000, 3500)),
];

const TCM_TESTS: &[TestSpec] = &[
    spec(TestKind::TrxTrxShort, 0x01, Procedure::Limit, || range(0, 0)),
    spec(TestKind::TrxSensorOpen, 0x02, Procedure::Limit, || range(0, 0)),
    spec(TestKind::TrxGroundShort, 0x03, Procedure::Limit, || range(0, 0)),
    spec(TestKind::FullRaw, 0x05, Procedure::Limit, || range(500, 3500)),
    spec(TestKind::DynamicRange, 0x07, Procedure::Limit, || range(300, 2000)),
    spec(TestKind::Noise, 0x0A, Procedure::Limit, || range(0, 40)),
    spec(TestKind::AbsRaw, 0x12, Procedure::Limit, || range(0, 100_000)),
];

const TCM_TDDI_TESTS: &[TestSpec] = &[
    spec(TestKind::FullRaw, 0x05, Procedure::Limit, || range(800, 2800)),
    spec(TestKind::Noise, 0x0A, Procedure::Limit, || range(0, 60)),
    spec(TestKind::TrxGroundShort, 0x03, Procedure::Limit, || range(0, 0)),
    spec(TestKind::AbsRaw, 0x12, Procedure::Limit, || range(0, 100_000)),
];

fn catalogue(interface: InterfaceKind, tddi: bool) -> &'static [TestSpec] {
    match (interface, tddi) {
        (InterfaceKind::Rmi, false) => RMI_TESTS,
        (InterfaceKind::Rmi, true) => RMI_TDDI_TESTS,
        (InterfaceKind::Tcm, false) => TCM_TESTS,
        (InterfaceKind::Tcm, true) => TCM_TDDI_TESTS,
    }
}

#[derive(Debug, Clone)]
pub struct TestItem {
    kind: TestKind,
    test_id: u8,
    procedure: Procedure,
    default_limit: TestLimit,
    limit: TestLimit,
    from_config_file: bool,
    pub enabled: bool,
    last_result: TestResult,
    values: Vec<i32>,
    message: String,
}

impl TestItem {
    fn from_spec(spec: &TestSpec) -> Self {
        let limit = (spec.limit)();
        Self {
            kind: spec.kind,
            test_id: spec.id,
            procedure: spec.procedure,
            default_limit: limit.clone(),
            limit,
            from_config_file: false,
            enabled: true,
            last_result: TestResult::NotRun,
            values: Vec::new(),
            message: String::new(),
        }
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn test_id(&self) -> u8 {
        self.test_id
    }

    pub fn procedure(&self) -> Procedure {
        self.procedure
    }

    pub fn limit(&self) -> &TestLimit {
        &self.limit
    }

    pub fn from_config_file(&self) -> bool {
        self.from_config_file
    }

    pub fn last_result(&self) -> TestResult {
        self.last_result
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Interactive limit change. Refused while a limits file owns the item.
    pub fn set_limit(&mut self, limit: TestLimit) -> Result<()> {
        if self.from_config_file {
            log::warn!("{}: limit comes from the limits file, ignoring {}", self.name(), limit);
            return Err(TouchError::InvalidState(format!(
                "{} limit is locked by the limits file",
                self.name()
            )));
        }
        self.check_shape(&limit)?;
        self.limit = limit;
        Ok(())
    }

    pub(crate) fn set_config_limit(&mut self, limit: TestLimit) -> Result<()> {
        self.check_shape(&limit)?;
        self.limit = limit;
        self.from_config_file = true;
        Ok(())
    }

    pub(crate) fn reset_limit(&mut self) {
        self.limit = self.default_limit.clone();
        self.from_config_file = false;
    }

    pub(crate) fn record(&mut self, result: TestResult, values: Vec<i32>, message: String) {
        self.last_result = result;
        self.values = values;
        self.message = message;
    }

    fn check_shape(&self, limit: &TestLimit) -> Result<()> {
        if self.default_limit.same_shape(limit) {
            Ok(())
        } else {
            Err(TouchError::Config(format!(
                "{} takes a limit like {}, not {}",
                self.name(),
                self.default_limit,
                limit
            )))
        }
    }
}

/// Ordered test items for one controller variant. Items run in
/// declaration order; only their `enabled` flag is caller-controlled.
#[derive(Debug, Clone)]
pub struct TestPlan {
    interface: InterfaceKind,
    tddi: bool,
    items: Vec<TestItem>,
}

impl TestPlan {
    pub fn new(interface: InterfaceKind, tddi: bool) -> Self {
        Self {
            interface,
            tddi,
            items: catalogue(interface, tddi).iter().map(TestItem::from_spec).collect(),
        }
    }

    pub fn for_session(session: &DeviceSession) -> Result<Self> {
        session.require_identified()?;
        Ok(Self::new(session.kind(), session.is_tddi()))
    }

    pub fn interface(&self) -> InterfaceKind {
        self.interface
    }

    pub fn is_tddi(&self) -> bool {
        self.tddi
    }

    pub fn items(&self) -> &[TestItem] {
        &self.items
    }

    pub fn get(&self, kind: TestKind) -> Option<&TestItem> {
        self.items.iter().find(|i| i.kind == kind)
    }

    pub fn get_mut(&mut self, kind: TestKind) -> Option<&mut TestItem> {
        self.items.iter_mut().find(|i| i.kind == kind)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut TestItem> {
        self.items.iter_mut()
    }

    pub fn set_enabled(&mut self, kind: TestKind, enabled: bool) -> Result<()> {
        let item = self.item_or_err(kind)?;
        item.enabled = enabled;
        Ok(())
    }

    /// Enable exactly `kinds`; kinds this variant does not have are an error.
    pub fn enable_only(&mut self, kinds: &[TestKind]) -> Result<()> {
        if let Some(missing) = kinds.iter().find(|k| self.get(**k).is_none()) {
            return Err(self.missing(*missing));
        }
        for item in &mut self.items {
            item.enabled = kinds.contains(&item.kind);
        }
        Ok(())
    }

    pub fn set_limit(&mut self, kind: TestKind, limit: TestLimit) -> Result<()> {
        self.item_or_err(kind)?.set_limit(limit)
    }

    /// Drop the limits-file lock; current values stay.
    pub fn clear_config_limits(&mut self) {
        for item in &mut self.items {
            item.from_config_file = false;
        }
    }

    pub fn reset_limits(&mut self) {
        for item in &mut self.items {
            item.reset_limit();
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.items.iter().filter(|i| i.enabled).count()
    }

    /// AND over the enabled items. A plan with nothing enabled never passes.
    pub fn aggregate(&self) -> bool {
        self.enabled_count() > 0
            && self
                .items
                .iter()
                .filter(|i| i.enabled)
                .all(|i| i.last_result.is_pass())
    }

    fn item_or_err(&mut self, kind: TestKind) -> Result<&mut TestItem> {
        let err = self.missing(kind);
        self.get_mut(kind).ok_or(err)
    }

    fn missing(&self, kind: TestKind) -> TouchError {
        TouchError::Config(format!(
            "{} is not available on {}{}",
            kind.name(),
            self.interface,
            if self.tddi { " TDDI" } else { "" }
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_tables() {
        let keys = |plan: &TestPlan| -> Vec<&'static str> { plan.items().iter().map(|i| i.kind().key()).collect() };
        assert_eq!(
            keys(&TestPlan::new(InterfaceKind::Rmi, true)),
            vec!["full_raw", "noise", "ext_trx_short", "adc_range"]
        );
        assert_eq!(
            keys(&TestPlan::new(InterfaceKind::Tcm, true)),
            vec!["full_raw", "noise", "trx_ground_short", "abs_raw"]
        );
        assert_eq!(TestPlan::new(InterfaceKind::Rmi, false).items().len(), 9);
        assert_eq!(TestPlan::new(InterfaceKind::Tcm, false).items().len(), 7);
    }

    #[test]
    fn ids_follow_variant() {
        let rmi = TestPlan::new(InterfaceKind::Rmi, false);
        let tddi = TestPlan::new(InterfaceKind::Rmi, true);
        assert_eq!(rmi.get(TestKind::FullRaw).unwrap().test_id(), 0x14);
        assert_eq!(tddi.get(TestKind::FullRaw).unwrap().test_id(), 0x5C);
        assert_eq!(tddi.get(TestKind::Noise).unwrap().test_id(), 0x5E);
    }

    #[test]
    fn config_lock_rejects_interactive_limits() {
        let mut plan = TestPlan::new(InterfaceKind::Rmi, false);
        plan.get_mut(TestKind::Noise)
            .unwrap()
            .set_config_limit(TestLimit::Range { min: 0, max: 25 })
            .unwrap();
        assert!(plan.set_limit(TestKind::Noise, TestLimit::Range { min: 0, max: 99 }).is_err());
        assert_eq!(
            plan.get(TestKind::Noise).unwrap().limit(),
            &TestLimit::Range { min: 0, max: 25 }
        );

        plan.clear_config_limits();
        plan.set_limit(TestKind::Noise, TestLimit::Range { min: 0, max: 99 }).unwrap();
    }

    #[test]
    fn limit_shape_must_match() {
        let mut plan = TestPlan::new(InterfaceKind::Rmi, false);
        let err = plan.set_limit(TestKind::Noise, "1,0,1,1,0".parse().unwrap());
        assert!(matches!(err, Err(TouchError::Config(_))));
        plan.set_limit(TestKind::ExtendedTrxShort, "1,0,1,1,0".parse().unwrap())
            .unwrap();
    }

    #[test]
    fn limit_text_forms() {
        assert_eq!("10, 20".parse::<TestLimit>().unwrap(), TestLimit::Range { min: 10, max: 20 });
        assert!(matches!(
            "0.4,0.5,0.6".parse::<TestLimit>().unwrap(),
            TestLimit::HighResistance(_)
        ));
        assert!("0,2,1,0".parse::<TestLimit>().is_err());
        assert!("x,1".parse::<TestLimit>().is_err());
    }

    #[test]
    fn enable_only_unknown_kind() {
        let mut plan = TestPlan::new(InterfaceKind::Tcm, true);
        assert!(plan.enable_only(&[TestKind::SensorSpeed]).is_err());
        plan.enable_only(&[TestKind::Noise]).unwrap();
        let enabled: Vec<_> = plan.items().iter().filter(|i| i.enabled).map(|i| i.kind()).collect();
        assert_eq!(enabled, vec![TestKind::Noise]);
    }

    #[test]
    fn aggregate_ignores_disabled_items() {
        let mut plan = TestPlan::new(InterfaceKind::Rmi, true);
        for item in plan.iter_mut() {
            item.record(TestResult::Pass, Vec::new(), String::new());
        }
        plan.get_mut(TestKind::AdcRange).unwrap().record(TestResult::Fail, Vec::new(), String::new());
        assert!(!plan.aggregate());
        plan.set_enabled(TestKind::AdcRange, false).unwrap();
        assert!(plan.aggregate());
    }

    #[test]
    fn empty_plan_does_not_pass() {
        let mut plan = TestPlan::new(InterfaceKind::Tcm, false);
        for item in plan.iter_mut() {
            item.record(TestResult::Pass, Vec::new(), String::new());
            item.enabled = false;
        }
        assert_eq!(plan.enabled_count(), 0);
        assert!(!plan.aggregate());
    }
}
