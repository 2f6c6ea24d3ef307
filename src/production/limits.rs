//! Test-limit file loader.
//!
//! ```text
//! # station 3 limits
//! noise_max = 35
//! full_raw_min = 700          # trailing comments are fine
//! full_raw_max = 3000
//! ext_high_resistance = 0.35, 0.40, 0.40
//! ext_trx_short = 0,0,0,1,0,0,0,0
//! ```
//!
//! A bad line rejects the whole file and leaves every item on its default
//! limit with the file lock cleared.

use super::{parse_high_resistance, parse_pins, Procedure, TestKind, TestLimit, TestPlan};
use crate::error::{Result, TouchError};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Load `path` into `plan`. Returns the number of items now locked by the
/// file.
pub fn load_limits(plan: &mut TestPlan, path: &Path) -> Result<usize> {
    let text = fs::read_to_string(path).map_err(|e| TouchError::parse(path, 0, e.to_string()))?;
    apply_limits(plan, path, &text)
}

pub fn apply_limits(plan: &mut TestPlan, path: &Path, text: &str) -> Result<usize> {
    match stage(plan, path, text) {
        Ok(staged) => {
            let mut applied = 0;
            for (kind, limit) in staged {
                if let Some(item) = plan.get_mut(kind) {
                    item.set_config_limit(limit)?;
                    applied += 1;
                }
            }
            log::info!("limits: {} items from {}", applied, path.display());
            Ok(applied)
        }
        Err(e) => {
            log::warn!("limits: {}; all limits back to defaults", e);
            plan.reset_limits();
            Err(e)
        }
    }
}

enum Bound {
    Min,
    Max,
}

fn stage(plan: &TestPlan, path: &Path, text: &str) -> Result<Vec<(TestKind, TestLimit)>> {
    // Insertion order keeps the log deterministic.
    let mut order: Vec<TestKind> = Vec::new();
    let mut staged: HashMap<TestKind, TestLimit> = HashMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let err = |msg: String| TouchError::parse(path, line_no, msg);

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| err(format!("expected `key = value`, got {:?}", line)))?;
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        let (kind, bound) = match split_key(&key) {
            Some(k) => k,
            None => {
                log::warn!("{}:{}: unknown key {:?}", path.display(), line_no, key);
                continue;
            }
        };
        let Some(item) = plan.get(kind) else {
            log::warn!(
                "{}:{}: {} does not apply to this controller",
                path.display(),
                line_no,
                key
            );
            continue;
        };

        let current = staged.get(&kind).unwrap_or(item.limit()).clone();
        let limit = match (item.procedure(), bound) {
            (Procedure::Limit, Some(bound)) => {
                let v: i32 = value
                    .parse()
                    .map_err(|_| err(format!("{}: {:?} is not an integer", key, value)))?;
                let TestLimit::Range { min, max } = current else {
                    return Err(err(format!("{} does not take a min/max", kind.key())));
                };
                match bound {
                    Bound::Min => TestLimit::Range { min: v, max },
                    Bound::Max => TestLimit::Range { min, max: v },
                }
            }
            (Procedure::ExtendedHighResistance, None) => {
                let parts: Vec<&str> = value.split(',').map(str::trim).collect();
                TestLimit::HighResistance(parse_high_resistance(&parts).map_err(err)?)
            }
            (Procedure::ExtendedTrxShort, None) => {
                let parts: Vec<&str> = value.split(',').map(str::trim).collect();
                TestLimit::PinMask(parse_pins(&parts).map_err(err)?)
            }
            _ => return Err(err(format!("{} is not a valid limit key", key))),
        };

        if !staged.contains_key(&kind) {
            order.push(kind);
        }
        staged.insert(kind, limit);
    }

    Ok(order
        .into_iter()
        .filter_map(|k| staged.remove(&k).map(|l| (k, l)))
        .collect())
}

fn split_key(key: &str) -> Option<(TestKind, Option<Bound>)> {
    if let Some(kind) = TestKind::from_key(key) {
        return Some((kind, None));
    }
    if let Some(prefix) = key.strip_suffix("_min") {
        return TestKind::from_key(prefix).map(|k| (k, Some(Bound::Min)));
    }
    if let Some(prefix) = key.strip_suffix("_max") {
        return TestKind::from_key(prefix).map(|k| (k, Some(Bound::Max)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::InterfaceKind;

    fn plan() -> TestPlan {
        TestPlan::new(InterfaceKind::Rmi, false)
    }

    #[test]
    fn ranges_and_specialised_limits() {
        let mut plan = plan();
        let text = "\
# comment line
noise_max = 30
full_raw_min = 700   # trailing
full_raw_max = 3000

ext_high_resistance = 0.35, 0.4, 0.4
ext_trx_short = 0,1,0
";
        let n = apply_limits(&mut plan, Path::new("limits.txt"), text).unwrap();
        assert_eq!(n, 4);
        assert_eq!(
            plan.get(TestKind::Noise).unwrap().limit(),
            &TestLimit::Range { min: 0, max: 30 }
        );
        assert_eq!(
            plan.get(TestKind::FullRaw).unwrap().limit(),
            &TestLimit::Range { min: 700, max: 3000 }
        );
        assert_eq!(
            plan.get(TestKind::ExtendedTrxShort).unwrap().limit(),
            &TestLimit::PinMask(vec![0, 1, 0])
        );
        assert!(plan.get(TestKind::Noise).unwrap().from_config_file());
        assert!(!plan.get(TestKind::AdcRange).unwrap().from_config_file());
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut plan = plan();
        let n = apply_limits(&mut plan, Path::new("l"), "frobnicate = 3\ndynamic_range_max = 9\n")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn malformed_line_resets_everything() {
        let mut plan = plan();
        apply_limits(&mut plan, Path::new("l"), "noise_max = 30\n").unwrap();

        let err = apply_limits(&mut plan, Path::new("l"), "adc_range_min = 5\nnoise_max thirty\n")
            .unwrap_err();
        assert!(matches!(err, TouchError::Parse { line: 2, .. }));
        for item in plan.items() {
            assert!(!item.from_config_file());
        }
        assert_eq!(
            plan.get(TestKind::Noise).unwrap().limit(),
            &TestLimit::Range { min: 0, max: 40 }
        );
        assert_eq!(
            plan.get(TestKind::AdcRange).unwrap().limit(),
            &TestLimit::Range { min: 1000, max: 3500 }
        );
    }

    #[test]
    fn shape_mismatch_is_a_parse_error() {
        let mut plan = plan();
        assert!(apply_limits(&mut plan, Path::new("l"), "ext_trx_short_min = 1\n").is_err());
        assert!(apply_limits(&mut plan, Path::new("l"), "noise = 1,2\n").is_err());
        assert!(apply_limits(&mut plan, Path::new("l"), "ext_high_resistance = 0.1, x, 0.2\n").is_err());
    }
}
