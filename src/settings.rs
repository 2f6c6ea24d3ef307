//! Optional TOML settings file.
//!
//! ```toml
//! [device]
//! node = "/dev/rmi0"
//! interface = "rmi"
//!
//! [session]
//! no_sleep = true
//! rezero = false
//! touch_enabled = false
//!
//! [production]
//! limits_file = "station3.limits"
//! enabled = ["noise", "full_raw"]
//!
//! [production.limits.noise]
//! min = 0
//! max = 30
//! ```
//!
//! Command line flags win over anything here.

use crate::error::{Result, TouchError};
use crate::native::InterfaceKind;
use crate::production::{TestKind, TestLimit, TestPlan};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub device: DeviceSettings,
    pub session: SessionSettings,
    pub production: ProductionSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSettings {
    pub node: Option<PathBuf>,
    pub interface: Option<InterfaceKind>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    pub no_sleep: bool,
    pub rezero: bool,
    pub touch_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProductionSettings {
    pub limits_file: Option<PathBuf>,
    /// Test keys to run; empty runs everything the controller supports.
    pub enabled: Vec<String>,
    pub limits: BTreeMap<String, RangeSetting>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeSetting {
    pub min: i32,
    pub max: i32,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| TouchError::Config(format!("{}: {}", path.display(), e)))?;
        let settings = Self::from_toml(&text)
            .map_err(|e| TouchError::Config(format!("{}: {}", path.display(), e)))?;
        log::debug!("settings loaded from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn enabled_kinds(&self) -> Result<Vec<TestKind>> {
        self.production
            .enabled
            .iter()
            .map(|key| {
                TestKind::from_key(key)
                    .ok_or_else(|| TouchError::Config(format!("unknown test {:?}", key)))
            })
            .collect()
    }

    /// Apply the enabled list and interactive limits. Tests this controller
    /// lacks and limits locked by a limits file are skipped with a warning.
    pub fn apply_to_plan(&self, plan: &mut TestPlan) -> Result<()> {
        let kinds = self.enabled_kinds()?;
        if !kinds.is_empty() {
            let available: Vec<TestKind> =
                kinds.iter().copied().filter(|k| plan.get(*k).is_some()).collect();
            if available.is_empty() {
                return Err(TouchError::Config(format!(
                    "none of the enabled tests {:?} exist on this controller",
                    self.production.enabled
                )));
            }
            plan.enable_only(&available)?;
        }

        for (key, range) in &self.production.limits {
            let kind = TestKind::from_key(key)
                .ok_or_else(|| TouchError::Config(format!("unknown test {:?}", key)))?;
            if plan.get(kind).is_none() {
                log::warn!("settings: {} does not apply to this controller", key);
                continue;
            }
            let limit = TestLimit::Range {
                min: range.min,
                max: range.max,
            };
            if let Err(e) = plan.set_limit(kind, limit) {
                log::warn!("settings: {}: {}", key, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[device]
node = "/dev/tcm0"
interface = "tcm"

[session]
no_sleep = true

[production]
enabled = ["noise", "full_raw", "sensor_speed"]

[production.limits.noise]
min = 0
max = 12
"#;

    #[test]
    fn full_file() {
        let s = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(s.device.interface, Some(InterfaceKind::Tcm));
        assert_eq!(s.device.node.as_deref(), Some(Path::new("/dev/tcm0")));
        assert!(s.session.no_sleep && !s.session.rezero);
        assert_eq!(s.production.limits["noise"], RangeSetting { min: 0, max: 12 });
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(Settings::from_toml("").unwrap(), Settings::default());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(Settings::from_toml("[session]\nsleepy = true\n").is_err());
    }

    #[test]
    fn enabled_list_with_nothing_available_is_rejected() {
        let s = Settings::from_toml("[production]\nenabled = [\"sensor_speed\"]\n").unwrap();
        let mut plan = TestPlan::new(InterfaceKind::Tcm, false);
        assert!(matches!(s.apply_to_plan(&mut plan), Err(TouchError::Config(_))));
        assert!(plan.items().iter().all(|i| i.enabled));
    }

    #[test]
    fn applies_to_plan() {
        let s = Settings::from_toml(SAMPLE).unwrap();
        let mut plan = TestPlan::new(InterfaceKind::Tcm, false);
        s.apply_to_plan(&mut plan).unwrap();
        let enabled: Vec<_> = plan.items().iter().filter(|i| i.enabled).map(|i| i.kind()).collect();
        assert_eq!(enabled, vec![TestKind::FullRaw, TestKind::Noise]);
        assert_eq!(
            plan.get(TestKind::Noise).unwrap().limit(),
            &TestLimit::Range { min: 0, max: 12 }
        );
    }
}
