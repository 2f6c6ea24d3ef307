use std::fs;
use tempfile::tempdir;
use touchtest::native::InterfaceKind;
use touchtest::production::limits::load_limits;
use touchtest::production::{TestKind, TestLimit, TestPlan};
use touchtest::settings::Settings;
use touchtest::TouchError;

const LIMITS: &str = "\
# station 3 panel limits
noise_max = 25
full_raw_min = 900
full_raw_max = 2500
";

#[test]
fn file_limits_lock_out_interactive_changes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("limits.txt");
    fs::write(&path, LIMITS).unwrap();

    let mut plan = TestPlan::new(InterfaceKind::Tcm, false);
    assert_eq!(load_limits(&mut plan, &path).unwrap(), 2);

    let err = plan
        .set_limit(TestKind::Noise, TestLimit::Range { min: 0, max: 99 })
        .unwrap_err();
    assert!(matches!(err, TouchError::InvalidState(_)));
    assert_eq!(
        plan.get(TestKind::Noise).unwrap().limit(),
        &TestLimit::Range { min: 0, max: 25 }
    );

    // items the file did not mention stay editable
    plan.set_limit(TestKind::DynamicRange, TestLimit::Range { min: 100, max: 1900 })
        .unwrap();

    plan.clear_config_limits();
    plan.set_limit(TestKind::Noise, TestLimit::Range { min: 0, max: 99 })
        .unwrap();
    assert_eq!(
        plan.get(TestKind::Noise).unwrap().limit(),
        &TestLimit::Range { min: 0, max: 99 }
    );
}

#[test]
fn settings_cannot_override_a_loaded_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("limits.txt");
    fs::write(&path, LIMITS).unwrap();

    let settings = Settings::from_toml(
        r#"
[production]
enabled = ["noise", "full_raw", "adc_range"]

[production.limits.noise]
min = 0
max = 80

[production.limits.dynamic_range]
min = 200
max = 1800
"#,
    )
    .unwrap();

    let mut plan = TestPlan::new(InterfaceKind::Tcm, false);
    load_limits(&mut plan, &path).unwrap();
    settings.apply_to_plan(&mut plan).unwrap();

    assert_eq!(
        plan.get(TestKind::Noise).unwrap().limit(),
        &TestLimit::Range { min: 0, max: 25 }
    );
    assert_eq!(
        plan.get(TestKind::DynamicRange).unwrap().limit(),
        &TestLimit::Range { min: 200, max: 1800 }
    );
    // adc_range is RMI only and is dropped from the enabled list
    let enabled: Vec<TestKind> = plan
        .items()
        .iter()
        .filter(|i| i.enabled)
        .map(|i| i.kind())
        .collect();
    assert_eq!(enabled, vec![TestKind::FullRaw, TestKind::Noise]);
}

#[test]
fn unreadable_or_malformed_file_leaves_defaults() {
    let dir = tempdir().unwrap();
    let mut plan = TestPlan::new(InterfaceKind::Rmi, false);

    let missing = dir.path().join("nope.txt");
    assert!(matches!(load_limits(&mut plan, &missing), Err(TouchError::Parse { .. })));

    let bad = dir.path().join("bad.txt");
    fs::write(&bad, "noise_max = 25\next_high_resistance = 0.4,0.5\n").unwrap();
    match load_limits(&mut plan, &bad) {
        Err(TouchError::Parse { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected a parse error, got {:?}", other),
    }
    assert!(plan.items().iter().all(|i| !i.from_config_file()));
    assert_eq!(
        plan.get(TestKind::Noise).unwrap().limit(),
        &TestLimit::Range { min: 0, max: 40 }
    );
}
