#![allow(dead_code)]

use touchtest::native::mock::{Call, MockController, MockProbe};
use touchtest::DeviceSession;

pub fn session(mock: MockController) -> DeviceSession {
    DeviceSession::from_device("mock", Box::new(mock))
}

pub fn identified(mock: MockController) -> DeviceSession {
    let mut s = session(mock);
    s.identify().expect("mock identify");
    s
}

/// Walk the call log: the node is open at most once, every device call
/// happens while it is open, and it ends closed.
pub fn assert_paired(probe: &MockProbe) {
    let mut depth = 0i32;
    for (i, call) in probe.calls().iter().enumerate() {
        match call {
            Call::Open => {
                depth += 1;
                assert!(depth <= 1, "call {}: second open while open", i);
            }
            Call::Close => {
                assert_eq!(depth, 1, "call {}: close while closed", i);
                depth -= 1;
            }
            other => assert_eq!(depth, 1, "call {}: {:?} while closed", i, other),
        }
    }
    assert_eq!(depth, 0, "node left open");
}
