mod common;

use common::{assert_paired, identified};
use touchtest::channel::{ChannelOp, ChannelResponse, RawCommandChannel};
use touchtest::native::mock::{Call, MockController};
use touchtest::native::InterfaceKind;
use touchtest::TouchError;

const GET_APPLICATION_INFO: u8 = 0x20;

fn send(mock: MockController, data: Vec<u8>) -> (touchtest::Result<ChannelResponse>, usize, usize) {
    let probe = mock.probe();
    let mut s = identified(mock);
    probe.clear();
    let res = s.with_connection("test", |s| {
        RawCommandChannel::new(s).execute(&ChannelOp::Write {
            target: u16::from(GET_APPLICATION_INFO),
            data,
        })
    });
    assert_paired(&probe);
    let writes = probe.count(|c| matches!(c, Call::Write { .. }));
    let reads = probe.count(|c| matches!(c, Call::Read { .. }));
    (res, writes, reads)
}

#[test]
fn payload_is_fetched_with_one_continued_read() {
    let payload: Vec<u8> = (1..=9).collect();
    let mock = MockController::new(InterfaceKind::Tcm)
        .tcm_response(GET_APPLICATION_INFO, payload.clone());
    let probe = mock.probe();
    let (res, writes, reads) = send(mock, vec![0x01]);

    let resp = res.unwrap();
    assert_eq!(resp.header, Some([0xA5, 0x01, 9, 0]));
    assert_eq!(resp.data, payload);
    assert_eq!((writes, reads), (1, 1));
    assert_eq!(probe.reads_of(payload.len() + 3), 1);
}

#[test]
fn header_only_response_needs_no_read() {
    let mock = MockController::new(InterfaceKind::Tcm);
    let (res, writes, reads) = send(mock, Vec::new());
    let resp = res.unwrap();
    assert!(resp.data.is_empty());
    assert_eq!(resp.to_string(), "[A5 01 00 00] ok");
    assert_eq!((writes, reads), (1, 0));
}

#[test]
fn failed_status_skips_the_payload() {
    let mock = MockController::new(InterfaceKind::Tcm)
        .tcm_status(0x0B)
        .tcm_response(GET_APPLICATION_INFO, vec![1, 2, 3, 4]);
    let (res, writes, reads) = send(mock, vec![0x01]);
    match res {
        Err(TouchError::CommandTimeout { command, status }) => {
            assert_eq!(command, GET_APPLICATION_INFO);
            assert_eq!(status, 0x0B);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!((writes, reads), (1, 0));
}
