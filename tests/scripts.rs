mod common;

use common::{assert_paired, identified};
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use touchtest::native::mock::MockController;
use touchtest::native::InterfaceKind;
use touchtest::script::{self, CommandOp, CommandScript, RawCommand};
use touchtest::TouchError;

fn rmi_script() -> CommandScript {
    let cmd = |op| RawCommand {
        interface: InterfaceKind::Rmi,
        op,
    };
    CommandScript {
        interface: InterfaceKind::Rmi,
        commands: vec![
            cmd(CommandOp::Write {
                target: 0x0050,
                data: vec![0x04],
            }),
            cmd(CommandOp::Wait { ms: 1 }),
            cmd(CommandOp::Read {
                register: Some(0x0050),
                len: 1,
            }),
            cmd(CommandOp::Write {
                target: 0x01A0,
                data: vec![0xDE, 0xAD],
            }),
            cmd(CommandOp::Read {
                register: Some(0x01A0),
                len: 2,
            }),
        ],
    }
}

#[test]
fn saved_script_parses_back_unchanged() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bringup.txt");
    let original = rmi_script();
    fs::write(&path, original.to_text()).unwrap();

    let parsed = script::parse_file(&path).unwrap();
    assert_eq!(parsed, original);
    assert_eq!(parsed.commands.len(), 5);
}

#[test]
fn hex_tokens_accept_both_spellings() {
    let a = script::parse_str("tcm\nwrite 0x1A 0x01\n", Path::new("a")).unwrap();
    let b = script::parse_str("tcm\nwrite 1A 01\n", Path::new("b")).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        a.commands[0].op,
        CommandOp::Write {
            target: 26,
            data: vec![1]
        }
    );
}

#[test]
fn one_bad_line_rejects_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.txt");
    fs::write(&path, "rmi\nread 0x10 2\nread 0x10\nwait 5\n").unwrap();
    match script::parse_file(&path) {
        Err(TouchError::Parse { line, .. }) => assert_eq!(line, 3),
        other => panic!("expected a parse error, got {:?}", other),
    }
}

#[test]
fn transcript_echoes_every_command_and_saves() {
    let mock = MockController::new(InterfaceKind::Rmi);
    let probe = mock.probe();
    let mut s = identified(mock);
    let transcript = script::run(&rmi_script(), &mut s).unwrap();

    let lines: Vec<&str> = transcript.lines().collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(lines[0], "> write 0x0050 0x04");
    assert_eq!(lines[5], "  04");
    assert_eq!(lines[9], "  DE AD");
    assert_paired(&probe);

    let dir = tempdir().unwrap();
    let out = dir.path().join("run.log");
    script::save_transcript(&out, &transcript).unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), transcript);
}

#[test]
fn tcm_script_on_rmi_device_is_refused() {
    let mock = MockController::new(InterfaceKind::Rmi);
    let probe = mock.probe();
    let mut s = identified(mock);
    probe.clear();
    let parsed = script::parse_str("tcm\nread 4\n", Path::new("t")).unwrap();
    assert!(matches!(script::run(&parsed, &mut s), Err(TouchError::InvalidState(_))));
    assert!(probe.calls().is_empty());
}
