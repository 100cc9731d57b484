//! Program and console commands served over a live connection

#![cfg(unix)]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use common::{connect, exec_program, expect_reply, settings, start};
use procmux::core::packet::{Packet, ProgramEntry};
use procmux::protocol::ConnectionState;
use procmux::ErrorCode;
use serial_test::serial;
use uuid::Uuid;

fn error(code: ErrorCode) -> Packet {
    Packet::ErrorMessage { code }
}

#[tokio::test]
async fn test_unknown_program_reports_error_and_stays_connected() {
    let server = start(settings(Vec::new())).await;
    let mut client = connect(server.addr).await;

    client
        .send(&Packet::StartProgram {
            program: "unknown".into(),
        })
        .await
        .unwrap();

    assert_eq!(expect_reply(&mut client).await, error(ErrorCode::ProgramNotFound));
    assert_eq!(client.state(), ConnectionState::Connected);

    // The connection keeps serving requests afterwards
    client.send(&Packet::RequestConsoleList).await.unwrap();
    assert_eq!(
        expect_reply(&mut client).await,
        Packet::ResponseConsoleList {
            consoles: Vec::new()
        }
    );

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_program_list_is_sorted() {
    let server = start(settings(vec![
        exec_program("survival", "cat"),
        exec_program("Lobby", "cat"),
    ]))
    .await;
    let mut client = connect(server.addr).await;

    client.send(&Packet::RequestProgramList).await.unwrap();
    assert_eq!(
        expect_reply(&mut client).await,
        Packet::ResponseProgramList {
            programs: vec![
                ProgramEntry {
                    name: "lobby".into(),
                    loader: "exec".into(),
                },
                ProgramEntry {
                    name: "survival".into(),
                    loader: "exec".into(),
                },
            ]
        }
    );

    client.close().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn test_start_and_stop_program() {
    let server = start(settings(vec![exec_program("lobby", "cat")])).await;
    let mut client = connect(server.addr).await;

    client
        .send(&Packet::StartProgram {
            program: "LOBBY".into(),
        })
        .await
        .unwrap();
    let console_id = match expect_reply(&mut client).await {
        Packet::ProgramStatus {
            program,
            console_id,
            running: true,
        } => {
            assert_eq!(program, "lobby");
            console_id
        }
        other => panic!("unexpected {other:?}"),
    };

    client
        .send(&Packet::StartProgram {
            program: "lobby".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        expect_reply(&mut client).await,
        error(ErrorCode::ProgramAlreadyRunning)
    );

    client.send(&Packet::RequestConsoleList).await.unwrap();
    match expect_reply(&mut client).await {
        Packet::ResponseConsoleList { consoles } => {
            assert_eq!(consoles.len(), 1);
            assert_eq!(consoles[0].console_id, console_id);
            assert_eq!(consoles[0].program, "lobby");
            assert_eq!(consoles[0].loader, "exec");
            assert!(consoles[0].running);
        }
        other => panic!("unexpected {other:?}"),
    }

    client
        .send(&Packet::StopProgram {
            program: "lobby".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        expect_reply(&mut client).await,
        Packet::ProgramStatus {
            program: "lobby".into(),
            console_id,
            running: false,
        }
    );
    assert!(server.server.consoles().get(&console_id).unwrap().is_closed());

    client
        .send(&Packet::StopProgram {
            program: "lobby".into(),
        })
        .await
        .unwrap();
    assert_eq!(expect_reply(&mut client).await, error(ErrorCode::ConsoleNotFound));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_console_commands_require_attachment() {
    let server = start(settings(Vec::new())).await;
    let mut client = connect(server.addr).await;

    client
        .send(&Packet::QuitConsole {
            console_id: Uuid::new_v4(),
        })
        .await
        .unwrap();
    assert_eq!(
        expect_reply(&mut client).await,
        error(ErrorCode::SessionNotJoinedConsole)
    );

    client
        .send(&Packet::SendCommands {
            commands: vec!["stop".into()],
        })
        .await
        .unwrap();
    assert_eq!(
        expect_reply(&mut client).await,
        error(ErrorCode::SessionNotJoinedConsole)
    );

    client
        .send(&Packet::JoinConsole {
            console_id: Uuid::new_v4(),
        })
        .await
        .unwrap();
    assert_eq!(expect_reply(&mut client).await, error(ErrorCode::ConsoleNotFound));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn test_launch_failure_is_an_internal_error() {
    let server = start(settings(vec![exec_program(
        "broken",
        "procmux-missing-binary",
    )]))
    .await;
    let mut client = connect(server.addr).await;

    client
        .send(&Packet::StartProgram {
            program: "broken".into(),
        })
        .await
        .unwrap();
    assert_eq!(expect_reply(&mut client).await, error(ErrorCode::InternalError));
    assert!(server.server.consoles().is_empty());
    assert_eq!(client.state(), ConnectionState::Connected);

    client.close().await;
    server.stop().await;
}
