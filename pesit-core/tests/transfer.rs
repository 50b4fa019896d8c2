//! End-to-end transfers over loopback TCP: a real server thread running the
//! session state machine, a real client session on the other end.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pesit_core::store::{LogTracker, MemoryStore, OpenPartnerDirectory};
use pesit_core::{
    ConnectBuilder, CreateBuilder, Diag, Fpdu, FpduReader, FpduType, MessageBuilder, Pi, PiValue,
    SelectBuilder, Session, SessionContext, SessionHandler, TcpTransportChannel, TransportChannel,
};

type TestHandler = SessionHandler<MemoryStore, OpenPartnerDirectory, LogTracker>;

fn spawn_server() -> (u16, Arc<TestHandler>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(SessionHandler::new(
        MemoryStore::new(),
        OpenPartnerDirectory,
        LogTracker,
    ));
    let server = handler.clone();
    let join = std::thread::spawn(move || {
        let (sock, addr) = listener.accept().unwrap();
        let mut chan = TcpTransportChannel::accepted(sock).unwrap();
        chan.set_receive_timeout(Duration::from_secs(5)).unwrap();
        let mut ctx = SessionContext::new(&addr.to_string(), "LOOP_SERVER");
        server.run_session(&mut ctx, &mut chan).unwrap();
    });
    (port, handler, join)
}

fn client_session(port: u16) -> Session {
    let channel = Box::new(TcpTransportChannel::new("127.0.0.1", port));
    Session::connect(channel)
        .unwrap()
        .ack_grace(Duration::from_millis(20))
}

fn diag_frame(kind: FpduType, id_dst: u8) -> Fpdu {
    Fpdu::new(kind)
        .with_id_dst(id_dst)
        .with_param(PiValue::new(
            Pi::Diagnostic,
            Diag::SUCCESS.to_bytes().to_vec(),
        ))
}

#[test]
fn complete_file_send() {
    let (port, handler, join) = spawn_server();
    let mut session = client_session(port);

    let aconnect = session
        .send_with_ack(
            &ConnectBuilder::new()
                .requester("LOOP")
                .server("LOOP_SERVER")
                .build(5),
        )
        .unwrap();
    assert_eq!(aconnect.kind(), FpduType::Aconnect);
    assert_eq!(aconnect.id_dst(), 5);
    let server_id = aconnect.id_src();

    let ack_create = session
        .send_with_ack(
            &CreateBuilder::new()
                .filename("LOOPFILE")
                .transfer_id(1)
                .variable_format()
                .record_length(30)
                .max_entity_size(56)
                .build(server_id)
                .unwrap(),
        )
        .unwrap();
    assert_eq!(ack_create.kind(), FpduType::AckCreate);
    assert_eq!(ack_create.diagnostic(), Some(Diag::SUCCESS));
    assert_eq!(ack_create.num(Pi::MaxEntitySize), Some(56));

    let ack_open = session
        .send_with_ack(&Fpdu::new(FpduType::Open).with_id_dst(server_id))
        .unwrap();
    assert_eq!(ack_open.kind(), FpduType::AckOpen);

    let ack_write = session
        .send_with_ack(&Fpdu::new(FpduType::Write).with_id_dst(server_id))
        .unwrap();
    assert_eq!(ack_write.kind(), FpduType::AckWrite);
    assert_eq!(ack_write.num(Pi::RestartPoint), Some(0));

    session
        .send_data(FpduType::Dtf, server_id, b"Hello! This is test data")
        .unwrap();

    let ack_syn = session
        .send_with_ack(
            &Fpdu::new(FpduType::Syn)
                .with_id_dst(server_id)
                .with_param(PiValue::num(Pi::SyncNumber, 1)),
        )
        .unwrap();
    assert_eq!(ack_syn.kind(), FpduType::AckSyn);
    assert_eq!(ack_syn.num(Pi::SyncNumber), Some(1));

    session
        .send_data(FpduType::Dtf, server_id, b" from the protocol engine.")
        .unwrap();

    session
        .send(&diag_frame(FpduType::DtfEnd, server_id))
        .unwrap();

    let ack_end = session
        .send_with_ack(&Fpdu::new(FpduType::TransEnd).with_id_dst(server_id))
        .unwrap();
    assert_eq!(ack_end.kind(), FpduType::AckTransEnd);
    assert_eq!(ack_end.num(Pi::ByteCount), Some(50));

    assert_eq!(
        session
            .send_with_ack(&diag_frame(FpduType::Close, server_id))
            .unwrap()
            .kind(),
        FpduType::AckClose
    );
    assert_eq!(
        session
            .send_with_ack(&diag_frame(FpduType::Deselect, server_id))
            .unwrap()
            .kind(),
        FpduType::AckDeselect
    );

    let relconf = session
        .send_with_ack(&diag_frame(FpduType::Release, server_id).with_id_src(5))
        .unwrap();
    assert_eq!(relconf.kind(), FpduType::Relconf);
    assert_eq!(relconf.id_dst(), 5);

    session.close().unwrap();
    join.join().unwrap();

    assert_eq!(
        handler.store().get("LOOPFILE").unwrap(),
        b"Hello! This is test data from the protocol engine."
    );
}

#[test]
fn complete_file_receive() {
    let (port, handler, join) = spawn_server();
    handler
        .store()
        .insert("PULLFILE", b"content served in bounded chunks".to_vec());
    let mut session = client_session(port);

    let aconnect = session
        .send_with_ack(
            &ConnectBuilder::new()
                .requester("LOOP")
                .server("LOOP_SERVER")
                .build(7),
        )
        .unwrap();
    let server_id = aconnect.id_src();

    let ack_select = session
        .send_with_ack(
            &SelectBuilder::new()
                .filename("PULLFILE")
                .transfer_id(2)
                .max_entity_size(20)
                .build(server_id)
                .unwrap(),
        )
        .unwrap();
    assert_eq!(ack_select.kind(), FpduType::AckSelect);
    assert_eq!(ack_select.text(Pi::Filename).as_deref(), Some("PULLFILE"));

    session
        .send_with_ack(&Fpdu::new(FpduType::Open).with_id_dst(server_id))
        .unwrap();

    let ack_read = session
        .send_with_ack(
            &Fpdu::new(FpduType::Read)
                .with_id_dst(server_id)
                .with_param(PiValue::num(Pi::RestartPoint, 0)),
        )
        .unwrap();
    assert_eq!(ack_read.kind(), FpduType::AckRead);

    let mut received = Vec::new();
    let mut reader = FpduReader::new(&mut session);
    loop {
        let fpdu = reader.read().unwrap();
        match fpdu.kind() {
            FpduType::Dtf => {
                // Entity size 20 bounds every chunk to 14 data bytes.
                assert!(fpdu.data().len() <= 14);
                received.extend_from_slice(fpdu.data());
            }
            FpduType::DtfEnd => {
                assert_eq!(fpdu.diagnostic(), Some(Diag::SUCCESS));
                break;
            }
            other => panic!("unexpected frame during data phase: {other:?}"),
        }
    }
    assert_eq!(received, b"content served in bounded chunks");

    let ack_end = session
        .send_with_ack(&Fpdu::new(FpduType::TransEnd).with_id_dst(server_id))
        .unwrap();
    assert_eq!(ack_end.num(Pi::ByteCount), Some(received.len() as u64));

    session
        .send_with_ack(&diag_frame(FpduType::Close, server_id))
        .unwrap();
    session
        .send_with_ack(&diag_frame(FpduType::Deselect, server_id))
        .unwrap();
    session
        .send_with_ack(&diag_frame(FpduType::Release, server_id).with_id_src(7))
        .unwrap();

    session.close().unwrap();
    join.join().unwrap();
}

#[test]
fn message_exchange() {
    let (port, _handler, join) = spawn_server();
    let mut session = client_session(port);

    let aconnect = session
        .send_with_ack(
            &ConnectBuilder::new()
                .requester("LOOP")
                .server("LOOP_SERVER")
                .build(3),
        )
        .unwrap();
    let server_id = aconnect.id_src();

    let ack = session
        .send_with_ack(
            &MessageBuilder::new()
                .filename("NOTICE")
                .build(FpduType::Msg, server_id, b"operator notice")
                .unwrap(),
        )
        .unwrap();
    assert_eq!(ack.kind(), FpduType::AckMsg);
    assert_eq!(ack.diagnostic(), Some(Diag::SUCCESS));

    session
        .send_with_ack(&diag_frame(FpduType::Release, server_id).with_id_src(3))
        .unwrap();
    session.close().unwrap();
    join.join().unwrap();
}

#[test]
fn segmented_message_exchange() {
    let (port, _handler, join) = spawn_server();
    let mut session = client_session(port);

    let aconnect = session
        .send_with_ack(
            &ConnectBuilder::new()
                .requester("LOOP")
                .server("LOOP_SERVER")
                .build(4),
        )
        .unwrap();
    let server_id = aconnect.id_src();

    // MSGDM and MSGMM get no acknowledgment; only MSGFM does.
    session
        .send(
            &MessageBuilder::new()
                .filename("LONGNOTE")
                .build(FpduType::Msgdm, server_id, b"first ")
                .unwrap(),
        )
        .unwrap();
    session
        .send(&MessageBuilder::segment(FpduType::Msgmm, server_id, b"second "))
        .unwrap();
    let ack = session
        .send_with_ack(&MessageBuilder::segment(FpduType::Msgfm, server_id, b"last"))
        .unwrap();
    assert_eq!(ack.kind(), FpduType::AckMsg);

    session
        .send_with_ack(&diag_frame(FpduType::Release, server_id).with_id_src(4))
        .unwrap();
    session.close().unwrap();
    join.join().unwrap();
}

#[test]
fn unknown_state_frame_is_aborted() {
    let (port, _handler, join) = spawn_server();
    let mut session = client_session(port);

    // WRITE before CONNECT is a sequence error.
    let err = session
        .send_with_ack(&Fpdu::new(FpduType::Write).with_id_dst(1))
        .unwrap_err();
    match err {
        pesit_core::SessionError::Rejected { diag, .. } => {
            assert_eq!(diag, Diag::PROTOCOL_ERROR);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    session.close().unwrap();
    join.join().unwrap();
}
