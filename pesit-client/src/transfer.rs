//! Client transfer flows: full send/receive/message walks over one session,
//! with bounded retries. The engine reports the last acknowledged sync point;
//! the retry loop here decides to reconnect and resume from it.

use std::time::{Duration, Instant};

use pesit_core::session::ACK_GRACE;
use pesit_core::transport::client_tls_config;
use pesit_core::writer::split_articles;
use pesit_core::{
    ChunkWriter, ConnectBuilder, CreateBuilder, Diag, Fpdu, FpduReader, FpduType, MessageBuilder,
    Pi, PiValue, SelectBuilder, Session, SessionError, TcpTransportChannel, TlsTransportChannel,
    TransportChannel,
};
use tracing::{info, warn};

use crate::config::ClientConfig;

/// Connection id this side announces in CONNECT.
const CONNECTION_ID: u8 = 1;

/// Outcome of a completed command.
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub bytes: u64,
    pub duration: Duration,
}

/// Send-side resume state, updated as SYN acknowledgments arrive.
#[derive(Debug, Default, Clone, Copy)]
struct SendProgress {
    sync_point: u32,
    offset: u64,
}

pub struct Client {
    cfg: ClientConfig,
    ack_grace: Duration,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Self {
        Client {
            cfg,
            ack_grace: ACK_GRACE,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    #[cfg(test)]
    fn ack_grace(mut self, grace: Duration) -> Self {
        self.ack_grace = grace;
        self
    }

    /// Send a file's bytes under the given virtual filename, resuming from
    /// the last acknowledged sync point on a resumable failure.
    pub fn send_file(
        &self,
        data: &[u8],
        filename: &str,
        transfer_id: u64,
    ) -> Result<Report, SessionError> {
        let started = Instant::now();
        let mut progress = SendProgress::default();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_send(data, filename, transfer_id, &mut progress) {
                Ok(bytes) => {
                    return Ok(Report {
                        bytes,
                        duration: started.elapsed(),
                    })
                }
                Err(err) => {
                    if attempt > self.cfg.retries || !retryable(&err) {
                        return Err(err);
                    }
                    if let SessionError::Restart {
                        sync_point,
                        restart_point,
                        ..
                    } = &err
                    {
                        progress.sync_point = *sync_point;
                        progress.offset = *restart_point;
                    }
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = self.cfg.retry_delay_ms,
                        "transfer failed, retrying"
                    );
                    std::thread::sleep(Duration::from_millis(self.cfg.retry_delay_ms));
                }
            }
        }
    }

    fn try_send(
        &self,
        data: &[u8],
        filename: &str,
        transfer_id: u64,
        progress: &mut SendProgress,
    ) -> Result<u64, SessionError> {
        let mut session = self.open_session()?;
        let server_id = self.establish(&mut session)?;

        let create = CreateBuilder::new()
            .filename(filename)
            .transfer_id(transfer_id)
            .restart(progress.sync_point > 0)
            .max_entity_size(self.cfg.max_entity_size as u64)
            .max_reservation(data.len().div_ceil(1024) as u64)
            .build(server_id)?;
        session.send_with_ack(&create)?;
        session.send_with_ack(&Fpdu::new(FpduType::Open).with_id_dst(server_id))?;

        let mut write = Fpdu::new(FpduType::Write).with_id_dst(server_id);
        if progress.sync_point > 0 {
            write = write.with_param(PiValue::num(Pi::RestartPoint, progress.sync_point as u64));
        }
        let ack = session.send_with_ack(&write)?;
        let granted = ack.num(Pi::RestartPoint).unwrap_or(0) as u32;
        if progress.sync_point > 0 && granted != progress.sync_point {
            warn!(
                requested = progress.sync_point,
                granted, "restart not granted, sending from the beginning"
            );
            *progress = SendProgress::default();
        }
        let mut offset = progress.offset as usize;
        if offset > 0 {
            info!(
                sync_point = progress.sync_point,
                offset, "resuming interrupted transfer"
            );
        }

        // Data phase: bounded DTF chunks, a SYN after every interval.
        let mut writer = ChunkWriter::new(server_id, self.cfg.max_entity_size as usize);
        let interval = self.cfg.sync_interval_kb as usize * 1024;
        let mut sync_point = progress.sync_point;
        while offset < data.len() {
            let block_end = if interval > 0 {
                (offset + interval).min(data.len())
            } else {
                data.len()
            };
            writer.write_bytes(session.channel_mut(), &data[offset..block_end])?;
            offset = block_end;
            if interval > 0 && offset < data.len() {
                sync_point += 1;
                let syn = Fpdu::new(FpduType::Syn)
                    .with_id_dst(server_id)
                    .with_param(PiValue::num(Pi::SyncNumber, sync_point as u64));
                session.send_with_ack(&syn)?;
                progress.sync_point = sync_point;
                progress.offset = offset as u64;
            }
        }

        session.send(&diag_frame(FpduType::DtfEnd, server_id))?;
        let trans_end = Fpdu::new(FpduType::TransEnd)
            .with_id_dst(server_id)
            .with_param(PiValue::num(Pi::ByteCount, data.len() as u64));
        let ack = session.send_with_ack(&trans_end)?;
        let reported = ack.num(Pi::ByteCount).unwrap_or(data.len() as u64);

        self.close_file(&mut session, server_id)?;
        self.release(&mut session, server_id)?;
        Ok(reported)
    }

    /// Fetch a virtual file from the partner.
    pub fn receive_file(
        &self,
        filename: &str,
        transfer_id: u64,
    ) -> Result<(Vec<u8>, Report), SessionError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_receive(filename, transfer_id) {
                Ok(data) => {
                    let bytes = data.len() as u64;
                    return Ok((
                        data,
                        Report {
                            bytes,
                            duration: started.elapsed(),
                        },
                    ));
                }
                Err(err) if attempt <= self.cfg.retries && retryable(&err) => {
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = self.cfg.retry_delay_ms,
                        "transfer failed, retrying"
                    );
                    std::thread::sleep(Duration::from_millis(self.cfg.retry_delay_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_receive(&self, filename: &str, transfer_id: u64) -> Result<Vec<u8>, SessionError> {
        let mut session = self.open_session()?;
        let server_id = self.establish(&mut session)?;

        let select = SelectBuilder::new()
            .filename(filename)
            .transfer_id(transfer_id)
            .max_entity_size(self.cfg.max_entity_size as u64)
            .build(server_id)?;
        session.send_with_ack(&select)?;
        session.send_with_ack(&Fpdu::new(FpduType::Open).with_id_dst(server_id))?;
        session.send_with_ack(
            &Fpdu::new(FpduType::Read)
                .with_id_dst(server_id)
                .with_param(PiValue::num(Pi::RestartPoint, 0)),
        )?;

        let mut received = Vec::new();
        let mut reader = FpduReader::new(&mut session);
        loop {
            let fpdu = reader.read()?;
            match fpdu.kind() {
                FpduType::Dtf | FpduType::Dtfda | FpduType::Dtffa => {
                    received.extend_from_slice(fpdu.data());
                }
                FpduType::Dtfma => {
                    for article in split_articles(fpdu.data()) {
                        received.extend_from_slice(&article);
                    }
                }
                FpduType::DtfEnd => {
                    match fpdu.diagnostic() {
                        Some(diag) if !diag.is_success() => {
                            return Err(SessionError::Rejected {
                                context: FpduType::Read,
                                diag,
                                text: None,
                            })
                        }
                        _ => {}
                    }
                    break;
                }
                other => {
                    warn!(kind = ?other, "unexpected frame during data phase");
                    return Err(SessionError::Rejected {
                        context: FpduType::Read,
                        diag: Diag::PROTOCOL_ERROR,
                        text: None,
                    });
                }
            }
        }

        let trans_end = Fpdu::new(FpduType::TransEnd)
            .with_id_dst(server_id)
            .with_param(PiValue::num(Pi::ByteCount, received.len() as u64));
        session.send_with_ack(&trans_end)?;

        self.close_file(&mut session, server_id)?;
        self.release(&mut session, server_id)?;
        Ok(received)
    }

    /// Deliver a free-form message, segmented when it exceeds one entity.
    pub fn send_message(&self, name: &str, text: &str) -> Result<Report, SessionError> {
        let started = Instant::now();
        let mut session = self.open_session()?;
        let server_id = self.establish(&mut session)?;

        let builder = MessageBuilder::new().filename(name);
        let segments = segment_message(text.as_bytes(), self.cfg.max_entity_size as usize);
        if segments.len() == 1 {
            session.send_with_ack(&builder.build(FpduType::Msg, server_id, segments[0])?)?;
        } else {
            session.send(&builder.build(FpduType::Msgdm, server_id, segments[0])?)?;
            for middle in &segments[1..segments.len() - 1] {
                session.send(&MessageBuilder::segment(FpduType::Msgmm, server_id, middle))?;
            }
            session.send_with_ack(&MessageBuilder::segment(
                FpduType::Msgfm,
                server_id,
                segments[segments.len() - 1],
            ))?;
        }

        self.release(&mut session, server_id)?;
        Ok(Report {
            bytes: text.len() as u64,
            duration: started.elapsed(),
        })
    }

    /// Connect and release, proving the partner answers.
    pub fn probe(&self) -> Result<Report, SessionError> {
        let started = Instant::now();
        let mut session = self.open_session()?;
        let server_id = self.establish(&mut session)?;
        self.release(&mut session, server_id)?;
        Ok(Report {
            bytes: 0,
            duration: started.elapsed(),
        })
    }

    fn open_session(&self) -> Result<Session, SessionError> {
        let channel: Box<dyn TransportChannel> = match &self.cfg.tls_ca {
            Some(ca) => {
                let tls = client_tls_config(ca)?;
                Box::new(TlsTransportChannel::new(&self.cfg.host, self.cfg.port, tls))
            }
            None => Box::new(TcpTransportChannel::new(&self.cfg.host, self.cfg.port)),
        };
        Ok(Session::connect(channel)?
            .strict(self.cfg.strict)
            .ack_grace(self.ack_grace))
    }

    /// CONNECT and return the partner's connection id.
    fn establish(&self, session: &mut Session) -> Result<u8, SessionError> {
        let mut builder = ConnectBuilder::new()
            .requester(&self.cfg.requester)
            .server(&self.cfg.server)
            .resync(self.cfg.sync_interval_kb > 0);
        if self.cfg.sync_interval_kb > 0 {
            builder = builder.sync_interval_kb(self.cfg.sync_interval_kb);
        }
        if let Some(password) = &self.cfg.password {
            builder = builder.password(password);
        }
        let aconnect = session.send_with_ack(&builder.build(CONNECTION_ID))?;
        Ok(aconnect.id_src())
    }

    fn close_file(&self, session: &mut Session, server_id: u8) -> Result<(), SessionError> {
        session.send_with_ack(&diag_frame(FpduType::Close, server_id))?;
        session.send_with_ack(&diag_frame(FpduType::Deselect, server_id))?;
        Ok(())
    }

    fn release(&self, session: &mut Session, server_id: u8) -> Result<(), SessionError> {
        session.send_with_ack(&diag_frame(FpduType::Release, server_id).with_id_src(CONNECTION_ID))?;
        session.close()?;
        Ok(())
    }
}

fn diag_frame(kind: FpduType, id_dst: u8) -> Fpdu {
    Fpdu::new(kind)
        .with_id_dst(id_dst)
        .with_param(PiValue::new(
            Pi::Diagnostic,
            Diag::SUCCESS.to_bytes().to_vec(),
        ))
}

/// Transport faults and resumable interrupts are worth another attempt;
/// rejections and caller bugs are not.
fn retryable(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::Transport(_) | SessionError::Restart { .. }
    )
}

/// Message bytes one frame can carry, leaving room for the header and the
/// identification parameters of the lead frame.
fn segment_budget(max_entity_size: usize) -> usize {
    max_entity_size.saturating_sub(96).max(32)
}

fn segment_message(text: &[u8], max_entity_size: usize) -> Vec<&[u8]> {
    if text.is_empty() {
        return vec![text];
    }
    text.chunks(segment_budget(max_entity_size)).collect()
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use pesit_core::store::{LogTracker, MemoryStore, OpenPartnerDirectory};
    use pesit_core::{SessionContext, SessionHandler};

    use super::*;

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
            let mut ctx = SessionContext::new(&addr.to_string(), "PESIT_SERVER");
            server.run_session(&mut ctx, &mut chan).unwrap();
        });
        (port, handler, join)
    }

    fn client(port: u16, sync_interval_kb: u16) -> Client {
        let cfg = ClientConfig {
            port,
            sync_interval_kb,
            retries: 0,
            ..ClientConfig::default()
        };
        Client::new(cfg).ack_grace(Duration::from_millis(10))
    }

    #[test]
    fn send_commits_file_on_server() {
        let (port, handler, join) = spawn_server();
        let data = vec![0x5A; 3000];
        // 1 kB sync interval forces SYN exchanges mid-transfer.
        let report = client(port, 1).send_file(&data, "UPLOAD", 7).unwrap();
        join.join().unwrap();
        assert_eq!(report.bytes, 3000);
        assert_eq!(handler.store().get("UPLOAD").unwrap(), data);
    }

    #[test]
    fn receive_returns_file_content() {
        let (port, handler, join) = spawn_server();
        handler
            .store()
            .insert("DOWNLOAD", b"remote file content".to_vec());
        let (data, report) = client(port, 0).receive_file("DOWNLOAD", 2).unwrap();
        join.join().unwrap();
        assert_eq!(data, b"remote file content");
        assert_eq!(report.bytes, 19);
    }

    #[test]
    fn receive_of_missing_file_is_rejected() {
        let (port, _handler, join) = spawn_server();
        let err = client(port, 0).receive_file("GHOST", 3).unwrap_err();
        match err {
            SessionError::Rejected { diag, .. } => assert_eq!(diag, Diag::NO_SUCH_FILE),
            other => panic!("expected rejection, got {other:?}"),
        }
        drop(join);
    }

    #[test]
    fn short_message_is_a_single_frame() {
        let (port, _handler, join) = spawn_server();
        let report = client(port, 0).send_message("NOTE", "operator notice").unwrap();
        join.join().unwrap();
        assert_eq!(report.bytes, 15);
    }

    #[test]
    fn long_message_is_segmented() {
        let (port, _handler, join) = spawn_server();
        let text = "x".repeat(10_000);
        let report = client(port, 0).send_message("LONGNOTE", &text).unwrap();
        join.join().unwrap();
        assert_eq!(report.bytes, 10_000);
    }

    #[test]
    fn probe_connects_and_releases() {
        let (port, _handler, join) = spawn_server();
        client(port, 0).probe().unwrap();
        join.join().unwrap();
    }

    #[test]
    fn segments_respect_the_frame_budget() {
        let text = vec![b'a'; 9001];
        let segments = segment_message(&text, 4096);
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.len() <= 4000));
        let joined: Vec<u8> = segments.concat();
        assert_eq!(joined, text);

        assert_eq!(segment_message(b"", 4096), vec![b"" as &[u8]]);
        assert_eq!(segment_message(b"short", 4096).len(), 1);
    }

    #[test]
    fn only_transport_faults_are_retryable() {
        assert!(retryable(&SessionError::Transport(
            pesit_core::TransportError::Timeout
        )));
        assert!(retryable(&SessionError::Restart {
            sync_point: 1,
            restart_point: 1024,
            bytes_transferred: 1024,
        }));
        assert!(!retryable(&SessionError::Rejected {
            context: FpduType::Create,
            diag: Diag::NO_SUCH_FILE,
            text: None,
        }));
        assert!(!retryable(&SessionError::EmptyEntity));
    }
}
