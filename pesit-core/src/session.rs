//! Client-side session: send requests, await and validate acknowledgments.
//!
//! Error frames (ABORT, unsolicited IDT, RCONNECT) and non-zero diagnostics
//! become `SessionError::Rejected` values carrying the wire diagnostic; a
//! resumable interrupt becomes `SessionError::Restart`. Only transport
//! faults propagate as connection failures.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::diag::Diag;
use crate::error::{SessionError, TransportError};
use crate::fpdu::{build_data_frame, Fpdu, FpduType};
use crate::param::Pi;
use crate::parse::parse_entity;
use crate::transport::TransportChannel;

/// Grace period between sending a request and reading its acknowledgment,
/// giving the peer time to process before the blocking read starts.
pub const ACK_GRACE: Duration = Duration::from_millis(300);

pub struct Session {
    channel: Box<dyn TransportChannel>,
    strict: bool,
    ack_grace: Duration,
}

impl Session {
    /// Open the underlying channel and wrap it in a lenient session.
    pub fn connect(mut channel: Box<dyn TransportChannel>) -> Result<Session, TransportError> {
        channel.connect()?;
        Ok(Session {
            channel,
            strict: false,
            ack_grace: ACK_GRACE,
        })
    }

    /// In strict mode an unexpected (but non-error) acknowledgment type is
    /// an error; in lenient mode it is logged and returned anyway.
    pub fn strict(mut self, strict: bool) -> Session {
        self.strict = strict;
        self
    }

    pub fn ack_grace(mut self, grace: Duration) -> Session {
        self.ack_grace = grace;
        self
    }

    pub fn channel_mut(&mut self) -> &mut dyn TransportChannel {
        self.channel.as_mut()
    }

    /// Send a request and validate the next frame as its acknowledgment.
    pub fn send_with_ack(&mut self, fpdu: &Fpdu) -> Result<Fpdu, SessionError> {
        self.send(fpdu)?;
        std::thread::sleep(self.ack_grace);
        let response = self.receive()?;
        self.inspect_response(fpdu.kind(), response)
    }

    /// Fire-and-forget send of a parameterized frame.
    pub fn send(&mut self, fpdu: &Fpdu) -> Result<(), SessionError> {
        let bytes = fpdu.to_bytes()?;
        self.channel.send(&bytes)?;
        Ok(())
    }

    /// Fire-and-forget send of a DTF-family frame around a raw payload.
    pub fn send_data(
        &mut self,
        kind: FpduType,
        id_dst: u8,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let bytes = build_data_frame(kind, id_dst, 0, data)?;
        self.channel.send(&bytes)?;
        Ok(())
    }

    /// Send an already-built frame verbatim.
    pub fn send_raw(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.channel.send(frame)
    }

    /// Receive one entity and return its first logical frame; trailing
    /// frames of a concatenated entity are returned by the reader instead.
    pub fn receive(&mut self) -> Result<Fpdu, SessionError> {
        self.receive_entity()?
            .into_iter()
            .next()
            .ok_or(SessionError::EmptyEntity)
    }

    /// Receive one entity and parse every logical frame in it.
    pub fn receive_entity(&mut self) -> Result<Vec<Fpdu>, SessionError> {
        let raw = self.channel.receive()?;
        Ok(parse_entity(&raw)?)
    }

    pub fn receive_raw(&mut self) -> Result<Vec<u8>, TransportError> {
        self.channel.receive()
    }

    pub fn close(&mut self) -> Result<(), TransportError> {
        self.channel.close()
    }

    fn inspect_response(&self, sent: FpduType, fpdu: Fpdu) -> Result<Fpdu, SessionError> {
        match fpdu.kind() {
            FpduType::Abort | FpduType::Idt | FpduType::Rconnect => {
                error!(received = ?fpdu.kind(), after = ?sent, "error frame received");
                if let Some(restart) = resumable_interrupt(&fpdu) {
                    return Err(restart);
                }
                let diag = fpdu.diagnostic().unwrap_or(Diag::PROTOCOL_ERROR);
                let text = fpdu.text(Pi::FreeText).filter(|t| !t.is_empty());
                if let Some(t) = &text {
                    error!(diag = %diag, message = %t, "remote rejection");
                } else {
                    error!(diag = %diag, "remote rejection");
                }
                Err(SessionError::Rejected {
                    context: sent,
                    diag,
                    text,
                })
            }
            _ => {
                if let Some(diag) = fpdu.diagnostic() {
                    if !diag.is_success() {
                        error!(diag = %diag, after = ?sent, "negative acknowledgment");
                        return Err(SessionError::Rejected {
                            context: sent,
                            diag,
                            text: fpdu.text(Pi::FreeText).filter(|t| !t.is_empty()),
                        });
                    }
                }
                if let Some(expected) = sent.expected_ack() {
                    if fpdu.kind() != expected {
                        if self.strict {
                            return Err(SessionError::UnexpectedAck {
                                sent,
                                expected,
                                got: fpdu.kind(),
                            });
                        }
                        warn!(
                            got = ?fpdu.kind(),
                            expected = ?expected,
                            "unexpected acknowledgment type, continuing"
                        );
                    }
                }
                info!(received = ?fpdu.kind(), "acknowledged");
                Ok(fpdu)
            }
        }
    }
}

/// An IDT carrying a voluntary-stop diagnostic together with a restart
/// point announces that the transfer can be resumed.
fn resumable_interrupt(fpdu: &Fpdu) -> Option<SessionError> {
    if fpdu.kind() != FpduType::Idt {
        return None;
    }
    if fpdu.diagnostic() != Some(Diag::VOLUNTARY_ABORT) {
        return None;
    }
    let restart_point = fpdu.num(Pi::RestartPoint)?;
    Some(SessionError::Restart {
        sync_point: fpdu.num(Pi::SyncNumber).unwrap_or(0) as u32,
        restart_point,
        bytes_transferred: fpdu.num(Pi::ByteCount).unwrap_or(restart_point),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PiValue;
    use crate::transport::mock::ScriptedChannel;

    fn session_with(responses: Vec<Fpdu>) -> Session {
        let mut chan = ScriptedChannel::new();
        for r in responses {
            chan.push_response(r.to_bytes().unwrap());
        }
        Session {
            channel: Box::new(chan),
            strict: false,
            ack_grace: Duration::ZERO,
        }
    }

    fn syn(n: u64) -> Fpdu {
        Fpdu::new(FpduType::Syn).with_param(PiValue::num(Pi::SyncNumber, n))
    }

    #[test]
    fn matching_ack_is_returned() {
        let ack = Fpdu::new(FpduType::AckSyn).with_param(PiValue::num(Pi::SyncNumber, 3));
        let mut session = session_with(vec![ack.clone()]);
        let got = session.send_with_ack(&syn(3)).unwrap();
        assert_eq!(got, ack);
    }

    #[test]
    fn abort_with_diag_is_rejected() {
        let abort = Fpdu::new(FpduType::Abort).with_param(PiValue::new(
            Pi::Diagnostic,
            Diag::PROTOCOL_ERROR.to_bytes().to_vec(),
        ));
        let mut session = session_with(vec![abort]);
        match session.send_with_ack(&syn(1)).unwrap_err() {
            SessionError::Rejected { context, diag, .. } => {
                assert_eq!(context, FpduType::Syn);
                assert_eq!(diag, Diag::PROTOCOL_ERROR);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn rejection_carries_free_text() {
        let rconnect = Fpdu::new(FpduType::Rconnect)
            .with_param(PiValue::new(
                Pi::Diagnostic,
                Diag::UNAUTHORIZED_REQUESTER.to_bytes().to_vec(),
            ))
            .with_param(PiValue::text(Pi::FreeText, "unknown partner"));
        let connect = crate::connect::ConnectBuilder::new().build(1);
        let mut session = session_with(vec![rconnect]);
        match session.send_with_ack(&connect).unwrap_err() {
            SessionError::Rejected { diag, text, .. } => {
                assert_eq!(diag, Diag::UNAUTHORIZED_REQUESTER);
                assert_eq!(text.as_deref(), Some("unknown partner"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn nonzero_diag_in_ack_is_rejected() {
        let nack = Fpdu::new(FpduType::AckWrite)
            .with_param(PiValue::new(
                Pi::Diagnostic,
                Diag::NO_SUCH_FILE.to_bytes().to_vec(),
            ))
            .with_param(PiValue::num(Pi::RestartPoint, 0));
        let mut session = session_with(vec![nack]);
        let err = session
            .send_with_ack(&Fpdu::new(FpduType::Write))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Rejected {
                diag: Diag::NO_SUCH_FILE,
                ..
            }
        ));
    }

    #[test]
    fn strict_mode_rejects_wrong_ack_type() {
        let wrong = Fpdu::new(FpduType::AckRead).with_param(PiValue::new(
            Pi::Diagnostic,
            Diag::SUCCESS.to_bytes().to_vec(),
        ));
        let mut session = session_with(vec![wrong]).strict(true);
        let err = session
            .send_with_ack(&Fpdu::new(FpduType::Write))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::UnexpectedAck {
                sent: FpduType::Write,
                expected: FpduType::AckWrite,
                got: FpduType::AckRead,
            }
        ));
    }

    #[test]
    fn lenient_mode_returns_wrong_ack_type() {
        let wrong = Fpdu::new(FpduType::AckRead).with_param(PiValue::new(
            Pi::Diagnostic,
            Diag::SUCCESS.to_bytes().to_vec(),
        ));
        let mut session = session_with(vec![wrong.clone()]);
        let got = session.send_with_ack(&Fpdu::new(FpduType::Write)).unwrap();
        assert_eq!(got, wrong);
    }

    #[test]
    fn resumable_interrupt_maps_to_restart() {
        let idt = Fpdu::new(FpduType::Idt)
            .with_param(PiValue::new(
                Pi::Diagnostic,
                Diag::VOLUNTARY_ABORT.to_bytes().to_vec(),
            ))
            .with_param(PiValue::num(Pi::RestartPoint, 2048))
            .with_param(PiValue::num(Pi::SyncNumber, 2))
            .with_param(PiValue::num(Pi::ByteCount, 2048));
        let mut session = session_with(vec![idt]);
        match session.send_with_ack(&syn(3)).unwrap_err() {
            SessionError::Restart {
                sync_point,
                restart_point,
                bytes_transferred,
            } => {
                assert_eq!(sync_point, 2);
                assert_eq!(restart_point, 2048);
                assert_eq!(bytes_transferred, 2048);
            }
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[test]
    fn idt_without_restart_point_is_plain_rejection() {
        let idt = Fpdu::new(FpduType::Idt).with_param(PiValue::new(
            Pi::Diagnostic,
            Diag::VOLUNTARY_ABORT.to_bytes().to_vec(),
        ));
        let mut session = session_with(vec![idt]);
        assert!(matches!(
            session.send_with_ack(&syn(1)).unwrap_err(),
            SessionError::Rejected { .. }
        ));
    }
}
