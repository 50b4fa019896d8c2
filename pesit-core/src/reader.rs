//! Reads FPDUs from a session one at a time, buffering the extra logical
//! frames a concatenated entity produces so callers keep the
//! one-frame-per-call contract.

use std::collections::VecDeque;

use crate::error::SessionError;
use crate::fpdu::Fpdu;
use crate::session::Session;

pub struct FpduReader<'a> {
    session: &'a mut Session,
    pending: VecDeque<Fpdu>,
}

impl<'a> FpduReader<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        FpduReader {
            session,
            pending: VecDeque::new(),
        }
    }

    /// Next logical frame, reading a new entity from the channel only when
    /// the buffer is drained.
    pub fn read(&mut self) -> Result<Fpdu, SessionError> {
        if let Some(fpdu) = self.pending.pop_front() {
            return Ok(fpdu);
        }
        let frames = self.session.receive_entity()?;
        self.pending.extend(frames);
        self.pending.pop_front().ok_or(SessionError::EmptyEntity)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fpdu::{build_data_frame, FpduType};
    use crate::param::{Pi, PiValue};
    use crate::transport::mock::ScriptedChannel;
    use crate::transport::TransportChannel;

    fn session_over(chan: ScriptedChannel) -> Session {
        let mut boxed: Box<dyn TransportChannel> = Box::new(chan);
        boxed.connect().unwrap();
        Session::connect(boxed)
            .unwrap()
            .ack_grace(Duration::ZERO)
    }

    #[test]
    fn yields_one_frame_per_call_from_concatenated_entity() {
        let mut entity = Vec::new();
        entity.extend_from_slice(&build_data_frame(FpduType::Dtf, 1, 0, b"data").unwrap());
        entity.extend_from_slice(
            &Fpdu::new(FpduType::Syn)
                .with_param(PiValue::num(Pi::SyncNumber, 1))
                .to_bytes()
                .unwrap(),
        );
        let mut chan = ScriptedChannel::new();
        chan.push_response(entity);

        let mut session = session_over(chan);
        let mut reader = FpduReader::new(&mut session);
        let first = reader.read().unwrap();
        assert_eq!(first.kind(), FpduType::Dtf);
        assert_eq!(first.data(), b"data");
        assert!(reader.has_pending());
        let second = reader.read().unwrap();
        assert_eq!(second.kind(), FpduType::Syn);
        assert!(!reader.has_pending());
    }

    #[test]
    fn refills_from_channel_when_drained() {
        let mut chan = ScriptedChannel::new();
        chan.push_response(build_data_frame(FpduType::Dtf, 1, 0, b"one").unwrap());
        chan.push_response(build_data_frame(FpduType::Dtf, 1, 0, b"two").unwrap());

        let mut session = session_over(chan);
        let mut reader = FpduReader::new(&mut session);
        assert_eq!(reader.read().unwrap().data(), b"one");
        assert_eq!(reader.read().unwrap().data(), b"two");
    }
}
