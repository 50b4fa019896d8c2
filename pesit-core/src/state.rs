//! Per-connection server state: protocol states, negotiated capabilities,
//! and the transfer/message contexts a session owns exclusively.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Protocol states of the server side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// CN01: idle, only CONNECT is legal.
    Cn01Idle,
    /// CN03: session established.
    Cn03Connected,
    /// OF02: a virtual file is selected, transfer not running.
    Of02FileOpen,
    /// TDE02B: receiving data for a write transfer.
    Tde02bReceiving,
    /// TDE07: data complete, waiting for the transfer end.
    Tde07WriteEnd,
    /// TDL02B: sending data for a read transfer.
    Tdl02bSending,
    /// Receiving a segmented message.
    MsgReceiving,
}

/// Capabilities negotiated on CONNECT.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub version: u32,
    pub sync_interval_kb: u16,
    pub sync_ack_window: u8,
    pub resync: bool,
}

/// In-flight segmented message buffer.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    pub filename: String,
    pub data: Vec<u8>,
}

/// One accepted connection's state. Owned exclusively by the connection's
/// handling thread.
pub struct SessionContext {
    pub session_id: Uuid,
    pub state: ServerState,
    pub remote_address: String,
    pub server_id: String,
    pub partner: Option<String>,
    /// idSrc the client announced in CONNECT.
    pub client_connection_id: u8,
    /// Our own connection id, echoed as idSrc in session-level replies.
    pub server_connection_id: u8,
    pub capabilities: Capabilities,
    pub transfer: Option<TransferContext>,
    pub message: Option<MessageBuffer>,
    pub aborted: bool,
}

impl SessionContext {
    pub fn new(remote_address: &str, server_id: &str) -> Self {
        SessionContext {
            session_id: Uuid::new_v4(),
            state: ServerState::Cn01Idle,
            remote_address: remote_address.into(),
            server_id: server_id.into(),
            partner: None,
            client_connection_id: 0,
            server_connection_id: 1,
            capabilities: Capabilities::default(),
            transfer: None,
            message: None,
            aborted: false,
        }
    }

    pub fn transition_to(&mut self, state: ServerState) {
        debug!(
            session = %self.session_id,
            from = ?self.state,
            to = ?state,
            "state transition"
        );
        self.state = state;
    }

    /// The session is over: back to idle or aborted.
    pub fn is_finished(&self) -> bool {
        self.aborted || self.state == ServerState::Cn01Idle && self.partner.is_some()
    }
}

/// One open file transfer.
#[derive(Debug)]
pub struct TransferContext {
    pub transfer_id: u32,
    pub file_type: u32,
    pub filename: String,
    pub priority: u8,
    pub data_code: u8,
    pub record_format: u8,
    pub record_length: u32,
    pub max_entity_size: u32,
    /// Space reservation announced in CREATE, in kilobytes; 0 means none.
    pub announced_kb: u64,
    /// True when receiving (WRITE), false when sending (READ).
    pub write_mode: bool,
    pub restart: bool,
    pub restart_point: u32,
    pub current_sync_point: u32,
    /// Byte offset observed at each acknowledged sync point; the resume map.
    pub sync_offsets: BTreeMap<u32, u64>,
    pub bytes_transferred: u64,
    pub records_transferred: u64,
    /// Receive-side accumulation buffer, reset on completion.
    pub data: Vec<u8>,
    pub interrupted: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TransferContext {
    pub fn new(transfer_id: u32, filename: &str, write_mode: bool) -> Self {
        TransferContext {
            transfer_id,
            file_type: 0,
            filename: filename.into(),
            priority: 0,
            data_code: 0,
            record_format: 0,
            record_length: 0,
            max_entity_size: 0,
            announced_kb: 0,
            write_mode,
            restart: false,
            restart_point: 0,
            current_sync_point: 0,
            sync_offsets: BTreeMap::new(),
            bytes_transferred: 0,
            records_transferred: 0,
            data: Vec::new(),
            interrupted: false,
            started_at: None,
            ended_at: None,
        }
    }

    /// Append one received article or chunk.
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
        self.bytes_transferred += data.len() as u64;
        self.records_transferred += 1;
    }

    /// Record an acknowledged sync point and the offset it covers.
    pub fn mark_sync(&mut self, sync_point: u32) {
        self.current_sync_point = sync_point;
        self.sync_offsets.insert(sync_point, self.bytes_transferred);
    }

    /// Drop everything received after the given sync point. Returns the
    /// offset rewound to, or `None` when the point was never acknowledged.
    pub fn rewind_to(&mut self, sync_point: u32) -> Option<u64> {
        let offset = if sync_point == 0 {
            0
        } else {
            *self.sync_offsets.get(&sync_point)?
        };
        self.data.truncate(offset as usize);
        self.bytes_transferred = offset;
        self.current_sync_point = sync_point;
        self.sync_offsets.retain(|&p, _| p <= sync_point);
        Some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_tracks_bytes_and_records() {
        let mut t = TransferContext::new(1, "FILE", true);
        t.append(b"hello ");
        t.append(b"world");
        assert_eq!(t.bytes_transferred, 11);
        assert_eq!(t.records_transferred, 2);
        assert_eq!(t.data, b"hello world");
    }

    #[test]
    fn sync_points_record_offsets() {
        let mut t = TransferContext::new(1, "FILE", true);
        t.append(b"0123456789");
        t.mark_sync(1);
        t.append(b"abcdef");
        t.mark_sync(2);
        assert_eq!(t.sync_offsets.get(&1), Some(&10));
        assert_eq!(t.sync_offsets.get(&2), Some(&16));
    }

    #[test]
    fn rewind_discards_data_past_sync_point() {
        let mut t = TransferContext::new(1, "FILE", true);
        t.append(b"0123456789");
        t.mark_sync(1);
        t.append(b"abcdef");
        assert_eq!(t.rewind_to(1), Some(10));
        assert_eq!(t.data, b"0123456789");
        assert_eq!(t.bytes_transferred, 10);
        assert_eq!(t.current_sync_point, 1);
    }

    #[test]
    fn rewind_to_unknown_point_fails() {
        let mut t = TransferContext::new(1, "FILE", true);
        t.append(b"data");
        assert_eq!(t.rewind_to(9), None);
    }

    #[test]
    fn rewind_to_zero_discards_everything() {
        let mut t = TransferContext::new(1, "FILE", true);
        t.append(b"data");
        t.mark_sync(1);
        assert_eq!(t.rewind_to(0), Some(0));
        assert!(t.data.is_empty());
    }

    #[test]
    fn fresh_context_starts_idle() {
        let ctx = SessionContext::new("127.0.0.1:9", "SRV");
        assert_eq!(ctx.state, ServerState::Cn01Idle);
        assert!(!ctx.is_finished());
        assert!(ctx.transfer.is_none());
    }
}
