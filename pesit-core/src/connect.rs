//! Builders for the requests an initiating partner sends: session
//! establishment, file creation/selection, and messages.

use chrono::Utc;

use crate::error::CodecError;
use crate::fpdu::{Fpdu, FpduType};
use crate::param::{Pgi, PgiValue, Pi, PiValue};

/// Protocol version carried in PI 06.
pub const PROTOCOL_VERSION: u64 = 2;
/// Highest version a server accepts (PeSIT E).
pub const MAX_SUPPORTED_VERSION: u64 = 5;
/// PI 07 interval value meaning "interval not defined".
pub const UNDEFINED_SYNC_INTERVAL: u16 = 0xFFFF;
/// Largest sync acknowledgment window the profile allows.
pub const MAX_SYNC_WINDOW: u8 = 16;

/// PI 22 access type values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Write = 0,
    Read = 1,
    Mixed = 2,
}

/// PI 16 data code values.
pub const DATA_CODE_ASCII: u64 = 0;
pub const DATA_CODE_EBCDIC: u64 = 1;
pub const DATA_CODE_BINARY: u64 = 2;

/// PI 31 article format: fixed-length records.
pub const ARTICLE_FORMAT_FIXED: u64 = 0x00;
/// PI 31 article format: variable-length records.
pub const ARTICLE_FORMAT_VARIABLE: u64 = 0x80;

/// Builds a CONNECT request.
#[derive(Debug, Clone)]
pub struct ConnectBuilder {
    requester: String,
    server: String,
    password: Option<String>,
    access: AccessType,
    sync_points: bool,
    sync_interval_kb: u16,
    sync_ack_window: u8,
    resync: bool,
}

impl Default for ConnectBuilder {
    fn default() -> Self {
        ConnectBuilder {
            requester: "CLIENT".into(),
            server: "SERVER".into(),
            password: None,
            access: AccessType::Write,
            sync_points: false,
            sync_interval_kb: UNDEFINED_SYNC_INTERVAL,
            sync_ack_window: 1,
            resync: false,
        }
    }
}

impl ConnectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requester(mut self, id: &str) -> Self {
        self.requester = id.into();
        self
    }

    pub fn server(mut self, id: &str) -> Self {
        self.server = id.into();
        self
    }

    /// PI 05 access-control password.
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    /// Enable PI 07 sync points with the default (undefined) interval.
    pub fn sync_points(mut self, enabled: bool) -> Self {
        self.sync_points = enabled;
        self
    }

    /// Sync point interval in kilobytes; 0 disables, 0xFFFF leaves it
    /// undefined.
    pub fn sync_interval_kb(mut self, interval: u16) -> Self {
        self.sync_points = true;
        self.sync_interval_kb = interval;
        self
    }

    /// Sync acknowledgment window, capped at the profile maximum of 16.
    pub fn sync_ack_window(mut self, window: u8) -> Self {
        self.sync_ack_window = window.min(MAX_SYNC_WINDOW);
        self
    }

    pub fn resync(mut self, enabled: bool) -> Self {
        self.resync = enabled;
        self
    }

    pub fn build(&self, connection_id: u8) -> Fpdu {
        let mut fpdu = Fpdu::new(FpduType::Connect)
            .with_id_src(connection_id)
            .with_param(PiValue::text(Pi::Requester, &self.requester))
            .with_param(PiValue::text(Pi::Server, &self.server))
            .with_param(PiValue::num(Pi::Version, PROTOCOL_VERSION))
            .with_param(PiValue::num(Pi::AccessType, self.access as u64));
        if let Some(password) = &self.password {
            fpdu = fpdu.with_param(PiValue::text(Pi::AccessControl, password));
        }
        if self.sync_points {
            fpdu = fpdu.with_param(PiValue::new(
                Pi::SyncPoints,
                sync_points_value(self.sync_interval_kb, self.sync_ack_window).to_vec(),
            ));
        }
        if self.resync {
            fpdu = fpdu.with_param(PiValue::num(Pi::Resync, 1));
        }
        fpdu
    }
}

/// PI 07 content: `[interval:u16 BE][window:u8]`.
pub fn sync_points_value(interval_kb: u16, window: u8) -> [u8; 3] {
    [
        (interval_kb >> 8) as u8,
        (interval_kb & 0xFF) as u8,
        window,
    ]
}

/// Builds a CREATE request opening a virtual file for writing.
#[derive(Debug, Clone)]
pub struct CreateBuilder {
    filename: String,
    file_type: u64,
    transfer_id: u64,
    restart: bool,
    data_code: u64,
    priority: u64,
    max_entity_size: u64,
    article_format: u64,
    record_length: u64,
    reservation_unit: u64,
    max_reservation: u64,
    creation_date: Option<String>,
}

impl Default for CreateBuilder {
    fn default() -> Self {
        CreateBuilder {
            filename: "FILE".into(),
            file_type: 0,
            transfer_id: 1,
            restart: false,
            data_code: DATA_CODE_BINARY,
            priority: 0,
            max_entity_size: 4096,
            article_format: ARTICLE_FORMAT_VARIABLE,
            record_length: 1024,
            reservation_unit: 0,
            max_reservation: 0,
            creation_date: None,
        }
    }
}

impl CreateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(mut self, name: &str) -> Self {
        self.filename = name.into();
        self
    }

    pub fn transfer_id(mut self, id: u64) -> Self {
        self.transfer_id = id;
        self
    }

    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn data_code(mut self, code: u64) -> Self {
        self.data_code = code;
        self
    }

    pub fn priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_entity_size(mut self, size: u64) -> Self {
        self.max_entity_size = size;
        self
    }

    pub fn variable_format(mut self) -> Self {
        self.article_format = ARTICLE_FORMAT_VARIABLE;
        self
    }

    pub fn fixed_format(mut self) -> Self {
        self.article_format = ARTICLE_FORMAT_FIXED;
        self
    }

    pub fn record_length(mut self, len: u64) -> Self {
        self.record_length = len;
        self
    }

    pub fn max_reservation(mut self, kb: u64) -> Self {
        self.max_reservation = kb;
        self
    }

    /// `YYMMDDHHMMSS`; defaults to the current time.
    pub fn creation_date(mut self, date: &str) -> Self {
        self.creation_date = Some(date.into());
        self
    }

    pub fn build(&self, server_connection_id: u8) -> Result<Fpdu, CodecError> {
        let file_id = PgiValue::new(
            Pgi::FileId,
            vec![
                PiValue::num(Pi::FileType, self.file_type),
                PiValue::text(Pi::Filename, &self.filename),
            ],
        )?;
        let logical = PgiValue::new(
            Pgi::LogicalAttrs,
            vec![
                PiValue::num(Pi::ArticleFormat, self.article_format),
                PiValue::num(Pi::ArticleLength, self.record_length),
            ],
        )?;
        let physical = PgiValue::new(
            Pgi::PhysicalAttrs,
            vec![
                PiValue::num(Pi::ReservationUnit, self.reservation_unit),
                PiValue::num(Pi::MaxReservation, self.max_reservation),
            ],
        )?;
        let date = match &self.creation_date {
            Some(d) => d.clone(),
            None => wire_date_now(),
        };
        let history = PgiValue::new(
            Pgi::HistoryAttrs,
            vec![PiValue::text(Pi::CreationDate, &date)],
        )?;

        // idSrc stays 0 on file-level requests.
        Ok(Fpdu::new(FpduType::Create)
            .with_id_dst(server_connection_id)
            .with_param(file_id)
            .with_param(PiValue::num(Pi::TransferId, self.transfer_id))
            .with_param(PiValue::num(Pi::TransferRestart, self.restart as u64))
            .with_param(PiValue::num(Pi::DataCode, self.data_code))
            .with_param(PiValue::num(Pi::Priority, self.priority))
            .with_param(PiValue::num(Pi::MaxEntitySize, self.max_entity_size))
            .with_param(logical)
            .with_param(physical)
            .with_param(history))
    }
}

/// Builds a SELECT request opening a virtual file for reading.
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    filename: String,
    file_type: u64,
    transfer_id: u64,
    restart: bool,
    priority: u64,
    max_entity_size: u64,
}

impl Default for SelectBuilder {
    fn default() -> Self {
        SelectBuilder {
            filename: "FILE".into(),
            file_type: 0,
            transfer_id: 1,
            restart: false,
            priority: 0,
            max_entity_size: 4096,
        }
    }
}

impl SelectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(mut self, name: &str) -> Self {
        self.filename = name.into();
        self
    }

    pub fn transfer_id(mut self, id: u64) -> Self {
        self.transfer_id = id;
        self
    }

    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_entity_size(mut self, size: u64) -> Self {
        self.max_entity_size = size;
        self
    }

    pub fn build(&self, server_connection_id: u8) -> Result<Fpdu, CodecError> {
        let file_id = PgiValue::new(
            Pgi::FileId,
            vec![
                PiValue::num(Pi::FileType, self.file_type),
                PiValue::text(Pi::Filename, &self.filename),
            ],
        )?;
        Ok(Fpdu::new(FpduType::Select)
            .with_id_dst(server_connection_id)
            .with_param(file_id)
            .with_param(PiValue::num(Pi::TransferId, self.transfer_id))
            .with_param(PiValue::num(Pi::TransferRestart, self.restart as u64))
            .with_param(PiValue::num(Pi::Priority, self.priority))
            .with_param(PiValue::num(Pi::MaxEntitySize, self.max_entity_size)))
    }
}

/// Builds the opening frame of a message exchange: a single MSG when the
/// text fits one frame, or the MSGDM lead frame of a segmented message.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    filename: String,
    file_type: u64,
    transfer_id: u64,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        MessageBuilder {
            filename: "MESSAGE".into(),
            file_type: 0,
            transfer_id: 1,
        }
    }
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(mut self, name: &str) -> Self {
        self.filename = name.into();
        self
    }

    pub fn transfer_id(mut self, id: u64) -> Self {
        self.transfer_id = id;
        self
    }

    pub fn build(
        &self,
        kind: FpduType,
        server_connection_id: u8,
        segment: &[u8],
    ) -> Result<Fpdu, CodecError> {
        let file_id = PgiValue::new(
            Pgi::FileId,
            vec![
                PiValue::num(Pi::FileType, self.file_type),
                PiValue::text(Pi::Filename, &self.filename),
            ],
        )?;
        Ok(Fpdu::new(kind)
            .with_id_dst(server_connection_id)
            .with_param(file_id)
            .with_param(PiValue::num(Pi::TransferId, self.transfer_id))
            .with_param(PiValue::new(Pi::Message, segment.to_vec())))
    }

    /// MSGMM / MSGFM continuation frames carry the segment alone.
    pub fn segment(kind: FpduType, server_connection_id: u8, segment: &[u8]) -> Fpdu {
        Fpdu::new(kind)
            .with_id_dst(server_connection_id)
            .with_param(PiValue::new(Pi::Message, segment.to_vec()))
    }
}

/// Current time in the `YYMMDDHHMMSS` wire format.
pub fn wire_date_now() -> String {
    Utc::now().format("%y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_entity;

    #[test]
    fn connect_carries_identities_and_access() {
        let fpdu = ConnectBuilder::new()
            .requester("LOOP")
            .server("PESIT_SERVER")
            .access(AccessType::Write)
            .build(5);
        let frames = parse_entity(&fpdu.to_bytes().unwrap()).unwrap();
        let parsed = &frames[0];
        assert_eq!(parsed.kind(), FpduType::Connect);
        assert_eq!(parsed.id_src(), 5);
        assert_eq!(parsed.text(Pi::Requester).as_deref(), Some("LOOP"));
        assert_eq!(parsed.text(Pi::Server).as_deref(), Some("PESIT_SERVER"));
        assert_eq!(parsed.num(Pi::Version), Some(PROTOCOL_VERSION));
        assert_eq!(parsed.num(Pi::AccessType), Some(0));
        assert!(!parsed.has_param(Pi::AccessControl));
    }

    #[test]
    fn connect_sync_option_packs_interval_and_window() {
        let fpdu = ConnectBuilder::new()
            .sync_interval_kb(8)
            .sync_ack_window(4)
            .resync(true)
            .build(1);
        let pi7 = fpdu.param(Pi::SyncPoints).unwrap();
        assert_eq!(pi7.value, vec![0x00, 0x08, 0x04]);
        assert_eq!(fpdu.num(Pi::Resync), Some(1));
    }

    #[test]
    fn sync_window_is_capped() {
        let fpdu = ConnectBuilder::new()
            .sync_interval_kb(4)
            .sync_ack_window(200)
            .build(1);
        assert_eq!(fpdu.param(Pi::SyncPoints).unwrap().value[2], MAX_SYNC_WINDOW);
    }

    #[test]
    fn create_embeds_all_mandatory_groups() {
        let fpdu = CreateBuilder::new()
            .filename("REPORT")
            .transfer_id(9)
            .variable_format()
            .record_length(30)
            .max_entity_size(56)
            .build(2)
            .unwrap();
        let frames = parse_entity(&fpdu.to_bytes().unwrap()).unwrap();
        let parsed = &frames[0];
        assert_eq!(parsed.kind(), FpduType::Create);
        assert!(parsed.group(Pgi::FileId).is_some());
        assert!(parsed.group(Pgi::LogicalAttrs).is_some());
        assert!(parsed.group(Pgi::PhysicalAttrs).is_some());
        assert!(parsed.group(Pgi::HistoryAttrs).is_some());
        assert_eq!(parsed.num(Pi::TransferId), Some(9));
        assert_eq!(parsed.num(Pi::Priority), Some(0));
        assert_eq!(parsed.num(Pi::MaxEntitySize), Some(56));
        assert_eq!(parsed.text(Pi::Filename).as_deref(), Some("REPORT"));
        assert_eq!(parsed.num(Pi::ArticleLength), Some(30));
        assert_eq!(parsed.num(Pi::ArticleFormat), Some(ARTICLE_FORMAT_VARIABLE));
    }

    #[test]
    fn create_date_defaults_to_wire_format() {
        let fpdu = CreateBuilder::new().build(1).unwrap();
        let date = fpdu.find(Pi::CreationDate).unwrap();
        assert_eq!(date.value.len(), 12);
        assert!(date.value.iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn select_is_parsable_and_minimal() {
        let fpdu = SelectBuilder::new()
            .filename("REPORT")
            .transfer_id(4)
            .build(2)
            .unwrap();
        let frames = parse_entity(&fpdu.to_bytes().unwrap()).unwrap();
        assert_eq!(frames[0].kind(), FpduType::Select);
        assert_eq!(frames[0].text(Pi::Filename).as_deref(), Some("REPORT"));
        assert!(frames[0].group(Pgi::LogicalAttrs).is_none());
    }

    #[test]
    fn message_lead_and_segment_frames() {
        let lead = MessageBuilder::new()
            .filename("NOTE")
            .build(FpduType::Msgdm, 2, b"part one ")
            .unwrap();
        assert_eq!(lead.kind(), FpduType::Msgdm);
        assert_eq!(lead.text(Pi::Filename).as_deref(), Some("NOTE"));

        let middle = MessageBuilder::segment(FpduType::Msgmm, 2, b"part two");
        assert_eq!(middle.kind(), FpduType::Msgmm);
        assert_eq!(middle.param(Pi::Message).unwrap().value, b"part two");
    }
}
