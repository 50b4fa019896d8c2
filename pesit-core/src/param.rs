//! Parameter (PI) and parameter-group (PGI) registry plus the TLV codec.
//!
//! Wire form of a PI: `[id:1][len:1][value:len]`, with `len == 0xFF` escaping
//! to a 2-byte big-endian extended length. A PGI wraps concatenated child PI
//! TLVs behind its own single length byte.

use crate::error::CodecError;

/// Absolute maximum for one parameter value (2-byte extended length).
pub const MAX_VALUE_LEN: usize = 65_535;
/// Largest value length expressible in the single length byte.
pub const SHORT_VALUE_LEN: usize = 254;
const EXTENDED_LEN: u8 = 0xFF;

/// Semantic kind of a parameter value, used for rendering and for picking
/// the numeric encoding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiKind {
    /// Printable text, space padded by some partners.
    Text,
    /// Big-endian unsigned integer of the declared width.
    Num,
    /// Opaque bytes.
    Bytes,
    /// One-byte enumerated value.
    Flag,
    /// `YYMMDDHHMMSS` text date.
    Date,
    /// Bit mask.
    Mask,
}

macro_rules! pi_registry {
    ($( $variant:ident = $id:expr, $kind:ident, $len:expr, $label:expr; )+) => {
        /// Parameter identifiers of the PeSIT E registry.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Pi {
            $( $variant = $id, )+
        }

        impl Pi {
            pub fn id(self) -> u8 {
                self as u8
            }

            pub fn from_id(id: u8) -> Option<Pi> {
                match id {
                    $( $id => Some(Pi::$variant), )+
                    _ => None,
                }
            }

            pub fn kind(self) -> PiKind {
                match self {
                    $( Pi::$variant => PiKind::$kind, )+
                }
            }

            /// Declared wire width; `None` means variable length.
            pub fn declared_len(self) -> Option<usize> {
                match self {
                    $( Pi::$variant => $len, )+
                }
            }

            pub fn label(self) -> &'static str {
                match self {
                    $( Pi::$variant => $label, )+
                }
            }
        }
    };
}

pi_registry! {
    Crc = 0x01, Flag, Some(1), "CRC usage";
    Diagnostic = 0x02, Bytes, Some(3), "diagnostic";
    Requester = 0x03, Text, Some(24), "requester identification";
    Server = 0x04, Text, Some(24), "server identification";
    AccessControl = 0x05, Text, Some(16), "access control";
    Version = 0x06, Num, Some(2), "version number";
    SyncPoints = 0x07, Bytes, Some(3), "sync point option";
    FileType = 11, Num, Some(2), "file type";
    Filename = 12, Text, Some(24), "filename";
    TransferId = 13, Num, Some(3), "transfer identifier";
    RequestedAttrs = 14, Mask, Some(1), "requested attributes";
    TransferRestart = 15, Flag, Some(1), "transfer restarted";
    DataCode = 16, Flag, Some(1), "data code";
    Priority = 17, Flag, Some(1), "transfer priority";
    RestartPoint = 18, Num, Some(3), "restart point";
    EndTransferCode = 19, Flag, Some(1), "end of transfer code";
    SyncNumber = 20, Num, Some(3), "sync point number";
    Compression = 21, Bytes, Some(2), "compression";
    AccessType = 22, Flag, Some(1), "access type";
    Resync = 23, Flag, Some(1), "resynchronization";
    MaxEntitySize = 25, Num, Some(2), "max data entity size";
    Timeout = 26, Num, Some(2), "timeout";
    ByteCount = 27, Num, Some(8), "data byte count";
    ArticleCount = 28, Num, Some(4), "article count";
    DiagComplement = 29, Text, Some(254), "diagnostic complement";
    ArticleFormat = 31, Mask, Some(1), "article format";
    ArticleLength = 32, Num, Some(2), "article length";
    FileOrganization = 33, Flag, Some(1), "file organization";
    SignatureHandling = 34, Num, Some(2), "signature handling";
    SitSeal = 36, Bytes, Some(64), "SIT seal";
    FileLabel = 37, Text, Some(80), "file label";
    KeyLength = 38, Num, Some(2), "key length";
    KeyOffset = 39, Num, Some(2), "key offset in record";
    ReservationUnit = 41, Flag, Some(1), "reservation unit";
    MaxReservation = 42, Num, Some(4), "max space reservation";
    CreationDate = 51, Date, Some(12), "creation date";
    ExtractionDate = 52, Date, Some(12), "last extraction date";
    ClientId = 61, Text, Some(24), "client identifier";
    BankId = 62, Text, Some(24), "bank identifier";
    FileAccessControl = 63, Text, Some(16), "file access control";
    ServerDate = 64, Date, Some(12), "server date";
    AuthType = 71, Bytes, Some(3), "authentication type";
    AuthElements = 72, Bytes, None, "authentication elements";
    SealType = 73, Bytes, Some(4), "sealing type";
    SealElements = 74, Bytes, None, "sealing elements";
    CipherType = 75, Bytes, Some(4), "encryption type";
    CipherElements = 76, Bytes, None, "encryption elements";
    SignatureType = 77, Bytes, Some(4), "signature type";
    Seal = 78, Bytes, Some(4), "seal";
    Signature = 79, Bytes, Some(4), "signature";
    Accreditation = 80, Bytes, Some(168), "accreditation";
    SignedReceipt = 81, Bytes, Some(64), "signed receipt acknowledgment";
    SecondSignature = 82, Bytes, Some(64), "second signature";
    SecondAccreditation = 83, Bytes, Some(168), "second accreditation";
    Message = 91, Text, Some(4096), "message";
    FreeText = 99, Text, Some(254), "free text";
}

/// Parameter group identifiers and their legal member sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pgi {
    FileId = 9,
    LogicalAttrs = 30,
    PhysicalAttrs = 40,
    HistoryAttrs = 50,
}

impl Pgi {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Pgi> {
        match id {
            9 => Some(Pgi::FileId),
            30 => Some(Pgi::LogicalAttrs),
            40 => Some(Pgi::PhysicalAttrs),
            50 => Some(Pgi::HistoryAttrs),
            _ => None,
        }
    }

    /// Legal members with their mandatory flags.
    pub fn members(self) -> &'static [(Pi, bool)] {
        match self {
            Pgi::FileId => &[
                (Pi::Requester, false),
                (Pi::Server, false),
                (Pi::FileType, true),
                (Pi::Filename, true),
            ],
            Pgi::LogicalAttrs => &[
                (Pi::ArticleFormat, false),
                (Pi::ArticleLength, true),
                (Pi::FileOrganization, false),
                (Pi::SignatureHandling, false),
                (Pi::SitSeal, false),
                (Pi::FileLabel, false),
                (Pi::KeyLength, false),
                (Pi::KeyOffset, false),
            ],
            Pgi::PhysicalAttrs => &[(Pi::ReservationUnit, false), (Pi::MaxReservation, true)],
            Pgi::HistoryAttrs => &[(Pi::CreationDate, true), (Pi::ExtractionDate, false)],
        }
    }

    pub fn contains(self, pi: Pi) -> bool {
        self.members().iter().any(|(m, _)| *m == pi)
    }

    pub fn label(self) -> &'static str {
        match self {
            Pgi::FileId => "file identifier",
            Pgi::LogicalAttrs => "logical attributes",
            Pgi::PhysicalAttrs => "physical attributes",
            Pgi::HistoryAttrs => "history attributes",
        }
    }
}

/// Either kind of identifier, as referenced by FPDU requirement tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamId {
    Pi(Pi),
    Pgi(Pgi),
}

impl ParamId {
    pub fn id(self) -> u8 {
        match self {
            ParamId::Pi(pi) => pi.id(),
            ParamId::Pgi(pgi) => pgi.id(),
        }
    }
}

/// One parameter with its raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiValue {
    pub pi: Pi,
    pub value: Vec<u8>,
}

impl PiValue {
    pub fn new(pi: Pi, value: impl Into<Vec<u8>>) -> Self {
        PiValue {
            pi,
            value: value.into(),
        }
    }

    pub fn text(pi: Pi, value: &str) -> Self {
        PiValue::new(pi, value.as_bytes().to_vec())
    }

    /// Encode a numeric value big-endian into the identifier's declared
    /// width, or into the minimal width for variable-length identifiers.
    pub fn num(pi: Pi, value: u64) -> Self {
        let width = pi.declared_len().unwrap_or_else(|| minimal_width(value));
        let width = width.min(8).max(minimal_width(value));
        let be = value.to_be_bytes();
        PiValue::new(pi, be[8 - width..].to_vec())
    }

    pub fn as_u64(&self) -> u64 {
        self.value.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.value).trim().to_string()
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_tlv(self.pi.id(), &self.value, out).map_err(|_| CodecError::ValueTooLarge {
            pi: self.pi,
            len: self.value.len(),
        })
    }
}

fn minimal_width(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    ((bits + 7) / 8).max(1)
}

/// A group with its child parameters, membership-checked at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgiValue {
    pub pgi: Pgi,
    pub members: Vec<PiValue>,
}

impl PgiValue {
    pub fn new(pgi: Pgi, members: Vec<PiValue>) -> Result<Self, CodecError> {
        for m in &members {
            if !pgi.contains(m.pi) {
                return Err(CodecError::InvalidGroupMember { pgi, pi: m.pi });
            }
        }
        Ok(PgiValue { pgi, members })
    }

    pub fn member(&self, pi: Pi) -> Option<&PiValue> {
        self.members.iter().find(|m| m.pi == pi)
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut body = Vec::new();
        for m in &self.members {
            m.encode(&mut body)?;
        }
        if body.len() > SHORT_VALUE_LEN {
            return Err(CodecError::GroupTooLarge {
                pgi: self.pgi,
                len: body.len(),
            });
        }
        out.push(self.pgi.id());
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
        Ok(())
    }
}

/// A decoded or to-be-encoded parameter of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Pi(PiValue),
    Group(PgiValue),
}

impl Param {
    pub fn id(&self) -> u8 {
        match self {
            Param::Pi(p) => p.pi.id(),
            Param::Group(g) => g.pgi.id(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Param::Pi(p) => p.encode(out),
            Param::Group(g) => g.encode(out),
        }
    }
}

impl From<PiValue> for Param {
    fn from(p: PiValue) -> Self {
        Param::Pi(p)
    }
}

impl From<PgiValue> for Param {
    fn from(g: PgiValue) -> Self {
        Param::Group(g)
    }
}

fn encode_tlv(id: u8, value: &[u8], out: &mut Vec<u8>) -> Result<(), ()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(());
    }
    out.push(id);
    if value.len() > SHORT_VALUE_LEN {
        out.push(EXTENDED_LEN);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    } else {
        out.push(value.len() as u8);
    }
    out.extend_from_slice(value);
    Ok(())
}

/// Decode one PI or PGI TLV from the front of `buf`. Returns the parameter
/// and the number of bytes consumed.
pub fn decode_param(buf: &[u8]) -> Result<(Param, usize), CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::TruncatedFrame {
            needed: 2 - buf.len(),
        });
    }
    let id = buf[0];
    if let Some(pi) = Pi::from_id(id) {
        let (value, consumed) = read_value(&buf[1..])?;
        Ok((Param::Pi(PiValue::new(pi, value)), 1 + consumed))
    } else if let Some(pgi) = Pgi::from_id(id) {
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(CodecError::TruncatedFrame {
                needed: 2 + len - buf.len(),
            });
        }
        let members = decode_group_members(pgi, &buf[2..2 + len])?;
        Ok((Param::Group(PgiValue { pgi, members }), 2 + len))
    } else {
        Err(CodecError::UnknownParameter(id))
    }
}

/// Read `[len | 0xFF len16][value]` from `buf`; returns the value and bytes
/// consumed (length field included).
fn read_value(buf: &[u8]) -> Result<(Vec<u8>, usize), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::TruncatedFrame { needed: 1 });
    }
    let (len, header) = if buf[0] == EXTENDED_LEN {
        if buf.len() < 3 {
            return Err(CodecError::TruncatedFrame {
                needed: 3 - buf.len(),
            });
        }
        (u16::from_be_bytes([buf[1], buf[2]]) as usize, 3)
    } else {
        (buf[0] as usize, 1)
    };
    if buf.len() < header + len {
        return Err(CodecError::TruncatedFrame {
            needed: header + len - buf.len(),
        });
    }
    Ok((buf[header..header + len].to_vec(), header + len))
}

fn decode_group_members(pgi: Pgi, mut body: &[u8]) -> Result<Vec<PiValue>, CodecError> {
    let mut members = Vec::new();
    while !body.is_empty() {
        if body.len() < 2 {
            return Err(CodecError::TruncatedFrame {
                needed: 2 - body.len(),
            });
        }
        let id = body[0];
        let len = body[1] as usize;
        if body.len() < 2 + len {
            return Err(CodecError::TruncatedFrame {
                needed: 2 + len - body.len(),
            });
        }
        let pi = Pi::from_id(id).ok_or(CodecError::UnknownParameter(id))?;
        if !pgi.contains(pi) {
            return Err(CodecError::InvalidGroupMember { pgi, pi });
        }
        members.push(PiValue::new(pi, body[2..2 + len].to_vec()));
        body = &body[2 + len..];
    }
    Ok(members)
}
