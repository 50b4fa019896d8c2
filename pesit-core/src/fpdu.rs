//! FPDU model: the (phase, type) registry, per-type parameter requirements,
//! and the frame builder.
//!
//! Header layout: `[totalLength:u16 BE][phase:u8][type:u8][idDst:u8][idSrc:u8]`,
//! where `totalLength` covers the whole frame including itself. DTF-family
//! frames carry raw payload after the header; every other type carries a flat
//! PI/PGI sequence.

use crate::diag::Diag;
use crate::error::CodecError;
use crate::param::{Param, ParamId, Pgi, PgiValue, Pi, PiValue};

/// Fixed header size: length + phase + type + idDst + idSrc.
pub const FPDU_HEADER_LEN: usize = 6;
/// Largest frame the 2-byte length field can describe.
pub const MAX_FPDU_LEN: usize = 65_535;

macro_rules! fpdu_registry {
    ($( $variant:ident = ($phase:expr, $ty:expr); )+) => {
        /// Every FPDU kind of the PeSIT E registry.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum FpduType {
            $( $variant, )+
        }

        impl FpduType {
            pub fn phase(self) -> u8 {
                match self {
                    $( FpduType::$variant => $phase, )+
                }
            }

            pub fn type_code(self) -> u8 {
                match self {
                    $( FpduType::$variant => $ty, )+
                }
            }

            pub fn from_wire(phase: u8, ty: u8) -> Option<FpduType> {
                match (phase, ty) {
                    $( ($phase, $ty) => Some(FpduType::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

fpdu_registry! {
    Connect = (0x40, 0x20);
    Aconnect = (0x40, 0x21);
    Rconnect = (0x40, 0x22);
    Release = (0x40, 0x23);
    Relconf = (0x40, 0x24);
    Abort = (0x40, 0x25);
    Create = (0xC0, 0x11);
    AckCreate = (0xC0, 0x30);
    Select = (0xC0, 0x12);
    AckSelect = (0xC0, 0x31);
    Deselect = (0xC0, 0x13);
    AckDeselect = (0xC0, 0x32);
    Open = (0xC0, 0x14);
    AckOpen = (0xC0, 0x33);
    Close = (0xC0, 0x15);
    AckClose = (0xC0, 0x34);
    Write = (0xC0, 0x02);
    AckWrite = (0xC0, 0x36);
    Read = (0xC0, 0x01);
    AckRead = (0xC0, 0x35);
    TransEnd = (0xC0, 0x08);
    AckTransEnd = (0xC0, 0x37);
    Dtf = (0x00, 0x00);
    Dtfma = (0x00, 0x40);
    Dtfda = (0x00, 0x41);
    Dtffa = (0x00, 0x42);
    DtfEnd = (0xC0, 0x04);
    Syn = (0xC0, 0x03);
    AckSyn = (0xC0, 0x38);
    Resyn = (0xC0, 0x05);
    AckResyn = (0xC0, 0x39);
    Idt = (0xC0, 0x06);
    AckIdt = (0xC0, 0x3A);
    Msg = (0xC0, 0x16);
    Msgdm = (0xC0, 0x17);
    Msgmm = (0xC0, 0x18);
    Msgfm = (0xC0, 0x19);
    AckMsg = (0xC0, 0x3B);
}

impl FpduType {
    /// Acknowledgment the peer is expected to answer with, if any.
    pub fn expected_ack(self) -> Option<FpduType> {
        use FpduType::*;
        match self {
            Connect => Some(Aconnect),
            Release => Some(Relconf),
            Create => Some(AckCreate),
            Select => Some(AckSelect),
            Deselect => Some(AckDeselect),
            Open => Some(AckOpen),
            Close => Some(AckClose),
            Write => Some(AckWrite),
            Read => Some(AckRead),
            TransEnd => Some(AckTransEnd),
            Syn => Some(AckSyn),
            Resyn => Some(AckResyn),
            Idt => Some(AckIdt),
            Msg | Msgfm => Some(AckMsg),
            _ => None,
        }
    }

    /// DTF family frames carry raw payload instead of parameters.
    pub fn is_dtf(self) -> bool {
        matches!(
            self,
            FpduType::Dtf | FpduType::Dtfma | FpduType::Dtfda | FpduType::Dtffa
        )
    }

    pub fn is_session_level(self) -> bool {
        self.phase() == 0x40
    }

    pub fn is_file_level(self) -> bool {
        self.phase() == 0xC0
    }

    /// Declared parameters with their mandatory flags. Building a frame that
    /// lacks a mandatory entry fails; extra parameters are not rejected.
    pub fn requirements(self) -> &'static [(ParamId, bool)] {
        use ParamId::Pgi as G;
        use ParamId::Pi as P;
        match self {
            FpduType::Connect => &[
                (P(Pi::Crc), false),
                (P(Pi::Requester), true),
                (P(Pi::Server), true),
                (P(Pi::AccessControl), false),
                (P(Pi::Version), true),
                (P(Pi::SyncPoints), false),
                (P(Pi::AccessType), true),
                (P(Pi::Resync), false),
                (P(Pi::FreeText), false),
            ],
            FpduType::Aconnect => &[
                (P(Pi::AccessControl), false),
                (P(Pi::Version), true),
                (P(Pi::SyncPoints), false),
                (P(Pi::Resync), false),
                (P(Pi::FreeText), false),
            ],
            FpduType::Rconnect => &[(P(Pi::Diagnostic), true), (P(Pi::FreeText), false)],
            FpduType::Release => &[(P(Pi::Diagnostic), true), (P(Pi::FreeText), false)],
            FpduType::Relconf => &[(P(Pi::FreeText), false)],
            FpduType::Abort => &[(P(Pi::Diagnostic), true)],
            FpduType::Create => &[
                (G(Pgi::FileId), true),
                (P(Pi::TransferId), true),
                (P(Pi::TransferRestart), false),
                (P(Pi::DataCode), false),
                (P(Pi::Priority), true),
                (P(Pi::MaxEntitySize), true),
                (G(Pgi::LogicalAttrs), true),
                (G(Pgi::PhysicalAttrs), true),
                (G(Pgi::HistoryAttrs), true),
                (P(Pi::ClientId), false),
                (P(Pi::BankId), false),
                (P(Pi::FileAccessControl), false),
                (P(Pi::AuthType), false),
                (P(Pi::AuthElements), false),
                (P(Pi::SealType), false),
                (P(Pi::CipherType), false),
                (P(Pi::SignatureType), false),
                (P(Pi::Accreditation), false),
                (P(Pi::FreeText), false),
            ],
            FpduType::AckCreate => &[
                (P(Pi::Diagnostic), true),
                (P(Pi::TransferId), false),
                (P(Pi::MaxEntitySize), true),
                (P(Pi::AuthElements), false),
                (P(Pi::Accreditation), false),
                (P(Pi::SecondAccreditation), false),
                (P(Pi::FreeText), false),
            ],
            FpduType::Select => &[
                (G(Pgi::FileId), true),
                (P(Pi::TransferId), true),
                (P(Pi::RequestedAttrs), false),
                (P(Pi::TransferRestart), false),
                (P(Pi::Priority), true),
                (P(Pi::MaxEntitySize), true),
                (P(Pi::ClientId), false),
                (P(Pi::BankId), false),
                (P(Pi::FileAccessControl), false),
                (P(Pi::AuthType), false),
                (P(Pi::AuthElements), false),
                (P(Pi::SealType), false),
                (P(Pi::CipherType), false),
                (P(Pi::SignatureType), false),
                (P(Pi::Accreditation), false),
                (P(Pi::FreeText), false),
            ],
            FpduType::AckSelect => &[
                (P(Pi::Diagnostic), true),
                (G(Pgi::FileId), true),
                (P(Pi::TransferId), true),
                (P(Pi::DataCode), false),
                (P(Pi::MaxEntitySize), true),
                (G(Pgi::LogicalAttrs), true),
                (G(Pgi::PhysicalAttrs), true),
                (G(Pgi::HistoryAttrs), true),
                (P(Pi::AuthElements), false),
                (P(Pi::Accreditation), false),
                (P(Pi::SecondAccreditation), false),
                (P(Pi::FreeText), false),
            ],
            FpduType::Deselect => &[(P(Pi::Diagnostic), true), (P(Pi::FreeText), false)],
            FpduType::AckDeselect => &[(P(Pi::Diagnostic), true), (P(Pi::FreeText), false)],
            FpduType::Open => &[
                (P(Pi::Compression), false),
                (P(Pi::AuthElements), false),
                (P(Pi::SealElements), false),
                (P(Pi::CipherElements), false),
                (P(Pi::Accreditation), false),
                (P(Pi::SecondAccreditation), false),
            ],
            FpduType::AckOpen => &[
                (P(Pi::Diagnostic), true),
                (P(Pi::Compression), false),
                (P(Pi::SealElements), false),
                (P(Pi::CipherElements), false),
            ],
            FpduType::Close => &[(P(Pi::Diagnostic), true)],
            FpduType::AckClose => &[(P(Pi::Diagnostic), true)],
            FpduType::Write => &[(P(Pi::RestartPoint), false)],
            FpduType::AckWrite => &[(P(Pi::Diagnostic), true), (P(Pi::RestartPoint), true)],
            FpduType::Read => &[(P(Pi::RestartPoint), true)],
            FpduType::AckRead => &[(P(Pi::Diagnostic), true)],
            FpduType::TransEnd => &[
                (P(Pi::ByteCount), false),
                (P(Pi::ArticleCount), false),
                (P(Pi::SignedReceipt), false),
            ],
            FpduType::AckTransEnd => &[
                (P(Pi::Diagnostic), true),
                (P(Pi::ByteCount), false),
                (P(Pi::ArticleCount), false),
                (P(Pi::SignedReceipt), false),
            ],
            FpduType::Dtf | FpduType::Dtfma | FpduType::Dtfda | FpduType::Dtffa => &[],
            FpduType::DtfEnd => &[
                (P(Pi::Diagnostic), true),
                (P(Pi::Seal), false),
                (P(Pi::Signature), false),
            ],
            FpduType::Syn => &[(P(Pi::SyncNumber), true), (P(Pi::Seal), false)],
            FpduType::AckSyn => &[(P(Pi::SyncNumber), true)],
            FpduType::Resyn => &[(P(Pi::Diagnostic), true), (P(Pi::RestartPoint), true)],
            FpduType::AckResyn => &[(P(Pi::RestartPoint), true)],
            FpduType::Idt => &[(P(Pi::Diagnostic), false), (P(Pi::EndTransferCode), false)],
            FpduType::AckIdt => &[],
            FpduType::Msg | FpduType::Msgdm => &[
                (G(Pgi::FileId), true),
                (P(Pi::TransferId), true),
                (P(Pi::RequestedAttrs), false),
                (P(Pi::DataCode), false),
                (G(Pgi::HistoryAttrs), false),
                (P(Pi::ClientId), false),
                (P(Pi::BankId), false),
                (P(Pi::Message), false),
            ],
            FpduType::Msgmm | FpduType::Msgfm => &[(P(Pi::Message), false)],
            FpduType::AckMsg => &[
                (P(Pi::Diagnostic), true),
                (P(Pi::TransferId), false),
                (P(Pi::DataCode), false),
                (P(Pi::Message), false),
            ],
        }
    }
}

/// One frame: kind, connection ids, and either parameters or raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Fpdu {
    kind: FpduType,
    id_dst: u8,
    id_src: u8,
    params: Vec<Param>,
    data: Vec<u8>,
}

impl Fpdu {
    pub fn new(kind: FpduType) -> Self {
        Fpdu {
            kind,
            id_dst: 0,
            id_src: 0,
            params: Vec::new(),
            data: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        kind: FpduType,
        id_dst: u8,
        id_src: u8,
        params: Vec<Param>,
        data: Vec<u8>,
    ) -> Self {
        Fpdu {
            kind,
            id_dst,
            id_src,
            params,
            data,
        }
    }

    pub fn with_id_dst(mut self, id: u8) -> Self {
        self.id_dst = id;
        self
    }

    pub fn with_id_src(mut self, id: u8) -> Self {
        self.id_src = id;
        self
    }

    pub fn with_param(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn kind(&self) -> FpduType {
        self.kind
    }

    pub fn id_dst(&self) -> u8 {
        self.id_dst
    }

    pub fn id_src(&self) -> u8 {
        self.id_src
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn append_data(&mut self, more: &[u8]) {
        self.data.extend_from_slice(more);
    }

    /// Top-level PI lookup.
    pub fn param(&self, pi: Pi) -> Option<&PiValue> {
        self.params.iter().find_map(|p| match p {
            Param::Pi(v) if v.pi == pi => Some(v),
            _ => None,
        })
    }

    /// Top-level PGI lookup.
    pub fn group(&self, pgi: Pgi) -> Option<&PgiValue> {
        self.params.iter().find_map(|p| match p {
            Param::Group(g) if g.pgi == pgi => Some(g),
            _ => None,
        })
    }

    /// PI lookup at top level, then inside any group.
    pub fn find(&self, pi: Pi) -> Option<&PiValue> {
        self.param(pi).or_else(|| {
            self.params.iter().find_map(|p| match p {
                Param::Group(g) => g.member(pi),
                _ => None,
            })
        })
    }

    pub fn has_param(&self, pi: Pi) -> bool {
        self.find(pi).is_some()
    }

    pub fn num(&self, pi: Pi) -> Option<u64> {
        self.find(pi).map(PiValue::as_u64)
    }

    pub fn text(&self, pi: Pi) -> Option<String> {
        self.find(pi).map(PiValue::as_text)
    }

    pub fn diagnostic(&self) -> Option<Diag> {
        self.find(Pi::Diagnostic)
            .and_then(|p| Diag::from_bytes(&p.value))
    }

    /// Serialize the frame, validating mandatory parameters first. A frame
    /// missing a mandatory PI or PGI is never sent.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        for (req, mandatory) in self.kind.requirements() {
            if *mandatory && !self.params.iter().any(|p| p.id() == req.id()) {
                return Err(CodecError::MissingMandatory {
                    fpdu: self.kind,
                    param: req.id(),
                });
            }
        }

        let mut body = Vec::new();
        if self.kind.is_dtf() {
            body.extend_from_slice(&self.data);
        } else {
            for p in &self.params {
                p.encode(&mut body)?;
            }
        }

        let total = FPDU_HEADER_LEN + body.len();
        if total > MAX_FPDU_LEN {
            return Err(CodecError::FrameTooLarge(total));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.push(self.kind.phase());
        out.push(self.kind.type_code());
        out.push(self.id_dst);
        out.push(self.id_src);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Build a raw DTF-family frame around an already-assembled payload.
pub fn build_data_frame(
    kind: FpduType,
    id_dst: u8,
    id_src: u8,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let total = FPDU_HEADER_LEN + payload.len();
    if total > MAX_FPDU_LEN {
        return Err(CodecError::FrameTooLarge(total));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.push(kind.phase());
    out.push(kind.type_code());
    out.push(id_dst);
    out.push(id_src);
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_registry() {
        assert_eq!(FpduType::Connect.phase(), 0x40);
        assert_eq!(FpduType::Connect.type_code(), 0x20);
        assert_eq!(FpduType::from_wire(0x40, 0x21), Some(FpduType::Aconnect));
        assert_eq!(FpduType::from_wire(0x00, 0x00), Some(FpduType::Dtf));
        assert_eq!(FpduType::from_wire(0x00, 0x40), Some(FpduType::Dtfma));
        assert_eq!(FpduType::from_wire(0xC0, 0x3B), Some(FpduType::AckMsg));
        assert_eq!(FpduType::from_wire(0x77, 0x77), None);
    }

    #[test]
    fn ack_pairs() {
        assert_eq!(FpduType::Connect.expected_ack(), Some(FpduType::Aconnect));
        assert_eq!(FpduType::Syn.expected_ack(), Some(FpduType::AckSyn));
        assert_eq!(FpduType::Msgfm.expected_ack(), Some(FpduType::AckMsg));
        assert_eq!(FpduType::Dtf.expected_ack(), None);
        assert_eq!(FpduType::DtfEnd.expected_ack(), None);
    }

    #[test]
    fn length_prefix_covers_whole_frame() {
        let fpdu = Fpdu::new(FpduType::Abort)
            .with_id_dst(2)
            .with_param(PiValue::new(Pi::Diagnostic, Diag::PROTOCOL_ERROR.to_bytes().to_vec()));
        let bytes = fpdu.to_bytes().unwrap();
        assert_eq!(
            u16::from_be_bytes([bytes[0], bytes[1]]) as usize,
            bytes.len()
        );
        assert_eq!(bytes[2], 0x40);
        assert_eq!(bytes[3], 0x25);
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[5], 0);
    }

    #[test]
    fn missing_mandatory_parameter_is_rejected() {
        // ABORT requires a diagnostic.
        let err = Fpdu::new(FpduType::Abort).to_bytes().unwrap_err();
        assert!(matches!(
            err,
            CodecError::MissingMandatory {
                fpdu: FpduType::Abort,
                param: 2
            }
        ));
    }

    #[test]
    fn missing_mandatory_group_is_rejected() {
        let err = Fpdu::new(FpduType::Create)
            .with_param(PiValue::num(Pi::TransferId, 1))
            .with_param(PiValue::num(Pi::Priority, 0))
            .with_param(PiValue::num(Pi::MaxEntitySize, 4096))
            .to_bytes()
            .unwrap_err();
        assert!(matches!(err, CodecError::MissingMandatory { param: 9, .. }));
    }

    #[test]
    fn dtf_carries_raw_payload() {
        let fpdu = Fpdu::new(FpduType::Dtf)
            .with_id_dst(7)
            .with_data(b"payload".to_vec());
        let bytes = fpdu.to_bytes().unwrap();
        assert_eq!(bytes.len(), 6 + 7);
        assert_eq!(&bytes[6..], b"payload");
    }

    #[test]
    fn find_reaches_into_groups() {
        let fpdu = Fpdu::new(FpduType::Msg)
            .with_param(
                PgiValue::new(
                    Pgi::FileId,
                    vec![
                        PiValue::num(Pi::FileType, 0),
                        PiValue::text(Pi::Filename, "NOTE"),
                    ],
                )
                .unwrap(),
            )
            .with_param(PiValue::num(Pi::TransferId, 3));
        assert_eq!(fpdu.text(Pi::Filename).as_deref(), Some("NOTE"));
        assert_eq!(fpdu.num(Pi::TransferId), Some(3));
        assert!(fpdu.param(Pi::Filename).is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let err = build_data_frame(FpduType::Dtf, 1, 0, &vec![0u8; MAX_FPDU_LEN]).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }
}
