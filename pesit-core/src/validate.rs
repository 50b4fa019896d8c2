//! Content validation of incoming FPDUs. Each failed rule maps to the
//! diagnostic the peer receives.

use crate::connect::{ARTICLE_FORMAT_FIXED, MAX_SUPPORTED_VERSION};
use crate::diag::Diag;
use crate::fpdu::Fpdu;
use crate::param::Pi;
use crate::state::TransferContext;

/// A failed rule: the wire diagnostic plus an operator-facing detail.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub diag: Diag,
    pub detail: String,
}

impl Rejection {
    fn new(diag: Diag, detail: impl Into<String>) -> Self {
        Rejection {
            diag,
            detail: detail.into(),
        }
    }
}

/// CONNECT must identify the requester and speak a supported version.
pub fn validate_connect(fpdu: &Fpdu) -> Result<(), Rejection> {
    if !fpdu.has_param(Pi::Requester) {
        return Err(Rejection::new(
            Diag::MISSING_PARAMETER,
            "missing requester identification",
        ));
    }
    if let Some(version) = fpdu.num(Pi::Version) {
        if version > MAX_SUPPORTED_VERSION {
            return Err(Rejection::new(
                Diag::UNSUPPORTED_VERSION,
                format!("version {version} not supported (max {MAX_SUPPORTED_VERSION})"),
            ));
        }
    }
    Ok(())
}

/// CREATE must name the file; fixed-format records need a positive length.
pub fn validate_create(fpdu: &Fpdu) -> Result<(), Rejection> {
    if !fpdu.has_param(Pi::Filename) {
        return Err(Rejection::new(Diag::MISSING_PARAMETER, "missing filename"));
    }
    if fpdu.num(Pi::ArticleFormat) == Some(ARTICLE_FORMAT_FIXED) {
        match fpdu.num(Pi::ArticleLength) {
            Some(len) if len > 0 => {}
            _ => {
                return Err(Rejection::new(
                    Diag::MISSING_PARAMETER,
                    "fixed article format requires a positive record length",
                ))
            }
        }
    }
    Ok(())
}

pub fn validate_select(fpdu: &Fpdu) -> Result<(), Rejection> {
    if !fpdu.has_param(Pi::Filename) {
        return Err(Rejection::new(Diag::MISSING_PARAMETER, "missing filename"));
    }
    Ok(())
}

/// SYN must carry a strictly increasing sync point number.
pub fn validate_syn(fpdu: &Fpdu, transfer: &TransferContext) -> Result<u32, Rejection> {
    let sync_point = fpdu
        .num(Pi::SyncNumber)
        .ok_or_else(|| Rejection::new(Diag::MISSING_PARAMETER, "missing sync point number"))?;
    if sync_point <= transfer.current_sync_point as u64 {
        return Err(Rejection::new(
            Diag::SYNC_NEGOTIATION_FAILED,
            format!(
                "sync point {sync_point} not above current {}",
                transfer.current_sync_point
            ),
        ));
    }
    Ok(sync_point as u32)
}

/// Received data must respect the negotiated entity size, and fixed-format
/// articles the announced record length.
pub fn validate_dtf(data: &[u8], transfer: &TransferContext) -> Result<(), Rejection> {
    let max = transfer.max_entity_size as usize;
    if max > 0 && data.len() > max {
        return Err(Rejection::new(
            Diag::ARTICLE_TOO_LONG,
            format!("data chunk of {} bytes exceeds entity size {max}", data.len()),
        ));
    }
    if transfer.record_format == ARTICLE_FORMAT_FIXED as u8
        && transfer.record_length > 0
        && data.len() > transfer.record_length as usize
    {
        return Err(Rejection::new(
            Diag::ARTICLE_TOO_LONG,
            format!(
                "article of {} bytes exceeds announced record length {}",
                data.len(),
                transfer.record_length
            ),
        ));
    }
    Ok(())
}

/// Declared totals in TRANS.END must match what was observed.
pub fn validate_trans_end(fpdu: &Fpdu, transfer: &TransferContext) -> Result<(), Rejection> {
    if let Some(declared) = fpdu.num(Pi::ByteCount) {
        if declared != transfer.bytes_transferred {
            return Err(Rejection::new(
                Diag::COUNT_MISMATCH,
                format!(
                    "declared {declared} bytes, received {}",
                    transfer.bytes_transferred
                ),
            ));
        }
    }
    if let Some(declared) = fpdu.num(Pi::ArticleCount) {
        if declared != transfer.records_transferred {
            return Err(Rejection::new(
                Diag::COUNT_MISMATCH,
                format!(
                    "declared {declared} articles, received {}",
                    transfer.records_transferred
                ),
            ));
        }
    }
    Ok(())
}

/// The received file must not exceed the space reservation from CREATE.
pub fn validate_file_size(actual_bytes: u64, announced_kb: u64) -> Result<(), Rejection> {
    if announced_kb > 0 && actual_bytes > announced_kb * 1024 {
        return Err(Rejection::new(
            Diag::SIZE_EXCEEDED,
            format!("{actual_bytes} bytes exceed the announced {announced_kb} kB"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{ConnectBuilder, CreateBuilder, ARTICLE_FORMAT_VARIABLE};
    use crate::fpdu::FpduType;
    use crate::param::PiValue;

    fn transfer() -> TransferContext {
        let mut t = TransferContext::new(1, "FILE", true);
        t.max_entity_size = 100;
        t
    }

    #[test]
    fn connect_requires_requester() {
        let bare = Fpdu::new(FpduType::Connect);
        let err = validate_connect(&bare).unwrap_err();
        assert_eq!(err.diag, Diag::MISSING_PARAMETER);
        assert!(validate_connect(&ConnectBuilder::new().build(1)).is_ok());
    }

    #[test]
    fn connect_rejects_future_version() {
        let fpdu = Fpdu::new(FpduType::Connect)
            .with_param(PiValue::text(Pi::Requester, "X"))
            .with_param(PiValue::num(Pi::Version, 9));
        assert_eq!(
            validate_connect(&fpdu).unwrap_err().diag,
            Diag::UNSUPPORTED_VERSION
        );
    }

    #[test]
    fn create_fixed_format_needs_record_length() {
        let ok = CreateBuilder::new()
            .fixed_format()
            .record_length(80)
            .build(1)
            .unwrap();
        assert!(validate_create(&ok).is_ok());

        let bad = CreateBuilder::new()
            .fixed_format()
            .record_length(0)
            .build(1)
            .unwrap();
        assert_eq!(
            validate_create(&bad).unwrap_err().diag,
            Diag::MISSING_PARAMETER
        );
    }

    #[test]
    fn syn_must_increase() {
        let mut t = transfer();
        t.current_sync_point = 2;
        let stale = Fpdu::new(FpduType::Syn).with_param(PiValue::num(Pi::SyncNumber, 2));
        assert_eq!(
            validate_syn(&stale, &t).unwrap_err().diag,
            Diag::SYNC_NEGOTIATION_FAILED
        );
        let fresh = Fpdu::new(FpduType::Syn).with_param(PiValue::num(Pi::SyncNumber, 3));
        assert_eq!(validate_syn(&fresh, &t).unwrap(), 3);
    }

    #[test]
    fn dtf_respects_entity_size() {
        let t = transfer();
        assert!(validate_dtf(&[0u8; 100], &t).is_ok());
        assert_eq!(
            validate_dtf(&[0u8; 101], &t).unwrap_err().diag,
            Diag::ARTICLE_TOO_LONG
        );
    }

    #[test]
    fn dtf_record_length_only_binds_fixed_format() {
        let mut t = transfer();
        t.record_length = 10;
        t.record_format = ARTICLE_FORMAT_VARIABLE as u8;
        assert!(validate_dtf(&[0u8; 50], &t).is_ok());
        t.record_format = ARTICLE_FORMAT_FIXED as u8;
        assert_eq!(
            validate_dtf(&[0u8; 50], &t).unwrap_err().diag,
            Diag::ARTICLE_TOO_LONG
        );
    }

    #[test]
    fn trans_end_checks_declared_totals() {
        let mut t = transfer();
        t.append(b"0123456789");
        let ok = Fpdu::new(FpduType::TransEnd).with_param(PiValue::num(Pi::ByteCount, 10));
        assert!(validate_trans_end(&ok, &t).is_ok());
        let bad = Fpdu::new(FpduType::TransEnd).with_param(PiValue::num(Pi::ByteCount, 11));
        assert_eq!(
            validate_trans_end(&bad, &t).unwrap_err().diag,
            Diag::COUNT_MISMATCH
        );
        let bad_articles =
            Fpdu::new(FpduType::TransEnd).with_param(PiValue::num(Pi::ArticleCount, 5));
        assert_eq!(
            validate_trans_end(&bad_articles, &t).unwrap_err().diag,
            Diag::COUNT_MISMATCH
        );
    }

    #[test]
    fn announced_size_bounds_file() {
        assert!(validate_file_size(1024, 1).is_ok());
        assert_eq!(
            validate_file_size(1025, 1).unwrap_err().diag,
            Diag::SIZE_EXCEEDED
        );
        assert!(validate_file_size(u64::MAX / 2048, 0).is_ok());
    }
}
