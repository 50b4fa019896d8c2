//! Diagnostic codes carried in PI 02: a 3-byte wire value `[family][reason:u16 BE]`
//! where all-zero means success. Both sides understand a non-zero code without
//! renegotiation, so unknown codes pass through losslessly.

use std::fmt;

/// A 3-byte diagnostic code: severity family plus reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Diag {
    pub family: u8,
    pub reason: u16,
}

impl Diag {
    pub const SUCCESS: Diag = Diag::new(0, 0);

    // Family 1: transmission.
    pub const TRANSMISSION_ERROR: Diag = Diag::new(1, 100);

    // Family 2: file level.
    pub const FILE_EXISTS: Diag = Diag::new(2, 204);
    pub const NO_SUCH_FILE: Diag = Diag::new(2, 205);
    pub const FILE_BUSY: Diag = Diag::new(2, 207);
    pub const OPEN_FAILED: Diag = Diag::new(2, 211);
    pub const BLOCKING_IO_ERROR: Diag = Diag::new(2, 213);
    pub const RESTART_NEGOTIATION_FAILED: Diag = Diag::new(2, 214);
    pub const VOLUNTARY_ABORT: Diag = Diag::new(2, 216);
    pub const RESYNC_IMPOSSIBLE: Diag = Diag::new(2, 218);
    pub const ARTICLE_TOO_LONG: Diag = Diag::new(2, 220);
    pub const ABNORMAL_END: Diag = Diag::new(2, 223);
    pub const SIZE_EXCEEDED: Diag = Diag::new(2, 224);
    pub const TRANSFER_REFUSED: Diag = Diag::new(2, 226);

    // Family 3: session level.
    pub const UNKNOWN_IDENTIFICATION: Diag = Diag::new(3, 301);
    pub const UNAUTHORIZED_REQUESTER: Diag = Diag::new(3, 304);
    pub const SYNC_NEGOTIATION_FAILED: Diag = Diag::new(3, 307);
    pub const UNSUPPORTED_VERSION: Diag = Diag::new(3, 308);
    pub const NETWORK_INCIDENT: Diag = Diag::new(3, 310);
    pub const PROTOCOL_ERROR: Diag = Diag::new(3, 311);
    pub const IDLE_DISCONNECT: Diag = Diag::new(3, 313);
    pub const TIMER_EXPIRED: Diag = Diag::new(3, 317);
    pub const MISSING_PARAMETER: Diag = Diag::new(3, 318);
    pub const COUNT_MISMATCH: Diag = Diag::new(3, 319);
    pub const TOO_MANY_RESYNCS: Diag = Diag::new(3, 320);

    pub const fn new(family: u8, reason: u16) -> Self {
        Diag { family, reason }
    }

    pub fn is_success(&self) -> bool {
        self.family == 0 && self.reason == 0
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [
            self.family,
            (self.reason >> 8) as u8,
            (self.reason & 0xFF) as u8,
        ]
    }

    /// Decode from at least 3 bytes of PI 02 content.
    pub fn from_bytes(bytes: &[u8]) -> Option<Diag> {
        if bytes.len() < 3 {
            return None;
        }
        Some(Diag {
            family: bytes[0],
            reason: u16::from_be_bytes([bytes[1], bytes[2]]),
        })
    }

    /// Operator-facing message for the known registry; unknown codes keep
    /// their numeric rendering via `Display`.
    pub fn message(&self) -> &'static str {
        match (self.family, self.reason) {
            (0, 0) => "success",
            (1, 100) => "transmission error",
            (2, 200) => "insufficient file characteristics",
            (2, 201) => "system resources temporarily insufficient",
            (2, 202) => "user resources temporarily insufficient",
            (2, 203) => "transfer not prioritary",
            (2, 204) => "file already exists",
            (2, 205) => "no such file",
            (2, 206) => "receiving the file would exceed the disk quota",
            (2, 207) => "file busy",
            (2, 208) => "file not old enough",
            (2, 209) => "message type not accepted by the referenced installation",
            (2, 210) => "presentation context negotiation failed",
            (2, 211) => "cannot open file",
            (2, 212) => "cannot close file normally",
            (2, 213) => "blocking input/output error",
            (2, 214) => "restart point negotiation failed",
            (2, 215) => "system-specific error",
            (2, 216) => "voluntary premature stop",
            (2, 217) => "too many unacknowledged sync points",
            (2, 218) => "resynchronization impossible",
            (2, 219) => "file space exhausted",
            (2, 220) => "article longer than announced",
            (2, 221) => "end-of-transmission deadline expired",
            (2, 222) => "too much data without a sync point",
            (2, 223) => "abnormal end of transfer",
            (2, 224) => "transmitted file larger than announced",
            (2, 225) => "station congestion, file received but not delivered",
            (2, 226) => "transfer refused",
            (2, 299) => "other file-level error",
            (3, 300) => "local communication system congestion",
            (3, 301) => "requested identification unknown",
            (3, 302) => "request not attached to a service access point",
            (3, 303) => "remote communication system congestion",
            (3, 304) => "requester identification not authorized",
            (3, 305) => "negotiation failed: SELECT",
            (3, 306) => "negotiation failed: RESYN",
            (3, 307) => "negotiation failed: SYNC",
            (3, 308) => "version number not supported",
            (3, 309) => "too many connections in progress",
            (3, 310) => "network incident",
            (3, 311) => "remote protocol error",
            (3, 312) => "service closing requested by the user",
            (3, 313) => "connection dropped at end of inactivity interval",
            (3, 314) => "idle connection dropped to admit a new one",
            (3, 315) => "negotiation failed",
            (3, 316) => "connection dropped by administrative command",
            (3, 317) => "timer expired",
            (3, 318) => "mandatory parameter absent or illicit content",
            (3, 319) => "incorrect byte or article count",
            (3, 320) => "excessive resynchronizations for one transfer",
            (3, 321) => "call the backup number",
            (3, 322) => "call back later",
            (3, 399) => "other session-level error",
            _ => "unrecognized diagnostic",
        }
    }
}

impl fmt::Display for Diag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "D{}-{:03} ({})",
            self.family,
            self.reason,
            self.message()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let d = Diag::MISSING_PARAMETER;
        let bytes = d.to_bytes();
        assert_eq!(bytes, [3, 0x01, 0x3E]);
        assert_eq!(Diag::from_bytes(&bytes), Some(d));
    }

    #[test]
    fn success_is_all_zero() {
        assert_eq!(Diag::SUCCESS.to_bytes(), [0, 0, 0]);
        assert!(Diag::SUCCESS.is_success());
        assert!(!Diag::PROTOCOL_ERROR.is_success());
    }

    #[test]
    fn unknown_code_passes_through() {
        let raw = [9u8, 0x12, 0x34];
        let d = Diag::from_bytes(&raw).unwrap();
        assert_eq!(d.family, 9);
        assert_eq!(d.reason, 0x1234);
        assert_eq!(d.to_bytes(), raw);
        assert_eq!(d.message(), "unrecognized diagnostic");
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(Diag::from_bytes(&[0, 0]), None);
    }

    #[test]
    fn display_includes_code_and_message() {
        let s = Diag::NO_SUCH_FILE.to_string();
        assert!(s.contains("D2-205"));
        assert!(s.contains("no such file"));
    }
}
