//! FPDU parsing: one transport entity in, a sequence of logical frames out.
//!
//! The first two bytes discriminate the entity shape. If they equal the
//! entity length, the entity is a single FPDU. If they describe a shorter
//! sub-frame, the entity is a back-to-back concatenation of sub-frames, each
//! with its own 2-byte length; consecutive DTF-family sub-frames are merged
//! into one logical frame by appending their payloads.

use tracing::{debug, warn};

use crate::error::CodecError;
use crate::fpdu::{Fpdu, FpduType, FPDU_HEADER_LEN};
use crate::param::{decode_param, Param};

/// Parse one transport entity into its logical frames.
///
/// In the single-frame path any unknown parameter id aborts the whole frame.
/// In the concatenated path a malformed trailing sub-frame is logged and
/// dropped instead, keeping the frames parsed so far.
pub fn parse_entity(data: &[u8]) -> Result<Vec<Fpdu>, CodecError> {
    if data.len() < FPDU_HEADER_LEN {
        return Err(CodecError::MalformedFrame {
            declared: 0,
            actual: data.len(),
        });
    }
    let first = u16::from_be_bytes([data[0], data[1]]) as usize;
    if first == data.len() {
        Ok(vec![parse_single(data)?])
    } else if (FPDU_HEADER_LEN..data.len()).contains(&first) {
        debug!(
            first_len = first,
            entity_len = data.len(),
            "concatenated entity"
        );
        parse_concatenated(data)
    } else {
        Err(CodecError::MalformedFrame {
            declared: first,
            actual: data.len(),
        })
    }
}

/// Parse exactly one frame whose length prefix covers the whole buffer.
fn parse_single(data: &[u8]) -> Result<Fpdu, CodecError> {
    let (phase, ty) = (data[2], data[3]);
    let kind = FpduType::from_wire(phase, ty).ok_or(CodecError::UnknownFpdu { phase, ty })?;
    let (id_dst, id_src) = (data[4], data[5]);
    let body = &data[FPDU_HEADER_LEN..];

    if kind.is_dtf() {
        return Ok(Fpdu::from_parts(
            kind,
            id_dst,
            id_src,
            Vec::new(),
            body.to_vec(),
        ));
    }

    let mut params: Vec<Param> = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let (param, consumed) = decode_param(rest)?;
        params.push(param);
        rest = &rest[consumed..];
    }
    Ok(Fpdu::from_parts(kind, id_dst, id_src, params, Vec::new()))
}

fn parse_concatenated(data: &[u8]) -> Result<Vec<Fpdu>, CodecError> {
    let mut frames = Vec::new();
    let mut pending_dtf: Option<Fpdu> = None;
    let mut rest = data;

    while rest.len() >= FPDU_HEADER_LEN {
        let sub_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if sub_len < FPDU_HEADER_LEN || sub_len > rest.len() {
            warn!(
                sub_len,
                remaining = rest.len(),
                "invalid sub-frame length, dropping trailing bytes"
            );
            break;
        }
        let (phase, ty) = (rest[2], rest[3]);
        let Some(kind) = FpduType::from_wire(phase, ty) else {
            warn!(phase, ty, "unknown sub-frame type, dropping trailing bytes");
            break;
        };
        let (id_dst, id_src) = (rest[4], rest[5]);
        let payload = &rest[FPDU_HEADER_LEN..sub_len];

        if kind.is_dtf() {
            match &mut pending_dtf {
                Some(dtf) => dtf.append_data(payload),
                None => {
                    pending_dtf = Some(Fpdu::from_parts(
                        kind,
                        id_dst,
                        id_src,
                        Vec::new(),
                        payload.to_vec(),
                    ));
                }
            }
        } else {
            if let Some(dtf) = pending_dtf.take() {
                frames.push(dtf);
            }
            let mut params: Vec<Param> = Vec::new();
            let mut body = payload;
            while !body.is_empty() {
                let (param, consumed) = decode_param(body)?;
                params.push(param);
                body = &body[consumed..];
            }
            frames.push(Fpdu::from_parts(kind, id_dst, id_src, params, Vec::new()));
        }
        rest = &rest[sub_len..];
    }

    if let Some(dtf) = pending_dtf.take() {
        frames.push(dtf);
    }
    Ok(frames)
}
