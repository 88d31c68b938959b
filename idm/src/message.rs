// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed views over framed IDM messages.
//!
//! A [`Frame`] owns one header-plus-payload message as it travels through a
//! ring. [`Request`] and [`Response`] are the typed forms: parsing matches on
//! the header kind and validates that the payload length is consistent with
//! the kind's struct, encoding lays the struct (and any inline data) back
//! out and fills the header.

use std::mem::size_of;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::protocol::*;
use crate::IdmError;
use crate::Result;

/// One framed message: header plus owned payload bytes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub header: idm_header,
    payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame for `kind` with the given routing fields; the header's
    /// payload length is derived from `payload`.
    pub fn new(kind: u16, src_zone: u32, dst_zone: u32, seq_num: u64, payload: Vec<u8>) -> Frame {
        Frame {
            header: idm_header {
                magic: IDM_MAGIC,
                version: IDM_VERSION,
                kind,
                src_zone,
                dst_zone,
                seq_num,
                payload_len: payload.len() as u32,
                reserved: 0,
            },
            payload,
        }
    }

    pub fn kind(&self) -> u16 {
        self.header.kind
    }

    pub fn src_zone(&self) -> u32 {
        self.header.src_zone
    }

    pub fn dst_zone(&self) -> u32 {
        self.header.dst_zone
    }

    pub fn seq_num(&self) -> u64 {
        self.header.seq_num
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total framed size on the wire.
    pub fn byte_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Checks the framing invariants and that the header's payload length
    /// matches the payload actually attached.
    pub fn validate(&self) -> Result<()> {
        let payload_len = self.header.payload_len;
        if !self.header.is_valid() || payload_len as usize != self.payload.len() {
            return Err(IdmError::InvalidFrame);
        }
        Ok(())
    }

    /// Serializes the frame for a ring slot.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_len());
        bytes.extend_from_slice(self.header.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Reconstructs a frame from ring-slot bytes, validating the header and
    /// that the buffer covers the advertised payload.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let header = idm_header::read_from_prefix(bytes).ok_or(IdmError::InvalidFrame)?;
        if !header.is_valid() {
            return Err(IdmError::InvalidFrame);
        }
        let payload_len = header.payload_len as usize;
        let end = HEADER_SIZE + payload_len;
        if bytes.len() < end {
            return Err(IdmError::InvalidFrame);
        }
        Ok(Frame {
            header,
            payload: bytes[HEADER_SIZE..end].to_vec(),
        })
    }
}

/// A parsed tenant request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Alloc {
        size: u64,
        flags: u32,
    },
    Free {
        handle: u64,
    },
    CopyH2d {
        dst_handle: u64,
        dst_offset: u64,
        size: u64,
        data: Vec<u8>,
    },
    CopyD2h {
        src_handle: u64,
        src_offset: u64,
        size: u64,
    },
    CopyD2d {
        dst_handle: u64,
        dst_offset: u64,
        src_handle: u64,
        src_offset: u64,
        size: u64,
    },
    Memset {
        handle: u64,
        offset: u64,
        value: u8,
        size: u64,
    },
    Sync {
        flags: u32,
    },
    GetInfo {
        selector: u32,
    },
}

/// True for kinds the broker serves.
pub fn is_request_kind(kind: u16) -> bool {
    matches!(
        kind,
        IDM_ALLOC
            | IDM_FREE
            | IDM_COPY_H2D
            | IDM_COPY_D2H
            | IDM_COPY_D2D
            | IDM_MEMSET
            | IDM_SYNC
            | IDM_GET_INFO
    )
}

// Reads a fixed-layout payload, requiring the payload to be exactly the
// struct.
fn read_exact_payload<T: FromBytes>(payload: &[u8]) -> Result<T> {
    if payload.len() != size_of::<T>() {
        return Err(IdmError::InvalidFrame);
    }
    T::read_from_prefix(payload).ok_or(IdmError::InvalidFrame)
}

impl Request {
    pub fn kind(&self) -> u16 {
        match self {
            Request::Alloc { .. } => IDM_ALLOC,
            Request::Free { .. } => IDM_FREE,
            Request::CopyH2d { .. } => IDM_COPY_H2D,
            Request::CopyD2h { .. } => IDM_COPY_D2H,
            Request::CopyD2d { .. } => IDM_COPY_D2D,
            Request::Memset { .. } => IDM_MEMSET,
            Request::Sync { .. } => IDM_SYNC,
            Request::GetInfo { .. } => IDM_GET_INFO,
        }
    }

    /// Parses the typed request out of a frame whose kind is a request kind.
    pub fn parse(frame: &Frame) -> Result<Request> {
        let payload = frame.payload();
        let req = match frame.kind() {
            IDM_ALLOC => {
                let cmd: idm_alloc = read_exact_payload(payload)?;
                Request::Alloc {
                    size: cmd.size,
                    flags: cmd.flags,
                }
            }
            IDM_FREE => {
                let cmd: idm_free = read_exact_payload(payload)?;
                Request::Free { handle: cmd.handle }
            }
            IDM_COPY_H2D => {
                if payload.len() < size_of::<idm_copy_h2d>() {
                    return Err(IdmError::InvalidFrame);
                }
                let cmd = idm_copy_h2d::read_from_prefix(payload).ok_or(IdmError::InvalidFrame)?;
                Request::CopyH2d {
                    dst_handle: cmd.dst_handle,
                    dst_offset: cmd.dst_offset,
                    size: cmd.size,
                    data: payload[size_of::<idm_copy_h2d>()..].to_vec(),
                }
            }
            IDM_COPY_D2H => {
                let cmd: idm_copy_d2h = read_exact_payload(payload)?;
                Request::CopyD2h {
                    src_handle: cmd.src_handle,
                    src_offset: cmd.src_offset,
                    size: cmd.size,
                }
            }
            IDM_COPY_D2D => {
                let cmd: idm_copy_d2d = read_exact_payload(payload)?;
                Request::CopyD2d {
                    dst_handle: cmd.dst_handle,
                    dst_offset: cmd.dst_offset,
                    src_handle: cmd.src_handle,
                    src_offset: cmd.src_offset,
                    size: cmd.size,
                }
            }
            IDM_MEMSET => {
                let cmd: idm_memset = read_exact_payload(payload)?;
                Request::Memset {
                    handle: cmd.handle,
                    offset: cmd.offset,
                    value: cmd.value as u8,
                    size: cmd.size,
                }
            }
            IDM_SYNC => {
                let cmd: idm_sync = read_exact_payload(payload)?;
                Request::Sync { flags: cmd.flags }
            }
            IDM_GET_INFO => {
                let cmd: idm_get_info = read_exact_payload(payload)?;
                Request::GetInfo {
                    selector: cmd.selector,
                }
            }
            _ => return Err(IdmError::InvalidFrame),
        };
        Ok(req)
    }

    /// Encodes the request into a sendable frame.
    pub fn encode(&self, src_zone: u32, dst_zone: u32, seq_num: u64) -> Result<Frame> {
        let payload = match self {
            Request::Alloc { size, flags } => idm_alloc {
                size: *size,
                flags: *flags,
                reserved: 0,
            }
            .as_bytes()
            .to_vec(),
            Request::Free { handle } => idm_free { handle: *handle }.as_bytes().to_vec(),
            Request::CopyH2d {
                dst_handle,
                dst_offset,
                size,
                data,
            } => {
                let cmd = idm_copy_h2d {
                    dst_handle: *dst_handle,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                let mut payload = Vec::with_capacity(size_of::<idm_copy_h2d>() + data.len());
                payload.extend_from_slice(cmd.as_bytes());
                payload.extend_from_slice(data);
                payload
            }
            Request::CopyD2h {
                src_handle,
                src_offset,
                size,
            } => idm_copy_d2h {
                src_handle: *src_handle,
                src_offset: *src_offset,
                size: *size,
            }
            .as_bytes()
            .to_vec(),
            Request::CopyD2d {
                dst_handle,
                dst_offset,
                src_handle,
                src_offset,
                size,
            } => idm_copy_d2d {
                dst_handle: *dst_handle,
                src_handle: *src_handle,
                dst_offset: *dst_offset,
                src_offset: *src_offset,
                size: *size,
            }
            .as_bytes()
            .to_vec(),
            Request::Memset {
                handle,
                offset,
                value,
                size,
            } => idm_memset {
                handle: *handle,
                offset: *offset,
                value: *value as u32,
                reserved: 0,
                size: *size,
            }
            .as_bytes()
            .to_vec(),
            Request::Sync { flags } => idm_sync {
                flags: *flags,
                reserved: 0,
            }
            .as_bytes()
            .to_vec(),
            Request::GetInfo { selector } => idm_get_info {
                selector: *selector,
                reserved: 0,
            }
            .as_bytes()
            .to_vec(),
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(IdmError::PayloadTooLarge(payload.len()));
        }
        Ok(Frame::new(self.kind(), src_zone, dst_zone, seq_num, payload))
    }
}

/// A parsed broker response.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Ok {
        request_seq: u64,
        result_handle: u64,
        result_value: u32,
        data: Vec<u8>,
    },
    Error {
        request_seq: u64,
        kind: ErrorKind,
        driver_code: u32,
        message: String,
    },
}

impl Response {
    pub fn kind(&self) -> u16 {
        match self {
            Response::Ok { .. } => IDM_RESPONSE_OK,
            Response::Error { .. } => IDM_RESPONSE_ERROR,
        }
    }

    /// The sequence number of the request this response answers.
    pub fn request_seq(&self) -> u64 {
        match self {
            Response::Ok { request_seq, .. } => *request_seq,
            Response::Error { request_seq, .. } => *request_seq,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Response> {
        let payload = frame.payload();
        let resp = match frame.kind() {
            IDM_RESPONSE_OK => {
                if payload.len() < size_of::<idm_response_ok>() {
                    return Err(IdmError::InvalidFrame);
                }
                let ok = idm_response_ok::read_from_prefix(payload).ok_or(IdmError::InvalidFrame)?;
                let data_len = ok.data_len as usize;
                if payload.len() != size_of::<idm_response_ok>() + data_len {
                    return Err(IdmError::InvalidFrame);
                }
                Response::Ok {
                    request_seq: ok.request_seq,
                    result_handle: ok.result_handle,
                    result_value: ok.result_value,
                    data: payload[size_of::<idm_response_ok>()..].to_vec(),
                }
            }
            IDM_RESPONSE_ERROR => {
                let err: idm_response_error = read_exact_payload(payload)?;
                Response::Error {
                    request_seq: err.request_seq,
                    kind: ErrorKind::from_code(err.error_code),
                    driver_code: err.driver_error,
                    message: err.message_str(),
                }
            }
            _ => return Err(IdmError::InvalidFrame),
        };
        Ok(resp)
    }

    pub fn encode(&self, src_zone: u32, dst_zone: u32, seq_num: u64) -> Result<Frame> {
        let payload = match self {
            Response::Ok {
                request_seq,
                result_handle,
                result_value,
                data,
            } => {
                let ok = idm_response_ok {
                    request_seq: *request_seq,
                    result_handle: *result_handle,
                    result_value: *result_value,
                    data_len: data.len() as u32,
                };
                let mut payload = Vec::with_capacity(size_of::<idm_response_ok>() + data.len());
                payload.extend_from_slice(ok.as_bytes());
                payload.extend_from_slice(data);
                payload
            }
            Response::Error {
                request_seq,
                kind,
                driver_code,
                message,
            } => {
                let mut err = idm_response_error {
                    request_seq: *request_seq,
                    error_code: kind.code(),
                    driver_error: *driver_code,
                    ..Default::default()
                };
                err.set_message(message);
                err.as_bytes().to_vec()
            }
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(IdmError::PayloadTooLarge(payload.len()));
        }
        Ok(Frame::new(self.kind(), src_zone, dst_zone, seq_num, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: Request) -> Request {
        let frame = req.encode(2, 1, 7).unwrap();
        frame.validate().unwrap();
        let decoded = Frame::decode(&frame.to_bytes()).unwrap();
        assert_eq!(decoded.src_zone(), 2);
        assert_eq!(decoded.dst_zone(), 1);
        assert_eq!(decoded.seq_num(), 7);
        Request::parse(&decoded).unwrap()
    }

    #[test]
    fn alloc_roundtrip() {
        let req = Request::Alloc {
            size: 1024,
            flags: 0,
        };
        assert_eq!(roundtrip_request(req.clone()), req);
    }

    #[test]
    fn copy_h2d_carries_inline_data() {
        let req = Request::CopyH2d {
            dst_handle: 3,
            dst_offset: 16,
            size: 4,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        assert_eq!(roundtrip_request(req.clone()), req);
    }

    #[test]
    fn oversize_payload_rejected_at_encode() {
        let req = Request::CopyH2d {
            dst_handle: 1,
            dst_offset: 0,
            size: MAX_PAYLOAD as u64,
            data: vec![0; MAX_PAYLOAD],
        };
        assert!(matches!(
            req.encode(2, 1, 1),
            Err(IdmError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn truncated_payload_rejected_at_parse() {
        let req = Request::Memset {
            handle: 1,
            offset: 0,
            value: 0xaa,
            size: 32,
        };
        let frame = req.encode(2, 1, 1).unwrap();
        let mut bytes = frame.to_bytes();
        // Chop the payload but keep the header claiming the full length.
        bytes.truncate(bytes.len() - 8);
        assert!(matches!(Frame::decode(&bytes), Err(IdmError::InvalidFrame)));
    }

    #[test]
    fn wrong_kind_payload_rejected() {
        let frame = Request::Free { handle: 9 }.encode(2, 1, 1).unwrap();
        // Reinterpreting a FREE payload as ALLOC trips the length check.
        let mut relabeled = frame.clone();
        relabeled.header.kind = IDM_ALLOC;
        relabeled.header.payload_len = frame.payload().len() as u32;
        assert!(matches!(
            Request::parse(&relabeled),
            Err(IdmError::InvalidFrame)
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let frame = Request::Sync { flags: 0 }.encode(2, 1, 1).unwrap();
        let mut bytes = frame.to_bytes();
        bytes[0] ^= 0xff;
        assert!(matches!(Frame::decode(&bytes), Err(IdmError::InvalidFrame)));
    }

    #[test]
    fn ok_response_roundtrip() {
        let resp = Response::Ok {
            request_seq: 41,
            result_handle: 7,
            result_value: 1,
            data: vec![1, 2, 3],
        };
        let frame = resp.encode(1, 2, 99).unwrap();
        let parsed = Response::parse(&Frame::decode(&frame.to_bytes()).unwrap()).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn error_response_roundtrip() {
        let resp = Response::Error {
            request_seq: 41,
            kind: ErrorKind::InvalidHandle,
            driver_code: 0,
            message: "invalid handle".to_string(),
        };
        let frame = resp.encode(1, 2, 99).unwrap();
        let parsed = Response::parse(&Frame::decode(&frame.to_bytes()).unwrap()).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn ok_response_data_len_mismatch_rejected() {
        let resp = Response::Ok {
            request_seq: 1,
            result_handle: 0,
            result_value: 0,
            data: vec![0; 8],
        };
        let mut frame = resp.encode(1, 2, 1).unwrap();
        // Claim more inline data than the payload carries.
        let mut payload = frame.payload().to_vec();
        payload[20] = 0xff;
        frame = Frame::new(IDM_RESPONSE_OK, 1, 2, 1, payload);
        assert!(matches!(
            Response::parse(&frame),
            Err(IdmError::InvalidFrame)
        ));
    }
}
