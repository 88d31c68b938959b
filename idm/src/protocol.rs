// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire layer of the inter-domain messaging (IDM) protocol.
//!
//! Every message is a fixed 32-byte header followed by a variable payload.
//! Structs here are packed and little-endian on the wire; both zones of a
//! connection run on the same little-endian host, so field access is plain.
//! Inline-data payloads (COPY_H2D requests, OK responses carrying read-back
//! bytes) lay the struct first and the raw bytes immediately after it.

#![allow(non_camel_case_types)]

use std::mem::size_of;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::ring::SLOT_SIZE;

/// Protocol magic, ASCII "IDM\0".
pub const IDM_MAGIC: u32 = 0x4944_4D00;

pub const IDM_VERSION_MAJOR: u16 = 1;
pub const IDM_VERSION_MINOR: u16 = 0;
/// Current protocol version, major in the high byte.
pub const IDM_VERSION: u16 = (IDM_VERSION_MAJOR << 8) | IDM_VERSION_MINOR;

/* request kinds */
pub const IDM_ALLOC: u16 = 0x01;
pub const IDM_FREE: u16 = 0x02;
pub const IDM_COPY_H2D: u16 = 0x10;
pub const IDM_COPY_D2H: u16 = 0x11;
pub const IDM_COPY_D2D: u16 = 0x12;
pub const IDM_MEMSET: u16 = 0x13;
pub const IDM_SYNC: u16 = 0x21;
pub const IDM_GET_INFO: u16 = 0x30;

/* response kinds */
pub const IDM_RESPONSE_OK: u16 = 0xF0;
pub const IDM_RESPONSE_ERROR: u16 = 0xF1;

/* GET_INFO selectors */
pub const INFO_DEVICE_COUNT: u32 = 0;
pub const INFO_TOTAL_MEMORY: u32 = 1;
pub const INFO_DEVICE_NAME: u32 = 2;

/// Size of the framed header on the wire.
pub const HEADER_SIZE: usize = size_of::<idm_header>();

/// Largest payload a single ring slot can carry.
pub const MAX_PAYLOAD: usize = SLOT_SIZE - HEADER_SIZE;

/// Fixed length of the message field in ERROR responses.
pub const ERROR_MSG_LEN: usize = 64;

#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_header {
    pub magic: u32,
    pub version: u16,
    pub kind: u16,
    pub src_zone: u32,
    pub dst_zone: u32,
    pub seq_num: u64,
    pub payload_len: u32,
    /// Must be zero on send; ignored on receive.
    pub reserved: u32,
}

impl idm_header {
    /// A header is valid iff the magic and version match and the payload
    /// fits in one ring slot.
    pub fn is_valid(&self) -> bool {
        let payload_len = self.payload_len;
        self.magic == IDM_MAGIC && self.version == IDM_VERSION && payload_len as usize <= MAX_PAYLOAD
    }
}

/* IDM_ALLOC */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_alloc {
    pub size: u64,
    pub flags: u32,
    pub reserved: u32,
}

/* IDM_FREE */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_free {
    pub handle: u64,
}

/* IDM_COPY_H2D; `size` bytes of host data follow immediately */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_copy_h2d {
    pub dst_handle: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/* IDM_COPY_D2H; the OK response carries `size` bytes inline */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_copy_d2h {
    pub src_handle: u64,
    pub src_offset: u64,
    pub size: u64,
}

/* IDM_COPY_D2D */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_copy_d2d {
    pub dst_handle: u64,
    pub src_handle: u64,
    pub dst_offset: u64,
    pub src_offset: u64,
    pub size: u64,
}

/* IDM_MEMSET; `value` repeats its low byte across the range */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_memset {
    pub handle: u64,
    pub offset: u64,
    pub value: u32,
    pub reserved: u32,
    pub size: u64,
}

/* IDM_SYNC */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_sync {
    pub flags: u32,
    pub reserved: u32,
}

/* IDM_GET_INFO */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_get_info {
    pub selector: u32,
    pub reserved: u32,
}

/* IDM_RESPONSE_OK; `data_len` bytes follow immediately */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_response_ok {
    pub request_seq: u64,
    pub result_handle: u64,
    pub result_value: u32,
    pub data_len: u32,
}

/* IDM_RESPONSE_ERROR */
#[derive(Copy, Clone, Debug, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct idm_response_error {
    pub request_seq: u64,
    pub error_code: u32,
    pub driver_error: u32,
    pub message: [u8; ERROR_MSG_LEN],
}

impl Default for idm_response_error {
    fn default() -> Self {
        idm_response_error {
            request_seq: 0,
            error_code: 0,
            driver_error: 0,
            message: [0; ERROR_MSG_LEN],
        }
    }
}

impl idm_response_error {
    /// Copies `msg` into the fixed message field, truncating and leaving the
    /// remainder NUL-filled.
    pub fn set_message(&mut self, msg: &str) {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(ERROR_MSG_LEN);
        self.message[..len].copy_from_slice(&bytes[..len]);
        for b in &mut self.message[len..] {
            *b = 0;
        }
    }

    /// Returns the message up to the first NUL, lossily decoded.
    pub fn message_str(&self) -> String {
        let end = self
            .message
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ERROR_MSG_LEN);
        String::from_utf8_lossy(&self.message[..end]).into_owned()
    }
}

/// Error taxonomy carried in ERROR responses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    /// Success sentinel; never carried in an ERROR frame.
    None = 0,
    /// Framing, version, or payload-length violation.
    InvalidFrame = 1,
    /// Handle absent, or present but not owned by the requester.
    InvalidHandle = 2,
    /// Reserved; ownership violations map to `InvalidHandle` instead.
    PermissionDenied = 3,
    /// Broker-local or device-side allocation failure.
    OutOfMemory = 4,
    /// Bounds or size-arithmetic violation.
    InvalidSize = 5,
    /// Transport-level wait exceeded.
    TimedOut = 6,
    /// Transport closed or unusable.
    ConnectionLost = 7,
    /// The device driver returned an error; its native code rides along.
    DeviceError = 8,
    /// Catch-all.
    Unknown = 99,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> ErrorKind {
        match code {
            0 => ErrorKind::None,
            1 => ErrorKind::InvalidFrame,
            2 => ErrorKind::InvalidHandle,
            3 => ErrorKind::PermissionDenied,
            4 => ErrorKind::OutOfMemory,
            5 => ErrorKind::InvalidSize,
            6 => ErrorKind::TimedOut,
            7 => ErrorKind::ConnectionLost,
            8 => ErrorKind::DeviceError,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Message kind to string, for logging.
pub fn kind_name(kind: u16) -> &'static str {
    match kind {
        IDM_ALLOC => "ALLOC",
        IDM_FREE => "FREE",
        IDM_COPY_H2D => "COPY_H2D",
        IDM_COPY_D2H => "COPY_D2H",
        IDM_COPY_D2D => "COPY_D2D",
        IDM_MEMSET => "MEMSET",
        IDM_SYNC => "SYNC",
        IDM_GET_INFO => "GET_INFO",
        IDM_RESPONSE_OK => "OK",
        IDM_RESPONSE_ERROR => "ERROR",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(size_of::<idm_alloc>(), 16);
        assert_eq!(size_of::<idm_copy_h2d>(), 24);
        assert_eq!(size_of::<idm_copy_d2d>(), 40);
        assert_eq!(size_of::<idm_memset>(), 32);
        assert_eq!(size_of::<idm_response_ok>(), 24);
        assert_eq!(size_of::<idm_response_error>(), 16 + ERROR_MSG_LEN);
    }

    #[test]
    fn header_validation() {
        let mut hdr = idm_header {
            magic: IDM_MAGIC,
            version: IDM_VERSION,
            kind: IDM_SYNC,
            src_zone: 2,
            dst_zone: 1,
            seq_num: 1,
            payload_len: 8,
            reserved: 0,
        };
        assert!(hdr.is_valid());

        hdr.magic = 0xdead_beef;
        assert!(!hdr.is_valid());
        hdr.magic = IDM_MAGIC;

        hdr.version = IDM_VERSION + 1;
        assert!(!hdr.is_valid());
        hdr.version = IDM_VERSION;

        hdr.payload_len = (MAX_PAYLOAD + 1) as u32;
        assert!(!hdr.is_valid());
    }

    #[test]
    fn error_kind_codes() {
        for kind in [
            ErrorKind::None,
            ErrorKind::InvalidFrame,
            ErrorKind::InvalidHandle,
            ErrorKind::PermissionDenied,
            ErrorKind::OutOfMemory,
            ErrorKind::InvalidSize,
            ErrorKind::TimedOut,
            ErrorKind::ConnectionLost,
            ErrorKind::DeviceError,
            ErrorKind::Unknown,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
        // Unassigned codes decode to the catch-all.
        assert_eq!(ErrorKind::from_code(42), ErrorKind::Unknown);
    }

    #[test]
    fn error_message_truncation() {
        let mut err = idm_response_error::default();
        err.set_message("short");
        assert_eq!(err.message_str(), "short");

        let long = "x".repeat(ERROR_MSG_LEN * 2);
        err.set_message(&long);
        assert_eq!(err.message_str().len(), ERROR_MSG_LEN);
    }
}
