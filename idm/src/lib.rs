// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Inter-domain messaging (IDM) for the vgpu broker.
//!
//! IDM carries framed, sequenced request/response messages between a tenant
//! zone and the trusted broker zone over a pair of single-producer
//! single-consumer rings in shared memory, with a semaphore-style notifier
//! per receiving side. The transport backend is abstracted so the same
//! connection logic runs over hypervisor-shared pages or the development
//! backend implemented here.

use std::fmt;
use std::io;

use remain::sorted;
use thiserror::Error;

pub mod message;
pub mod protocol;
pub mod ring;
pub mod sys;
pub mod transport;

pub use message::Frame;
pub use message::Request;
pub use message::Response;
pub use protocol::ErrorKind;
pub use transport::Backend;
pub use transport::Connection;
pub use transport::DevBackend;
pub use transport::Notify;
pub use transport::Role;

/// An errno value captured from a failed libc call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Errno(i32);

impl Errno {
    pub fn new(errno: i32) -> Errno {
        Errno(errno)
    }

    /// Captures the calling thread's current errno.
    pub fn last() -> Errno {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    }

    pub fn errno(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        io::Error::from_raw_os_error(self.0).fmt(f)
    }
}

#[sorted]
#[derive(Error, Debug)]
pub enum IdmError {
    /// A frame failed magic, version, or payload-length validation.
    #[error("invalid frame")]
    InvalidFrame,
    /// The connection was closed.
    #[error("not connected")]
    NotConnected,
    /// A payload exceeds what one ring slot can carry.
    #[error("payload of {0} bytes exceeds slot capacity")]
    PayloadTooLarge(usize),
    /// The transmit ring is full; the receiver is not draining it.
    #[error("ring full")]
    RingFull,
    /// An OS-level operation failed after the transport was up.
    #[error("transport system error: {0}")]
    SysError(Errno),
    /// No message arrived within the requested wait.
    #[error("timed out")]
    TimedOut,
    /// The transport backend could not be brought up.
    #[error("transport init failed: {0}")]
    TransportInit(Errno),
}

pub type Result<T> = std::result::Result<T, IdmError>;

impl IdmError {
    /// The wire error kind a transport failure maps to when it must be
    /// reported across the boundary.
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            IdmError::InvalidFrame => ErrorKind::InvalidFrame,
            IdmError::NotConnected => ErrorKind::ConnectionLost,
            IdmError::PayloadTooLarge(_) => ErrorKind::InvalidSize,
            IdmError::RingFull => ErrorKind::ConnectionLost,
            IdmError::SysError(_) => ErrorKind::ConnectionLost,
            IdmError::TimedOut => ErrorKind::TimedOut,
            IdmError::TransportInit(_) => ErrorKind::ConnectionLost,
        }
    }
}
