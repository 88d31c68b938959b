// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tenant-zone client stub for the vgpu broker.
//!
//! Each call builds a typed request, sends it to the broker, and blocks
//! until the response carrying the request's sequence number arrives.
//! Responses for other sequence numbers encountered while waiting are
//! discarded; this stub assumes one in-flight request per connection, which
//! is the single-threaded interceptor model. The client only ever holds
//! opaque handles; broker-side addresses and layouts never reach it.

use idm::Backend;
use idm::Connection;
use idm::ErrorKind;
use idm::IdmError;
use idm::Request;
use idm::Response;
use idm::Role;
use log::debug;
use log::warn;
use remain::sorted;
use thiserror::Error;

pub use idm::protocol::INFO_DEVICE_COUNT;
pub use idm::protocol::INFO_DEVICE_NAME;
pub use idm::protocol::INFO_TOTAL_MEMORY;

// Receive attempts per call before the request is declared lost.
const RESPONSE_RETRIES: usize = 10;
const RECV_TIMEOUT_MS: i64 = 1000;

/// Opaque device-memory handle issued by the broker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuilds a handle from its raw value, e.g. one stored by the outer
    /// API layer.
    pub fn from_raw(raw: u64) -> Handle {
        Handle(raw)
    }
}

/// Broker metadata returned by [`VgpuClient::get_info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfoReply {
    pub value: u32,
    pub data: Vec<u8>,
}

#[sorted]
#[derive(Error, Debug)]
pub enum ClientError {
    /// The broker answered with an ERROR response.
    #[error("broker error {kind:?} (driver code {driver_code}): {message}")]
    Broker {
        kind: ErrorKind,
        driver_code: u32,
        message: String,
    },
    /// The receive attempts were exhausted without a matching response.
    #[error("timed out waiting for broker response")]
    TimedOut,
    /// The link to the broker failed.
    #[error("transport error: {0}")]
    Transport(IdmError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// The wire error kind this failure corresponds to; the outer API layer
    /// maps this to its own error codes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Broker { kind, .. } => *kind,
            ClientError::TimedOut => ErrorKind::TimedOut,
            ClientError::Transport(e) => e.wire_kind(),
        }
    }
}

impl From<IdmError> for ClientError {
    fn from(e: IdmError) -> ClientError {
        ClientError::Transport(e)
    }
}

// Successful-response fields, pre-interpretation.
struct OkReply {
    result_handle: u64,
    result_value: u32,
    data: Vec<u8>,
}

pub struct VgpuClient {
    conn: Connection,
}

impl VgpuClient {
    /// Opens the link to the broker in `broker_zone` as tenant
    /// `local_zone`.
    pub fn connect(
        backend: &mut dyn Backend,
        local_zone: u32,
        broker_zone: u32,
    ) -> Result<VgpuClient> {
        let conn = Connection::open(backend, local_zone, broker_zone, Role::Client)?;
        Ok(VgpuClient { conn })
    }

    pub fn zone(&self) -> u32 {
        self.conn.local_zone()
    }

    /// Allocates `size` bytes of device memory.
    pub fn alloc(&mut self, size: u64, flags: u32) -> Result<Handle> {
        let reply = self.roundtrip(&Request::Alloc { size, flags })?;
        Ok(Handle(reply.result_handle))
    }

    /// Releases `handle`. The handle is invalid afterwards regardless of
    /// the driver's disposition.
    pub fn free(&mut self, handle: Handle) -> Result<()> {
        self.roundtrip(&Request::Free { handle: handle.0 })?;
        Ok(())
    }

    /// Copies `data` into device memory at `offset` within `handle`.
    pub fn copy_h2d(&mut self, handle: Handle, offset: u64, data: &[u8]) -> Result<()> {
        self.roundtrip(&Request::CopyH2d {
            dst_handle: handle.0,
            dst_offset: offset,
            size: data.len() as u64,
            data: data.to_vec(),
        })?;
        Ok(())
    }

    /// Reads `size` bytes of device memory at `offset` within `handle`.
    pub fn copy_d2h(&mut self, handle: Handle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let reply = self.roundtrip(&Request::CopyD2h {
            src_handle: handle.0,
            src_offset: offset,
            size,
        })?;
        if reply.data.len() as u64 != size {
            return Err(ClientError::Transport(IdmError::InvalidFrame));
        }
        Ok(reply.data)
    }

    /// Device-to-device copy between two handles owned by this zone.
    pub fn copy_d2d(
        &mut self,
        dst: Handle,
        dst_offset: u64,
        src: Handle,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.roundtrip(&Request::CopyD2d {
            dst_handle: dst.0,
            dst_offset,
            src_handle: src.0,
            src_offset,
            size,
        })?;
        Ok(())
    }

    /// Fills `size` bytes at `offset` within `handle` with `value`.
    pub fn memset(&mut self, handle: Handle, offset: u64, value: u8, size: u64) -> Result<()> {
        self.roundtrip(&Request::Memset {
            handle: handle.0,
            offset,
            value,
            size,
        })?;
        Ok(())
    }

    /// Waits for all outstanding device work.
    pub fn sync(&mut self, flags: u32) -> Result<()> {
        self.roundtrip(&Request::Sync { flags })?;
        Ok(())
    }

    /// Queries broker-chosen device metadata.
    pub fn get_info(&mut self, selector: u32) -> Result<InfoReply> {
        let reply = self.roundtrip(&Request::GetInfo { selector })?;
        Ok(InfoReply {
            value: reply.result_value,
            data: reply.data,
        })
    }

    pub fn device_count(&mut self) -> Result<u32> {
        Ok(self.get_info(INFO_DEVICE_COUNT)?.value)
    }

    pub fn total_memory(&mut self) -> Result<u64> {
        let reply = self.get_info(INFO_TOTAL_MEMORY)?;
        let bytes: [u8; 8] = reply
            .data
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::Transport(IdmError::InvalidFrame))?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn device_name(&mut self) -> Result<String> {
        let reply = self.get_info(INFO_DEVICE_NAME)?;
        Ok(String::from_utf8_lossy(&reply.data).into_owned())
    }

    /// Tears down the link. In-flight messages are discarded.
    pub fn close(&mut self) {
        self.conn.close();
    }

    fn roundtrip(&mut self, request: &Request) -> Result<OkReply> {
        let seq = self.conn.next_seq();
        let frame = request.encode(self.conn.local_zone(), self.conn.remote_zone(), seq)?;
        self.conn.send(&frame)?;

        for _ in 0..RESPONSE_RETRIES {
            let frame = match self.conn.recv(RECV_TIMEOUT_MS) {
                Ok(frame) => frame,
                Err(IdmError::TimedOut) => continue,
                Err(e) => return Err(ClientError::Transport(e)),
            };

            let response = match Response::parse(&frame) {
                Ok(response) => response,
                Err(_) => {
                    warn!("discarding unparseable response frame");
                    continue;
                }
            };

            if response.request_seq() != seq {
                debug!(
                    "discarding response for stale sequence {} while awaiting {}",
                    response.request_seq(),
                    seq
                );
                continue;
            }

            return match response {
                Response::Ok {
                    result_handle,
                    result_value,
                    data,
                    ..
                } => Ok(OkReply {
                    result_handle,
                    result_value,
                    data,
                }),
                Response::Error {
                    kind,
                    driver_code,
                    message,
                    ..
                } => Err(ClientError::Broker {
                    kind,
                    driver_code,
                    message,
                }),
            };
        }

        Err(ClientError::TimedOut)
    }
}
