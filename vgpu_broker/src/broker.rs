// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Request dispatcher for the trusted zone.
//!
//! The broker owns the device context, the handle table, and its end of the
//! IDM link, and runs a single-threaded receive-dispatch-respond loop.
//! Each handler produces an [`Outcome`]; one emitter serializes it to an OK
//! or ERROR frame carrying the request's sequence number. Device calls are
//! synchronous, so requests from a tenant are served in arrival order.

use std::mem::size_of;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use idm::message::is_request_kind;
use idm::protocol::idm_response_ok;
use idm::protocol::kind_name;
use idm::protocol::INFO_DEVICE_COUNT;
use idm::protocol::INFO_DEVICE_NAME;
use idm::protocol::INFO_TOTAL_MEMORY;
use idm::protocol::MAX_PAYLOAD;
use idm::Connection;
use idm::ErrorKind;
use idm::Frame;
use idm::IdmError;
use idm::Request;
use idm::Response;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::device::DeviceError;
use crate::device::GpuDevice;
use crate::handle_table::HandleTable;

/// Receive timeout of the main loop; bounds shutdown latency.
pub const RECV_TIMEOUT_MS: i64 = 1000;

// Emit handle-table statistics every this many processed requests.
const STATS_INTERVAL: u64 = 100;

// Largest COPY_D2H read that still fits in a single OK response frame.
const MAX_INLINE_READ: u64 = (MAX_PAYLOAD - size_of::<idm_response_ok>()) as u64;

/// Result of one request, before serialization to the wire.
enum Outcome {
    Ok {
        result_handle: u64,
        result_value: u32,
        data: Vec<u8>,
    },
    Err {
        kind: ErrorKind,
        driver_code: u32,
        message: String,
    },
}

impl Outcome {
    fn ok() -> Outcome {
        Outcome::Ok {
            result_handle: 0,
            result_value: 0,
            data: Vec::new(),
        }
    }

    fn ok_handle(handle: u64) -> Outcome {
        Outcome::Ok {
            result_handle: handle,
            result_value: 0,
            data: Vec::new(),
        }
    }

    fn ok_value(value: u32) -> Outcome {
        Outcome::Ok {
            result_handle: 0,
            result_value: value,
            data: Vec::new(),
        }
    }

    fn ok_data(data: Vec<u8>) -> Outcome {
        Outcome::Ok {
            result_handle: 0,
            result_value: 0,
            data,
        }
    }

    fn err(kind: ErrorKind, message: &str) -> Outcome {
        Outcome::Err {
            kind,
            driver_code: 0,
            message: message.to_string(),
        }
    }

    fn device_err(err: DeviceError) -> Outcome {
        Outcome::Err {
            kind: ErrorKind::DeviceError,
            driver_code: err.code as u32,
            message: err.message,
        }
    }
}

// True iff [offset, offset + size) fits in [0, alloc_size) without the
// arithmetic overflowing.
fn range_ok(offset: u64, size: u64, alloc_size: u64) -> bool {
    offset
        .checked_add(size)
        .map_or(false, |end| end <= alloc_size)
}

pub struct Broker {
    conn: Connection,
    table: HandleTable,
    device: Box<dyn GpuDevice>,
    requests_handled: u64,
}

impl Broker {
    /// Probes the device and assembles the broker. The transport must
    /// already be open in the server role.
    pub fn new(conn: Connection, device: Box<dyn GpuDevice>) -> Result<Broker, DeviceError> {
        let count = device.device_count()?;
        if count == 0 {
            return Err(DeviceError::new(0, "no devices present"));
        }
        let name = device.device_name()?;
        info!("{} device(s), using device 0: {}", count, name);

        Ok(Broker {
            conn,
            table: HandleTable::new(),
            device,
            requests_handled: 0,
        })
    }

    /// Serves requests until `running` clears.
    ///
    /// Malformed tenant frames are dropped and the loop keeps serving; only
    /// local transport failures are fatal.
    pub fn run(&mut self, running: &AtomicBool) -> idm::Result<()> {
        info!(
            "serving tenant zone {} from trusted zone {}",
            self.conn.remote_zone(),
            self.conn.local_zone()
        );
        while running.load(Ordering::Acquire) {
            let frame = match self.conn.recv(RECV_TIMEOUT_MS) {
                Ok(frame) => frame,
                Err(IdmError::TimedOut) => continue,
                Err(IdmError::InvalidFrame) => {
                    warn!("dropping malformed frame from tenant ring");
                    continue;
                }
                Err(e) => {
                    error!("transport failed: {}", e);
                    return Err(e);
                }
            };
            self.process(frame)?;
        }
        Ok(())
    }

    fn process(&mut self, frame: Frame) -> idm::Result<()> {
        let src_zone = frame.src_zone();
        let request_seq = frame.seq_num();
        let kind = frame.kind();
        debug!("[{}] zone {} seq {}", kind_name(kind), src_zone, request_seq);

        let outcome = if !is_request_kind(kind) {
            warn!("zone {} sent unknown message kind {:#x}", src_zone, kind);
            Outcome::err(ErrorKind::Unknown, "unknown message kind")
        } else {
            match Request::parse(&frame) {
                Ok(request) => self.dispatch(src_zone, request),
                Err(_) => Outcome::err(ErrorKind::InvalidFrame, "malformed request payload"),
            }
        };

        self.respond(src_zone, request_seq, outcome)?;

        self.requests_handled += 1;
        if self.requests_handled % STATS_INTERVAL == 0 {
            self.log_stats();
        }
        Ok(())
    }

    fn dispatch(&mut self, src_zone: u32, request: Request) -> Outcome {
        match request {
            Request::Alloc { size, flags } => self.alloc(src_zone, size, flags),
            Request::Free { handle } => self.free(src_zone, handle),
            Request::CopyH2d {
                dst_handle,
                dst_offset,
                size,
                data,
            } => self.copy_h2d(src_zone, dst_handle, dst_offset, size, data),
            Request::CopyD2h {
                src_handle,
                src_offset,
                size,
            } => self.copy_d2h(src_zone, src_handle, src_offset, size),
            Request::CopyD2d {
                dst_handle,
                dst_offset,
                src_handle,
                src_offset,
                size,
            } => self.copy_d2d(src_zone, dst_handle, dst_offset, src_handle, src_offset, size),
            Request::Memset {
                handle,
                offset,
                value,
                size,
            } => self.memset(src_zone, handle, offset, value, size),
            Request::Sync { flags } => self.sync(flags),
            Request::GetInfo { selector } => self.get_info(selector),
        }
    }

    fn alloc(&mut self, src_zone: u32, size: u64, _flags: u32) -> Outcome {
        let ptr = match self.device.mem_alloc(size) {
            Ok(ptr) => ptr,
            Err(e) => return Outcome::device_err(e),
        };

        let handle = self.table.insert(src_zone, ptr, size);
        if handle == 0 {
            // The record was never created; do not leak the allocation.
            if let Err(e) = self.device.mem_free(ptr) {
                warn!("failed to release allocation after handle exhaustion: {}", e);
            }
            return Outcome::err(ErrorKind::OutOfMemory, "handle allocation failed");
        }

        debug!("zone {} allocated {} bytes as handle {:#x}", src_zone, size, handle);
        Outcome::ok_handle(handle)
    }

    fn free(&mut self, src_zone: u32, handle: u64) -> Outcome {
        let ptr = match self.table.remove(src_zone, handle) {
            Some(ptr) => ptr,
            None => return Outcome::err(ErrorKind::InvalidHandle, "invalid handle"),
        };

        // The record is already unlinked; a driver failure here must not
        // resurrect it.
        if let Err(e) = self.device.mem_free(ptr) {
            return Outcome::device_err(e);
        }
        Outcome::ok()
    }

    fn copy_h2d(
        &mut self,
        src_zone: u32,
        dst_handle: u64,
        dst_offset: u64,
        size: u64,
        data: Vec<u8>,
    ) -> Outcome {
        let (ptr, alloc_size) = match self.table.lookup(src_zone, dst_handle) {
            Some(record) => record,
            None => return Outcome::err(ErrorKind::InvalidHandle, "invalid handle"),
        };
        if !range_ok(dst_offset, size, alloc_size) {
            return Outcome::err(ErrorKind::InvalidSize, "copy out of bounds");
        }
        if data.len() as u64 != size {
            return Outcome::err(ErrorKind::InvalidFrame, "inline data length mismatch");
        }

        match self.device.copy_h2d(ptr, dst_offset, &data) {
            Ok(()) => Outcome::ok(),
            Err(e) => Outcome::device_err(e),
        }
    }

    fn copy_d2h(&mut self, src_zone: u32, src_handle: u64, src_offset: u64, size: u64) -> Outcome {
        let (ptr, alloc_size) = match self.table.lookup(src_zone, src_handle) {
            Some(record) => record,
            None => return Outcome::err(ErrorKind::InvalidHandle, "invalid handle"),
        };
        if !range_ok(src_offset, size, alloc_size) {
            return Outcome::err(ErrorKind::InvalidSize, "copy out of bounds");
        }
        if size > MAX_INLINE_READ {
            return Outcome::err(ErrorKind::InvalidSize, "read exceeds one response frame");
        }

        let mut buf = vec![0u8; size as usize];
        match self.device.copy_d2h(ptr, src_offset, &mut buf) {
            Ok(()) => Outcome::ok_data(buf),
            Err(e) => Outcome::device_err(e),
        }
    }

    fn copy_d2d(
        &mut self,
        src_zone: u32,
        dst_handle: u64,
        dst_offset: u64,
        src_handle: u64,
        src_offset: u64,
        size: u64,
    ) -> Outcome {
        // Both handles must belong to the requesting zone; a cross-zone
        // copy denies on whichever handle is foreign.
        let (dst_ptr, dst_size) = match self.table.lookup(src_zone, dst_handle) {
            Some(record) => record,
            None => return Outcome::err(ErrorKind::InvalidHandle, "invalid destination handle"),
        };
        let (src_ptr, src_size) = match self.table.lookup(src_zone, src_handle) {
            Some(record) => record,
            None => return Outcome::err(ErrorKind::InvalidHandle, "invalid source handle"),
        };
        if !range_ok(dst_offset, size, dst_size) || !range_ok(src_offset, size, src_size) {
            return Outcome::err(ErrorKind::InvalidSize, "copy out of bounds");
        }

        match self
            .device
            .copy_d2d(dst_ptr, dst_offset, src_ptr, src_offset, size)
        {
            Ok(()) => Outcome::ok(),
            Err(e) => Outcome::device_err(e),
        }
    }

    fn memset(&mut self, src_zone: u32, handle: u64, offset: u64, value: u8, size: u64) -> Outcome {
        let (ptr, alloc_size) = match self.table.lookup(src_zone, handle) {
            Some(record) => record,
            None => return Outcome::err(ErrorKind::InvalidHandle, "invalid handle"),
        };
        if !range_ok(offset, size, alloc_size) {
            return Outcome::err(ErrorKind::InvalidSize, "fill out of bounds");
        }

        match self.device.memset(ptr, offset, value, size) {
            Ok(()) => Outcome::ok(),
            Err(e) => Outcome::device_err(e),
        }
    }

    fn sync(&mut self, _flags: u32) -> Outcome {
        match self.device.synchronize() {
            Ok(()) => Outcome::ok(),
            Err(e) => Outcome::device_err(e),
        }
    }

    fn get_info(&mut self, selector: u32) -> Outcome {
        // Only broker-chosen metadata crosses the boundary here; nothing
        // derived from trusted-zone addresses.
        let result = match selector {
            INFO_DEVICE_COUNT => self.device.device_count().map(Outcome::ok_value),
            INFO_TOTAL_MEMORY => self
                .device
                .total_memory()
                .map(|total| Outcome::ok_data(total.to_le_bytes().to_vec())),
            INFO_DEVICE_NAME => self
                .device
                .device_name()
                .map(|name| Outcome::ok_data(name.into_bytes())),
            _ => return Outcome::err(ErrorKind::Unknown, "unknown info selector"),
        };
        result.unwrap_or_else(Outcome::device_err)
    }

    fn respond(&mut self, dst_zone: u32, request_seq: u64, outcome: Outcome) -> idm::Result<()> {
        let response = match outcome {
            Outcome::Ok {
                result_handle,
                result_value,
                data,
            } => Response::Ok {
                request_seq,
                result_handle,
                result_value,
                data,
            },
            Outcome::Err {
                kind,
                driver_code,
                message,
            } => {
                debug!(
                    "request seq {} failed: {:?} (driver code {}): {}",
                    request_seq, kind, driver_code, message
                );
                Response::Error {
                    request_seq,
                    kind,
                    driver_code,
                    message,
                }
            }
        };

        let seq = self.conn.next_seq();
        let frame = response.encode(self.conn.local_zone(), dst_zone, seq)?;
        match self.conn.send(&frame) {
            Ok(()) => Ok(()),
            Err(IdmError::RingFull) => {
                // The tenant stopped draining its ring; it will observe the
                // loss as a timeout.
                error!("response ring full, dropping response for seq {}", request_seq);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn log_stats(&self) {
        let stats = self.table.stats();
        info!(
            "stats: {} requests handled, {} live handles, {} bytes held",
            self.requests_handled, stats.handles, stats.bytes
        );
    }

    /// Releases every live handle's device allocation, then the device
    /// context and the transport, in reverse order of acquisition.
    pub fn shutdown(&mut self) {
        self.log_stats();
        for (handle, ptr, _size) in self.table.drain() {
            if let Err(e) = self.device.mem_free(ptr) {
                warn!("failed to release handle {:#x} at shutdown: {}", handle, e);
            }
        }
        self.conn.close();
        info!("broker shut down");
    }
}
