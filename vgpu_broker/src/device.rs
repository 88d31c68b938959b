// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device driver seam.
//!
//! The broker is written against [`GpuDevice`]; the real accelerator driver
//! is an external collaborator plugged in behind it. [`StubDevice`] backs
//! device memory with host allocations so the broker runs unmodified on
//! machines without an accelerator, which is also what every test uses.

use std::collections::HashMap;

use thiserror::Error;

/// Native driver code for an argument the device rejected.
pub const DEVICE_ERR_INVALID_VALUE: i32 = 1;
/// Native driver code for device memory exhaustion.
pub const DEVICE_ERR_OUT_OF_MEMORY: i32 = 2;

/// A failure reported by the device driver, carrying its native code so the
/// broker can pass it through in ERROR responses.
#[derive(Error, Debug)]
#[error("device error {code}: {message}")]
pub struct DeviceError {
    pub code: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: i32, message: &str) -> DeviceError {
        DeviceError {
            code,
            message: message.to_string(),
        }
    }
}

/// A device-side resource reference.
///
/// This value never leaves the trusted zone; tenants only ever see the
/// opaque handles the broker mints for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// The accelerator operations the broker needs.
pub trait GpuDevice: Send {
    fn device_count(&self) -> Result<u32, DeviceError>;
    fn device_name(&self) -> Result<String, DeviceError>;
    fn total_memory(&self) -> Result<u64, DeviceError>;

    fn mem_alloc(&mut self, size: u64) -> Result<DevicePtr, DeviceError>;
    fn mem_free(&mut self, ptr: DevicePtr) -> Result<(), DeviceError>;

    fn copy_h2d(&mut self, dst: DevicePtr, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    fn copy_d2h(&mut self, src: DevicePtr, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn copy_d2d(
        &mut self,
        dst: DevicePtr,
        dst_offset: u64,
        src: DevicePtr,
        src_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError>;
    fn memset(&mut self, ptr: DevicePtr, offset: u64, value: u8, size: u64)
        -> Result<(), DeviceError>;

    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

const STUB_TOTAL_MEMORY: u64 = 1 << 30;
const STUB_BASE_ADDR: u64 = 0x1000_0000;
const STUB_ALLOC_ALIGN: u64 = 256;

/// Host-memory device backend.
pub struct StubDevice {
    allocations: HashMap<u64, Box<[u8]>>,
    next_addr: u64,
    bytes_in_use: u64,
}

impl StubDevice {
    pub fn new() -> StubDevice {
        StubDevice {
            allocations: HashMap::new(),
            next_addr: STUB_BASE_ADDR,
            bytes_in_use: 0,
        }
    }

    fn allocation(&self, ptr: DevicePtr) -> Result<&[u8], DeviceError> {
        self.allocations
            .get(&ptr.0)
            .map(|alloc| alloc.as_ref())
            .ok_or_else(|| DeviceError::new(DEVICE_ERR_INVALID_VALUE, "unknown device pointer"))
    }

    fn range_mut(
        &mut self,
        ptr: DevicePtr,
        offset: u64,
        len: u64,
    ) -> Result<&mut [u8], DeviceError> {
        let alloc = self
            .allocations
            .get_mut(&ptr.0)
            .ok_or_else(|| DeviceError::new(DEVICE_ERR_INVALID_VALUE, "unknown device pointer"))?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= alloc.len() as u64)
            .ok_or_else(|| DeviceError::new(DEVICE_ERR_INVALID_VALUE, "access out of range"))?;
        Ok(&mut alloc[offset as usize..end as usize])
    }
}

impl Default for StubDevice {
    fn default() -> StubDevice {
        StubDevice::new()
    }
}

impl GpuDevice for StubDevice {
    fn device_count(&self) -> Result<u32, DeviceError> {
        Ok(1)
    }

    fn device_name(&self) -> Result<String, DeviceError> {
        Ok("Virtual GPU 0".to_string())
    }

    fn total_memory(&self) -> Result<u64, DeviceError> {
        Ok(STUB_TOTAL_MEMORY)
    }

    fn mem_alloc(&mut self, size: u64) -> Result<DevicePtr, DeviceError> {
        if size == 0 {
            return Err(DeviceError::new(DEVICE_ERR_INVALID_VALUE, "zero-size allocation"));
        }
        if self.bytes_in_use.saturating_add(size) > STUB_TOTAL_MEMORY {
            return Err(DeviceError::new(DEVICE_ERR_OUT_OF_MEMORY, "device memory exhausted"));
        }

        let addr = self.next_addr;
        self.next_addr += (size + STUB_ALLOC_ALIGN - 1) & !(STUB_ALLOC_ALIGN - 1);
        self.bytes_in_use += size;
        self.allocations
            .insert(addr, vec![0u8; size as usize].into_boxed_slice());
        Ok(DevicePtr(addr))
    }

    fn mem_free(&mut self, ptr: DevicePtr) -> Result<(), DeviceError> {
        match self.allocations.remove(&ptr.0) {
            Some(alloc) => {
                self.bytes_in_use -= alloc.len() as u64;
                Ok(())
            }
            None => Err(DeviceError::new(DEVICE_ERR_INVALID_VALUE, "unknown device pointer")),
        }
    }

    fn copy_h2d(&mut self, dst: DevicePtr, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let range = self.range_mut(dst, offset, data.len() as u64)?;
        range.copy_from_slice(data);
        Ok(())
    }

    fn copy_d2h(&mut self, src: DevicePtr, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let alloc = self.allocation(src)?;
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= alloc.len() as u64)
            .ok_or_else(|| DeviceError::new(DEVICE_ERR_INVALID_VALUE, "access out of range"))?;
        buf.copy_from_slice(&alloc[offset as usize..end as usize]);
        Ok(())
    }

    fn copy_d2d(
        &mut self,
        dst: DevicePtr,
        dst_offset: u64,
        src: DevicePtr,
        src_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        // Staging through a host copy keeps overlapping same-allocation
        // ranges well defined.
        let alloc = self.allocation(src)?;
        let end = src_offset
            .checked_add(size)
            .filter(|&end| end <= alloc.len() as u64)
            .ok_or_else(|| DeviceError::new(DEVICE_ERR_INVALID_VALUE, "access out of range"))?;
        let staged = alloc[src_offset as usize..end as usize].to_vec();
        let range = self.range_mut(dst, dst_offset, size)?;
        range.copy_from_slice(&staged);
        Ok(())
    }

    fn memset(
        &mut self,
        ptr: DevicePtr,
        offset: u64,
        value: u8,
        size: u64,
    ) -> Result<(), DeviceError> {
        let range = self.range_mut(ptr, offset, size)?;
        range.fill(value);
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}
