// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Trusted-zone GPU broker.
//!
//! The broker has exclusive access to the real accelerator and services
//! requests from tenant zones over IDM. Tenants address device memory only
//! through opaque handles minted by the [`handle_table`], so no device
//! pointer ever crosses the trust boundary and no zone can touch another
//! zone's allocations.

pub mod broker;
pub mod device;
pub mod handle_table;

pub use broker::Broker;
pub use device::DeviceError;
pub use device::DevicePtr;
pub use device::GpuDevice;
pub use device::StubDevice;
pub use handle_table::HandleTable;
pub use handle_table::TableStats;
