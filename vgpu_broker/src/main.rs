// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Context;
use clap::Parser;
use idm::Connection;
use idm::DevBackend;
use idm::Role;
use log::info;
use vgpu_broker::Broker;
use vgpu_broker::StubDevice;

#[derive(Parser, Debug)]
#[command(version, about = "GPU virtualization broker", long_about = None)]
struct Args {
    /// Zone id of this (trusted) zone.
    #[arg(long, default_value_t = 1)]
    local_zone: u32,

    /// Zone id of the tenant zone to serve.
    #[arg(long, default_value_t = 2)]
    tenant_zone: u32,

    /// Name prefix for development-backend shared memory and semaphores.
    #[arg(long, default_value = "idm")]
    shm_prefix: String,
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_termination(_: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

fn install_termination_handlers() -> anyhow::Result<()> {
    let handler: extern "C" fn(libc::c_int) = handle_termination;
    // SAFETY: the handler only stores to a process-wide atomic, which is
    // async-signal-safe; the sigaction struct is fully initialized.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                bail!("failed to install handler for signal {}", signal);
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    install_termination_handlers()?;

    let mut backend = DevBackend::with_prefix(&args.shm_prefix);
    let conn = Connection::open(&mut backend, args.local_zone, args.tenant_zone, Role::Server)
        .context("failed to open transport")?;
    let device = Box::new(StubDevice::new());
    let mut broker = Broker::new(conn, device).context("failed to initialize device")?;

    info!("broker up in zone {}", args.local_zone);
    let result = broker.run(&RUNNING);
    broker.shutdown();
    result.context("transport failed in main loop")?;
    Ok(())
}
