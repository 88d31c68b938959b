// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Connection layer: paired rings plus notifiers behind a backend seam.
//!
//! A [`Connection`] is one zone's view of the link to a peer zone: a tx ring
//! (local to remote), an rx ring (remote to local), a notifier to wake the
//! peer, and a notifier the peer wakes. Backends supply those four pieces;
//! the [`DevBackend`] here builds them from POSIX shared memory and named
//! semaphores, a hypervisor backend would build them from granted pages and
//! event channels. Nothing above this seam can tell the difference.

use log::debug;
use log::info;

use crate::message::Frame;
use crate::ring::Ring;
use crate::ring::RING_BYTES;
use crate::sys::Notifier;
use crate::sys::SharedRegion;
use crate::IdmError;
use crate::Result;

/// Cross-zone wakeup primitive: an event channel, a semaphore, or a test
/// double.
pub trait Notify: Send {
    fn post(&self) -> Result<()>;

    /// Negative `timeout_ms` blocks, zero polls, positive bounds the wait.
    fn wait(&self, timeout_ms: i64) -> Result<()>;
}

impl Notify for Notifier {
    fn post(&self) -> Result<()> {
        Notifier::post(self)
    }

    fn wait(&self, timeout_ms: i64) -> Result<()> {
        Notifier::wait(self, timeout_ms)
    }
}

/// Which side of the trust boundary a connection endpoint serves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// The trusted zone. Responsible for zeroing ring counters at open.
    Server,
    /// A tenant zone.
    Client,
}

/// The resources a backend hands to a connection.
pub struct Channel {
    /// Ring this endpoint publishes into (local to remote).
    pub tx: Ring,
    /// Ring this endpoint consumes from (remote to local).
    pub rx: Ring,
    /// Wakes the remote zone after a send.
    pub notify_remote: Box<dyn Notify>,
    /// Woken by the remote zone after its sends.
    pub wait_local: Box<dyn Notify>,
}

/// Transport backend: maps the shared rings and notification primitives for
/// a zone pair.
pub trait Backend {
    fn open(&mut self, local_zone: u32, remote_zone: u32, role: Role) -> Result<Channel>;
}

/// Development backend over POSIX shared memory and named semaphores.
///
/// Each zone's outbound ring lives in a shared-memory object keyed by the
/// sending zone id; each zone's notifier is a semaphore keyed by the
/// receiving zone id. Two processes agreeing on the prefix and zone ids
/// attach to the same link with no descriptor passing.
pub struct DevBackend {
    prefix: String,
}

impl DevBackend {
    pub fn new() -> DevBackend {
        DevBackend::with_prefix("idm")
    }

    /// A distinct prefix isolates a link namespace, e.g. per test.
    pub fn with_prefix(prefix: &str) -> DevBackend {
        DevBackend {
            prefix: prefix.to_string(),
        }
    }

    fn ring_name(&self, zone: u32) -> String {
        format!("/{}_ring_{}", self.prefix, zone)
    }

    fn sem_name(&self, zone: u32) -> String {
        format!("/{}_sem_{}", self.prefix, zone)
    }

    /// Unlinks the objects backing the link between two zones. Safe to call
    /// when some were never created.
    pub fn cleanup(&self, local_zone: u32, remote_zone: u32) {
        for zone in [local_zone, remote_zone] {
            let _ = SharedRegion::unlink(&self.ring_name(zone));
            let _ = Notifier::unlink(&self.sem_name(zone));
        }
    }
}

impl Default for DevBackend {
    fn default() -> DevBackend {
        DevBackend::new()
    }
}

impl Backend for DevBackend {
    fn open(&mut self, local_zone: u32, remote_zone: u32, _role: Role) -> Result<Channel> {
        let tx_region = SharedRegion::open(&self.ring_name(local_zone), RING_BYTES)?;
        let rx_region = SharedRegion::open(&self.ring_name(remote_zone), RING_BYTES)?;
        let notify_remote = Notifier::open(&self.sem_name(remote_zone))?;
        let wait_local = Notifier::open(&self.sem_name(local_zone))?;

        Ok(Channel {
            tx: Ring::new(Box::new(tx_region))?,
            rx: Ring::new(Box::new(rx_region))?,
            notify_remote: Box::new(notify_remote),
            wait_local: Box::new(wait_local),
        })
    }
}

/// One zone's endpoint of an IDM link.
pub struct Connection {
    local_zone: u32,
    remote_zone: u32,
    next_seq: u64,
    channel: Option<Channel>,
}

impl Connection {
    /// Opens the link to `remote_zone` through `backend`. The server role
    /// zeroes both rings' counters; it must come up before the peer sends.
    pub fn open(
        backend: &mut dyn Backend,
        local_zone: u32,
        remote_zone: u32,
        role: Role,
    ) -> Result<Connection> {
        let channel = backend.open(local_zone, remote_zone, role)?;
        if role == Role::Server {
            channel.tx.reset();
            channel.rx.reset();
        }
        info!(
            "idm link open: zone {} to zone {} ({:?})",
            local_zone, remote_zone, role
        );
        Ok(Connection {
            local_zone,
            remote_zone,
            next_seq: 1,
            channel: Some(channel),
        })
    }

    pub fn local_zone(&self) -> u32 {
        self.local_zone
    }

    pub fn remote_zone(&self) -> u32 {
        self.remote_zone
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Allocates the next per-sender sequence number. Sequence numbers start
    /// at 1 and are the sole request/response correlation id.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Publishes one frame and wakes the peer. Never blocks; a full tx ring
    /// surfaces as `RingFull` without anything being written.
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        let channel = self.channel.as_ref().ok_or(IdmError::NotConnected)?;
        frame.validate()?;
        channel.tx.push(&frame.to_bytes())?;
        channel.notify_remote.post()
    }

    /// Waits up to `timeout_ms` for a frame from the peer.
    ///
    /// A wakeup that finds the ring empty (spurious or raced) reports
    /// `TimedOut`; a malformed slot is consumed and reported as
    /// `InvalidFrame` so a hostile peer cannot wedge the link.
    pub fn recv(&mut self, timeout_ms: i64) -> Result<Frame> {
        let channel = self.channel.as_ref().ok_or(IdmError::NotConnected)?;
        channel.wait_local.wait(timeout_ms)?;
        match channel.rx.pop_frame() {
            None => Err(IdmError::TimedOut),
            Some(Err(e)) => {
                debug!("discarded malformed slot from zone {}", self.remote_zone);
                Err(e)
            }
            Some(Ok(bytes)) => Frame::decode(&bytes),
        }
    }

    /// Releases the backend resources. Later sends and receives report
    /// `NotConnected`. In-flight messages are discarded.
    pub fn close(&mut self) {
        self.channel = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::message::Request;

    static PREFIX_COUNTER: AtomicU32 = AtomicU32::new(0);

    struct TestLink {
        backend: DevBackend,
        server: Connection,
        client: Connection,
    }

    impl TestLink {
        fn new(tag: &str) -> TestLink {
            let prefix = format!(
                "idmtp_{}_{}_{}",
                std::process::id(),
                tag,
                PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            let mut backend = DevBackend::with_prefix(&prefix);
            let server = Connection::open(&mut backend, 1, 2, Role::Server).unwrap();
            let client = Connection::open(&mut backend, 2, 1, Role::Client).unwrap();
            TestLink {
                backend,
                server,
                client,
            }
        }
    }

    impl Drop for TestLink {
        fn drop(&mut self) {
            self.backend.cleanup(1, 2);
        }
    }

    fn alloc_frame(conn: &mut Connection, size: u64) -> Frame {
        let seq = conn.next_seq();
        Request::Alloc { size, flags: 0 }
            .encode(conn.local_zone(), conn.remote_zone(), seq)
            .unwrap()
    }

    #[test]
    fn roundtrip_client_to_server() {
        let mut link = TestLink::new("roundtrip");

        let frame = alloc_frame(&mut link.client, 4096);
        link.client.send(&frame).unwrap();

        let received = link.server.recv(1000).unwrap();
        assert_eq!(received.src_zone(), 2);
        assert_eq!(received.dst_zone(), 1);
        assert_eq!(received.seq_num(), 1);
        assert_eq!(
            Request::parse(&received).unwrap(),
            Request::Alloc {
                size: 4096,
                flags: 0
            }
        );
    }

    #[test]
    fn frames_arrive_in_send_order() {
        let mut link = TestLink::new("fifo");

        for _ in 0..10 {
            let frame = alloc_frame(&mut link.client, 64);
            link.client.send(&frame).unwrap();
        }
        for expected_seq in 1..=10 {
            let frame = link.server.recv(1000).unwrap();
            assert_eq!(frame.seq_num(), expected_seq);
        }
    }

    #[test]
    fn sequence_numbers_start_at_one_and_increase() {
        let mut link = TestLink::new("seq");
        assert_eq!(link.client.next_seq(), 1);
        assert_eq!(link.client.next_seq(), 2);
        assert_eq!(link.server.next_seq(), 1);
    }

    #[test]
    fn recv_times_out_when_idle() {
        let mut link = TestLink::new("timeout");
        assert!(matches!(link.server.recv(50), Err(IdmError::TimedOut)));
        assert!(matches!(link.server.recv(0), Err(IdmError::TimedOut)));
    }

    #[test]
    fn full_ring_rejects_send_without_losing_frames() {
        let mut link = TestLink::new("full");

        for _ in 0..crate::ring::RING_CAPACITY {
            let frame = alloc_frame(&mut link.client, 64);
            link.client.send(&frame).unwrap();
        }
        let frame = alloc_frame(&mut link.client, 64);
        assert!(matches!(link.client.send(&frame), Err(IdmError::RingFull)));

        // Every accepted frame is still delivered, in order.
        for expected_seq in 1..=crate::ring::RING_CAPACITY as u64 {
            assert_eq!(link.server.recv(1000).unwrap().seq_num(), expected_seq);
        }
    }

    #[test]
    fn closed_connection_reports_not_connected() {
        let mut link = TestLink::new("close");
        link.client.close();
        assert!(!link.client.is_connected());

        let frame = Request::Sync { flags: 0 }.encode(2, 1, 1).unwrap();
        assert!(matches!(
            link.client.send(&frame),
            Err(IdmError::NotConnected)
        ));
        assert!(matches!(
            link.client.recv(0),
            Err(IdmError::NotConnected)
        ));
    }

    #[test]
    fn send_validates_framing() {
        let mut link = TestLink::new("validate");
        let mut frame = alloc_frame(&mut link.client, 64);
        frame.header.magic = 0;
        assert!(matches!(
            link.client.send(&frame),
            Err(IdmError::InvalidFrame)
        ));
    }
}
