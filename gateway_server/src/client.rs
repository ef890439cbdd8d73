// Per-gateway connection state. Single-writer: only the server task mutates
// a Client, so none of this needs interior locking.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ssgs_protocol::{GatewayUid, Key, SensorSealUpdate};
use tokio::sync::mpsc;
use tracing::warn;

use crate::server::Event;

/// Oldest unacknowledged frames are evicted past this depth.
pub const SENT_MSG_LIST_MAX_LEN: usize = 100;
/// Depth of the duplicate-suppression FIFO of received packet ids.
pub const RECEIVED_IDS_MAX_LEN: usize = 100;
/// Fixed retransmission threshold.
pub const RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(2000);

/// A reliable frame awaiting its RCPTOK. `bytes` is the exact datagram that
/// went out, IV included, so retransmissions replay it bit-for-bit.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub packet_id: u16,
    pub last_sent: Instant,
    pub bytes: Vec<u8>,
}

pub struct Client {
    pub(crate) uid: GatewayUid,
    pub(crate) key: Key,
    pub(crate) remote: SocketAddr,
    pub(crate) last_seen: Instant,
    pub(crate) send_packet_id: u16,
    pub(crate) retransmission_timeout: Duration,
    /// Head = oldest. Entries leave on RCPTOK or head-eviction.
    pub(crate) sent_messages: VecDeque<SentMessage>,
    /// Ordered set of recently seen inbound packet ids, head-evicted.
    pub(crate) received_ids: VecDeque<u16>,
    pub(crate) on_message: Option<Box<dyn FnMut(SensorSealUpdate) + Send + Sync>>,
    pub(crate) on_reconnect: Option<Box<dyn FnMut() + Send + Sync>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Client {
    pub(crate) fn new(
        uid: GatewayUid,
        key: Key,
        remote: SocketAddr,
        tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            uid,
            key,
            remote,
            last_seen: Instant::now(),
            send_packet_id: 0,
            retransmission_timeout: RETRANSMISSION_TIMEOUT,
            sent_messages: VecDeque::new(),
            received_ids: VecDeque::new(),
            on_message: None,
            on_reconnect: None,
            tx,
        }
    }

    pub fn uid(&self) -> GatewayUid {
        self.uid
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Handle the application keeps to dispatch MSGCONF frames to this
    /// gateway. Cloneable and usable from any task.
    pub fn sender(&self) -> ClientSender {
        ClientSender {
            uid: self.uid,
            tx: self.tx.clone(),
        }
    }

    /// Install the hook invoked once per fresh (non-duplicate) telemetry
    /// report.
    pub fn set_on_message(&mut self, hook: impl FnMut(SensorSealUpdate) + Send + Sync + 'static) {
        self.on_message = Some(Box::new(hook));
    }

    /// Install the hook invoked after an observed gateway restart.
    pub fn set_on_reconnect(&mut self, hook: impl FnMut() + Send + Sync + 'static) {
        self.on_reconnect = Some(Box::new(hook));
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// The id the next outbound MSGCONF will carry.
    pub(crate) fn peek_packet_id(&self) -> u16 {
        self.send_packet_id
    }

    /// Consume the current id; wraps mod 2^16.
    pub(crate) fn advance_packet_id(&mut self) {
        self.send_packet_id = self.send_packet_id.wrapping_add(1);
    }

    pub(crate) fn track_sent(&mut self, msg: SentMessage) {
        self.sent_messages.push_back(msg);
        if self.sent_messages.len() > SENT_MSG_LIST_MAX_LEN {
            self.sent_messages.pop_front();
        }
    }

    /// Remove the sent-queue entry matching `packet_id`. False when nothing
    /// matched (late or spurious receipt).
    pub(crate) fn acknowledge(&mut self, packet_id: u16) -> bool {
        match self
            .sent_messages
            .iter()
            .position(|m| m.packet_id == packet_id)
        {
            Some(idx) => {
                self.sent_messages.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Record an inbound packet id. False when the id is already in the
    /// FIFO, i.e. the datagram is a duplicate and must not be re-delivered.
    pub(crate) fn register_received(&mut self, packet_id: u16) -> bool {
        if self.received_ids.contains(&packet_id) {
            return false;
        }
        self.received_ids.push_back(packet_id);
        if self.received_ids.len() > RECEIVED_IDS_MAX_LEN {
            self.received_ids.pop_front();
        }
        true
    }

    /// Peer restart: zero the sequencing state, drop both queues, adopt the
    /// new endpoint.
    pub(crate) fn reset_session(&mut self, remote: SocketAddr) {
        self.send_packet_id = 0;
        self.sent_messages.clear();
        self.received_ids.clear();
        self.remote = remote;
    }
}

/// Application-side send handle; `send` enqueues a reliable MSGCONF dispatch
/// onto the server task.
#[derive(Clone)]
pub struct ClientSender {
    uid: GatewayUid,
    tx: mpsc::UnboundedSender<Event>,
}

impl ClientSender {
    pub fn uid(&self) -> GatewayUid {
        self.uid
    }

    pub fn send(&self, payload: Vec<u8>) {
        if self
            .tx
            .send(Event::Send {
                uid: self.uid,
                payload,
            })
            .is_err()
        {
            warn!(uid = %self.uid, "server task gone; dropping outbound message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client() -> Client {
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = "10.0.0.2:40000".parse().unwrap();
        Client::new(GatewayUid([0xAA, 0xBB, 0xCC, 0xDD]), [0x11; 32], remote, tx)
    }

    fn sent(packet_id: u16) -> SentMessage {
        SentMessage {
            packet_id,
            last_sent: Instant::now(),
            bytes: vec![0u8; 26],
        }
    }

    #[test]
    fn packet_ids_advance_in_order_and_wrap() {
        let mut c = make_client();
        for expected in 0u16..5 {
            assert_eq!(c.peek_packet_id(), expected);
            c.advance_packet_id();
        }

        c.send_packet_id = u16::MAX;
        assert_eq!(c.peek_packet_id(), u16::MAX);
        c.advance_packet_id();
        assert_eq!(c.peek_packet_id(), 0);
    }

    #[test]
    fn sent_queue_is_bounded_with_head_eviction() {
        let mut c = make_client();
        for id in 0..150u16 {
            c.track_sent(sent(id));
        }
        assert_eq!(c.sent_messages.len(), SENT_MSG_LIST_MAX_LEN);
        assert_eq!(c.sent_messages.front().unwrap().packet_id, 50);
        assert_eq!(c.sent_messages.back().unwrap().packet_id, 149);
    }

    #[test]
    fn acknowledge_removes_only_the_matching_entry() {
        let mut c = make_client();
        for id in [3u16, 7, 11] {
            c.track_sent(sent(id));
        }
        assert!(c.acknowledge(7));
        assert_eq!(c.sent_messages.len(), 2);
        assert!(!c.acknowledge(7));
        assert!(c.sent_messages.iter().all(|m| m.packet_id != 7));
    }

    #[test]
    fn received_fifo_suppresses_duplicates() {
        let mut c = make_client();
        assert!(c.register_received(7));
        assert!(!c.register_received(7));
        assert!(c.register_received(8));
        assert!(!c.register_received(7));
    }

    #[test]
    fn received_fifo_is_bounded_and_forgets_evicted_ids() {
        let mut c = make_client();
        for id in 0..=(RECEIVED_IDS_MAX_LEN as u16) {
            assert!(c.register_received(id));
        }
        assert_eq!(c.received_ids.len(), RECEIVED_IDS_MAX_LEN);
        // Id 0 was head-evicted, so it counts as fresh again.
        assert!(c.register_received(0));
    }

    #[test]
    fn reset_session_clears_sequencing_state() {
        let mut c = make_client();
        c.advance_packet_id();
        c.advance_packet_id();
        c.track_sent(sent(0));
        c.register_received(9);

        let new_remote: SocketAddr = "10.0.0.2:40001".parse().unwrap();
        c.reset_session(new_remote);

        assert_eq!(c.peek_packet_id(), 0);
        assert!(c.sent_messages.is_empty());
        assert!(c.received_ids.is_empty());
        assert_eq!(c.remote_addr(), new_remote);
    }

    #[test]
    fn sender_carries_the_client_uid() {
        let c = make_client();
        assert_eq!(c.sender().uid(), c.uid());
    }
}
