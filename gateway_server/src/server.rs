// SSGSCP server core: UDP dispatch, reliability driver, periodic tick.
//
// All client mutation happens on the single task inside `run`; the socket,
// the internal event channel, and the tick are the only suspension points,
// and none of them sits between an authorization check and the state change
// it guards.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ssgs_protocol::{
    pack, parse, parse_uid, GatewayUid, Key, Packet, PacketType, ParseOutcome, SealPayloadParser,
    TelemetryParser,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{Client, SentMessage};
use crate::config::GatewayTable;

/// Cadence of the retransmission scan.
const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound on resends per client per tick.
const RETRANSMIT_MAX_PER_TICK: usize = 10;

/// CONNFAIL frames are packed under the all-zero key; the peer recognizes
/// them by type without being able to authenticate them.
const CONNFAIL_KEY: Key = [0u8; 32];

/// Everything that reaches the server task from outside the socket.
pub(crate) enum Event {
    /// Application dispatched a payload toward a gateway.
    Send { uid: GatewayUid, payload: Vec<u8> },
    /// A reconnection settled long enough ago to tell the application.
    ReconnectDue { uid: GatewayUid },
}

pub type ConnectionHook = Box<dyn FnMut(&mut Client) + Send + Sync>;

pub struct GatewayServer {
    socket: Arc<UdpSocket>,
    table: GatewayTable,
    clients: HashMap<GatewayUid, Client>,
    on_connection: ConnectionHook,
    parser: Box<dyn TelemetryParser + Send + Sync>,
    tx: mpsc::UnboundedSender<Event>,
    rx: Option<mpsc::UnboundedReceiver<Event>>,
}

impl GatewayServer {
    /// Bind the UDP endpoint. `on_connection` runs once per fresh handshake;
    /// it is where the application installs per-client hooks and grabs the
    /// send handle.
    pub async fn bind(
        addr: &str,
        table: GatewayTable,
        on_connection: impl FnMut(&mut Client) + Send + Sync + 'static,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("bind udp {addr}"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            socket: Arc::new(socket),
            table,
            clients: HashMap::new(),
            on_connection: Box::new(on_connection),
            parser: Box::new(SealPayloadParser),
            tx,
            rx: Some(rx),
        })
    }

    /// Swap in a different telemetry payload decoder.
    pub fn with_parser(mut self, parser: impl TelemetryParser + Send + Sync + 'static) -> Self {
        self.parser = Box::new(parser);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        let mut rx = self.rx.take().context("server already running")?;
        let socket = self.socket.clone();
        let mut tick = time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 64 * 1024];

        info!(gateways = self.table.len(), "gateway server ready");
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                    Err(e) => warn!(?e, "udp recv error"),
                },
                Some(ev) = rx.recv() => self.handle_event(ev).await,
                _ = tick.tick() => self.retransmit_pending().await,
            }
        }
    }

    // ------------------------- inbound dispatch -----------------------------

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let Some(uid) = parse_uid(datagram) else {
            debug!(%from, len = datagram.len(), "dropping non-SSGSCP datagram");
            return;
        };
        let Some(key) = self.table.key_for(&uid).copied() else {
            debug!(gateway = %uid, %from, "dropping datagram from unauthorized gateway");
            return;
        };

        let packet = match parse(datagram, &key) {
            ParseOutcome::Valid(p) => p,
            ParseOutcome::Malformed => {
                debug!(gateway = %uid, %from, "undecodable frame from authorized gateway");
                self.send_connfail(uid, 0, from).await;
                return;
            }
            ParseOutcome::AuthFailed => {
                debug!(gateway = %uid, %from, "authentication failed");
                self.send_connfail(uid, 0, from).await;
                return;
            }
        };

        if !self.clients.contains_key(&uid) {
            if packet.packet_type == PacketType::Conn {
                self.accept_connection(uid, key, packet.packet_id, from).await;
            } else {
                // Traffic without a handshake: the peer must restart it.
                debug!(gateway = %uid, packet_type = ?packet.packet_type, "packet for unknown client");
                self.send_connfail(uid, packet.packet_id, from).await;
            }
            return;
        }

        if let Some(client) = self.clients.get_mut(&uid) {
            client.touch();
        }

        match packet.packet_type {
            PacketType::Conn => self.handle_peer_restart(uid, key, packet.packet_id, from).await,
            PacketType::RcptOk => self.handle_receipt(uid, packet.packet_id),
            PacketType::MsgStatus => self.handle_status(uid, key, packet, from).await,
            PacketType::MsgConf | PacketType::ConnAccept | PacketType::ConnFail => {
                warn!(
                    gateway = %uid,
                    packet_type = ?packet.packet_type,
                    "server-outbound packet type received; dropping"
                );
            }
        }
    }

    async fn accept_connection(
        &mut self,
        uid: GatewayUid,
        key: Key,
        packet_id: u16,
        from: SocketAddr,
    ) {
        self.send_packet(PacketType::ConnAccept, uid, packet_id, &key, from)
            .await;
        let mut client = Client::new(uid, key, from, self.tx.clone());
        info!(gateway = %uid, %from, "gateway connected");
        (self.on_connection)(&mut client);
        self.clients.insert(uid, client);
    }

    /// A CONN from a known gateway means it restarted: its sequencing state
    /// is gone, so ours is reset to match, and `onreconnect` fires one
    /// retransmission window later.
    async fn handle_peer_restart(
        &mut self,
        uid: GatewayUid,
        key: Key,
        packet_id: u16,
        from: SocketAddr,
    ) {
        let timeout = {
            let Some(client) = self.clients.get_mut(&uid) else {
                return;
            };
            info!(gateway = %uid, %from, "gateway restarted; session reset");
            client.reset_session(from);
            client.retransmission_timeout
        };
        self.send_packet(PacketType::ConnAccept, uid, packet_id, &key, from)
            .await;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(timeout).await;
            let _ = tx.send(Event::ReconnectDue { uid });
        });
    }

    fn handle_receipt(&mut self, uid: GatewayUid, packet_id: u16) {
        let Some(client) = self.clients.get_mut(&uid) else {
            return;
        };
        if client.acknowledge(packet_id) {
            debug!(gateway = %uid, packet_id, "delivery confirmed");
        } else {
            debug!(gateway = %uid, packet_id, "receipt for unknown packet id");
        }
    }

    async fn handle_status(&mut self, uid: GatewayUid, key: Key, packet: Packet, from: SocketAddr) {
        let fresh = {
            let Some(client) = self.clients.get_mut(&uid) else {
                return;
            };
            client.register_received(packet.packet_id)
        };

        // Duplicates are re-acknowledged but not re-delivered.
        self.send_packet(PacketType::RcptOk, uid, packet.packet_id, &key, from)
            .await;
        if !fresh {
            debug!(gateway = %uid, packet_id = packet.packet_id, "duplicate MSGSTATUS suppressed");
            return;
        }

        let update = self.parser.parse(&packet.payload);
        debug!(gateway = %uid, packet_id = packet.packet_id, ?update, "telemetry update");
        if let Some(client) = self.clients.get_mut(&uid) {
            if let Some(hook) = client.on_message.as_mut() {
                hook(update);
            }
        }
    }

    // ------------------------- outbound path --------------------------------

    async fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Send { uid, payload } => self.dispatch_message(uid, payload).await,
            Event::ReconnectDue { uid } => {
                if let Some(client) = self.clients.get_mut(&uid) {
                    if let Some(hook) = client.on_reconnect.as_mut() {
                        hook();
                    }
                }
            }
        }
    }

    /// Reliable MSGCONF dispatch: pack under the client's next packet id,
    /// queue for retransmission, transmit. A failed send syscall leaves the
    /// entry queued; the tick retries it.
    async fn dispatch_message(&mut self, uid: GatewayUid, payload: Vec<u8>) {
        let (bytes, remote, packet_id) = {
            let Some(client) = self.clients.get_mut(&uid) else {
                warn!(gateway = %uid, "send for unknown client; dropping");
                return;
            };
            let packet_id = client.peek_packet_id();
            let packet = Packet::new(PacketType::MsgConf, uid, packet_id, payload);
            let bytes = match pack(&packet, &client.key) {
                Ok(b) => b,
                Err(e) => {
                    warn!(%e, gateway = %uid, "cannot pack MSGCONF; dropping");
                    return;
                }
            };
            client.advance_packet_id();
            client.track_sent(SentMessage {
                packet_id,
                last_sent: Instant::now(),
                bytes: bytes.clone(),
            });
            (bytes, client.remote_addr(), packet_id)
        };

        match self.socket.send_to(&bytes, remote).await {
            Ok(_) => debug!(gateway = %uid, packet_id, len = bytes.len(), "MSGCONF dispatched"),
            Err(e) => warn!(?e, gateway = %uid, packet_id, "udp send error"),
        }
    }

    /// Resend unacknowledged frames past the timeout, oldest first, capped
    /// per client per tick. The original bytes go out again verbatim (the
    /// IV is already baked in); the peer dedupes by packet id.
    async fn retransmit_pending(&mut self) {
        let now = Instant::now();
        let socket = self.socket.clone();
        for client in self.clients.values_mut() {
            let mut resent = 0usize;
            for msg in client.sent_messages.iter_mut() {
                if resent >= RETRANSMIT_MAX_PER_TICK {
                    break;
                }
                if now.duration_since(msg.last_sent) <= client.retransmission_timeout {
                    continue;
                }
                if let Err(e) = socket.send_to(&msg.bytes, client.remote).await {
                    warn!(?e, gateway = %client.uid, packet_id = msg.packet_id, "retransmit send error");
                }
                msg.last_sent = now;
                resent += 1;
                debug!(gateway = %client.uid, packet_id = msg.packet_id, "retransmitted");
            }
        }
    }

    async fn send_packet(
        &self,
        packet_type: PacketType,
        uid: GatewayUid,
        packet_id: u16,
        key: &Key,
        to: SocketAddr,
    ) {
        let packet = Packet::new(packet_type, uid, packet_id, Vec::new());
        match pack(&packet, key) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    warn!(?e, gateway = %uid, ?packet_type, "udp send error");
                }
            }
            Err(e) => warn!(%e, gateway = %uid, ?packet_type, "pack error"),
        }
    }

    async fn send_connfail(&self, uid: GatewayUid, packet_id: u16, to: SocketAddr) {
        self.send_packet(PacketType::ConnFail, uid, packet_id, &CONNFAIL_KEY, to)
            .await;
    }
}

// ================================ Tests =====================================
