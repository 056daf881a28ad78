use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::identifier::{DhtKey, NodeId, NodeInfo, RpcId, ID_BITS};
use crate::core::routing_table::RoutingTable;
use crate::core::storage::{RecordStore, Value};
use crate::nat::holepunch::{
    self, DIRECT_CONNECT, HOLE_PUNCH_CONFIRM, HOLE_PUNCH_RESPONSE, LOCAL_CONNECT,
    LOCAL_CONNECT_RESPONSE, PROBE_ACK, STUN_CONNECT,
};
use crate::nat::stun::DEFAULT_REFLECTORS;
use crate::nat::{shared_connection_info, PunchOutcome, SharedConnectionInfo};

mod command;
mod lookup;
pub use self::command::{Command, NodeReport};
use self::lookup::{Lookup, LookupAction, LookupKind, PendingLookup, LOOKUP_RPC_TIMEOUT};

/// Kademlia parallelism width.
pub const ALPHA: usize = 3;

/// Inbound datagrams larger than this are discarded.
const RECV_BUFFER: usize = 4096;

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// One RPC per datagram. The envelope carries the sender's full descriptor
/// and the intended receiver; the kind carries the typed payload, so keys,
/// values, and node lists never share a delimited text form.
#[derive(Serialize, Deserialize, Debug)]
struct Rpc {
    sender: NodeInfo,
    receiver: NodeId,
    kind: RpcKind,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
enum RpcKind {
    Ping { rpc_id: RpcId },
    Pong { rpc_id: RpcId },
    Store { key: DhtKey, value: Value },
    FindNode { target: NodeId },
    FindValue { key: DhtKey },
    // Reply to FindNode, and to FindValue when the value is not held. The
    // target is echoed so the reply can be matched to its lookup.
    Nodes { target: NodeId, nodes: Vec<NodeInfo> },
    ValueFound { key: DhtKey, value: Value },
    HolePunchRequest,
    HolePunchResponse,
}

/// The side effects `handle_message`/`handle_command` want the event loop
/// to perform. Keeping them as data decouples the routing and lookup logic
/// from socket I/O and task spawning.
#[derive(Debug)]
enum Effect {
    Send {
        addr: SocketAddr,
        bytes: Vec<u8>,
    },
    StartHolePunch {
        target: NodeInfo,
        tx_result: oneshot::Sender<PunchOutcome>,
    },
    RespondHolePunch {
        requester: NodeInfo,
    },
}

#[derive(Debug)]
struct PendingPing {
    tx_alive: oneshot::Sender<bool>,
    deadline: Instant,
}

pub struct ProtocolManager {
    pub my_info: NodeInfo,
    pub routing_table: RoutingTable,
    pub records: RecordStore,
    socket: UdpSocket,
    rx: Option<mpsc::Receiver<Command>>,
    k: usize,
    alpha: usize,
    conn_info: SharedConnectionInfo,
    pending_pings: HashMap<RpcId, PendingPing>,
    pending_lookups: HashMap<NodeId, PendingLookup>,
    running: bool,
}

impl ProtocolManager {
    pub fn new(
        socket: UdpSocket,
        rx: mpsc::Receiver<Command>,
        k: usize,
        alpha: usize,
    ) -> anyhow::Result<Self> {
        Self::build(socket, Some(rx), k, alpha)
    }

    /// A manager without a command channel, e.g. a pure relay/seed node.
    pub fn new_headless(socket: UdpSocket, k: usize, alpha: usize) -> anyhow::Result<Self> {
        Self::build(socket, None, k, alpha)
    }

    fn build(
        socket: UdpSocket,
        rx: Option<mpsc::Receiver<Command>>,
        k: usize,
        alpha: usize,
    ) -> anyhow::Result<Self> {
        let addr = socket.local_addr()?;
        let my_id = NodeId::new_random();
        let my_info = NodeInfo {
            ip_address: addr.ip(),
            udp_port: addr.port(),
            node_id: my_id,
        };

        let conn_info = shared_connection_info();
        conn_info.lock().unwrap().local_port = addr.port();

        Ok(Self {
            my_info,
            routing_table: RoutingTable::new(my_id, k),
            records: RecordStore::new(),
            socket,
            rx,
            k,
            alpha,
            conn_info,
            pending_pings: HashMap::new(),
            pending_lookups: HashMap::new(),
            running: true,
        })
    }

    /// Shared handle to this node's connection info, for NAT detection from
    /// outside the event loop.
    pub fn connection_info(&self) -> SharedConnectionInfo {
        self.conn_info.clone()
    }

    /// Pre-seed the routing table. Used by tests and by local wiring before
    /// the event loop starts.
    pub fn add_known_peer(&mut self, info: NodeInfo) {
        self.routing_table.add(info);
    }

    fn rpc_bytes(&self, receiver: NodeId, kind: RpcKind) -> Vec<u8> {
        let rpc = Rpc {
            sender: self.my_info,
            receiver,
            kind,
        };
        rmp_serde::to_vec(&rpc).expect("serialize rpc")
    }

    /// Every inbound RPC touches the sender in the routing table before the
    /// message is dispatched. The observed source address wins over the
    /// advertised one, which keeps NATed peers reachable.
    fn observe_contact(&mut self, src_addr: SocketAddr, node_id: NodeId) {
        let peer = NodeInfo {
            ip_address: src_addr.ip(),
            udp_port: src_addr.port(),
            node_id,
        };
        self.routing_table.add(peer);
    }

    fn handle_command(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Put {
                key,
                value,
                tx_done,
            } => {
                let target = NodeId::from_key(&key);
                self.start_lookup(
                    target,
                    LookupKind::Node,
                    LookupAction::Put {
                        key,
                        value,
                        tx_done: Some(tx_done),
                    },
                )
            }
            Command::Get { key, tx_value } => {
                // Serve from the local replica when we have one.
                if let Some(value) = self.records.get(&key) {
                    let _ = tx_value.send(Some(value.clone()));
                    return Vec::new();
                }
                let target = NodeId::from_key(&key);
                self.start_lookup(target, LookupKind::Value(key), LookupAction::Get { tx_value })
            }
            Command::FindNode { target, tx_nodes } => {
                self.start_lookup(target, LookupKind::Node, LookupAction::FindNodes { tx_nodes })
            }
            Command::Ping { id, tx_alive } => match self.routing_table.get(id) {
                None => {
                    let _ = tx_alive.send(false);
                    Vec::new()
                }
                Some(peer) => {
                    let rpc_id = RpcId::new_random();
                    let bytes = self.rpc_bytes(peer.node_id, RpcKind::Ping { rpc_id });
                    self.pending_pings.insert(
                        rpc_id,
                        PendingPing {
                            tx_alive,
                            deadline: Instant::now() + LOOKUP_RPC_TIMEOUT,
                        },
                    );
                    vec![Effect::Send {
                        addr: SocketAddr::new(peer.ip_address, peer.udp_port),
                        bytes,
                    }]
                }
            },
            Command::Connect { id, tx_result } => match self.routing_table.get(id) {
                None => {
                    let _ = tx_result.send(PunchOutcome::Failed);
                    Vec::new()
                }
                Some(target) => {
                    // Tell the peer to open its side, then work the ladder.
                    let bytes = self.rpc_bytes(target.node_id, RpcKind::HolePunchRequest);
                    vec![
                        Effect::Send {
                            addr: SocketAddr::new(target.ip_address, target.udp_port),
                            bytes,
                        },
                        Effect::StartHolePunch { target, tx_result },
                    ]
                }
            },
            Command::Bootstrap { addrs } => {
                let my_id = self.my_info.node_id;
                // A self-lookup with an empty seed list; the FindNode(self)
                // sent to each seed address pulls their views in.
                let mut effects =
                    self.init_lookup(my_id, LookupKind::Node, LookupAction::Bootstrap, Vec::new());
                let bytes = self.rpc_bytes(my_id, RpcKind::FindNode { target: my_id });
                for addr in addrs {
                    effects.push(Effect::Send {
                        addr,
                        bytes: bytes.clone(),
                    });
                }
                effects
            }
            Command::Info { tx_report } => {
                let report = NodeReport {
                    my_info: self.my_info,
                    connection: self.conn_info.lock().unwrap().clone(),
                    peers: self.routing_table.all_peers(),
                    stored_records: self.records.len(),
                };
                let _ = tx_report.send(report);
                Vec::new()
            }
            Command::Shutdown => {
                self.running = false;
                Vec::new()
            }
            Command::DebugHasValue { key, tx_has } => {
                let _ = tx_has.send(self.records.contains(&key));
                Vec::new()
            }
        }
    }

    fn init_lookup(
        &mut self,
        target: NodeId,
        kind: LookupKind,
        action: LookupAction,
        initial: Vec<NodeInfo>,
    ) -> Vec<Effect> {
        let mut lookup = Lookup::new(self.k, self.alpha, self.my_info, target, kind, initial);
        let effects = lookup.top_up_alpha_requests();
        self.pending_lookups
            .insert(target, PendingLookup { lookup, action });
        effects
    }

    /// Seed a lookup from the routing table. An empty table fails the
    /// caller right away, there is nobody to ask.
    fn start_lookup(&mut self, target: NodeId, kind: LookupKind, action: LookupAction) -> Vec<Effect> {
        let initial = self.routing_table.k_closest(target);
        if initial.is_empty() {
            debug!(target = %target.short_hex(), "lookup with no candidates");
            action.fail();
            return Vec::new();
        }
        self.init_lookup(target, kind, action, initial)
    }

    fn handle_datagram(&mut self, data: &[u8], src_addr: SocketAddr) -> Vec<Effect> {
        match rmp_serde::from_slice::<Rpc>(data) {
            Ok(msg) => self.handle_message(msg, src_addr),
            Err(_) => self.handle_probe(data, src_addr),
        }
    }

    /// Plain-text hole-punch probes arrive on the main socket. Request
    /// probes get an ack so the prober sees a reply from the endpoint it
    /// targeted; response/ack traffic is dropped; everything else is a
    /// protocol fault and vanishes silently.
    fn handle_probe(&mut self, data: &[u8], src_addr: SocketAddr) -> Vec<Effect> {
        if data.starts_with(PROBE_ACK)
            || data.starts_with(LOCAL_CONNECT_RESPONSE)
            || data.starts_with(HOLE_PUNCH_RESPONSE)
            || data.starts_with(HOLE_PUNCH_CONFIRM)
        {
            debug!(%src_addr, "probe response on main socket");
            return Vec::new();
        }
        if data.starts_with(DIRECT_CONNECT)
            || data.starts_with(LOCAL_CONNECT)
            || data.starts_with(STUN_CONNECT)
        {
            debug!(%src_addr, "acking connection probe");
            return vec![Effect::Send {
                addr: src_addr,
                bytes: PROBE_ACK.to_vec(),
            }];
        }
        debug!(%src_addr, len = data.len(), "dropping undecodable datagram");
        Vec::new()
    }

    fn handle_message(&mut self, msg: Rpc, src_addr: SocketAddr) -> Vec<Effect> {
        let sender_id = msg.sender.node_id;
        self.observe_contact(src_addr, sender_id);

        let mut effects = Vec::new();
        match msg.kind {
            RpcKind::Ping { rpc_id } => {
                debug!(from = %sender_id.short_hex(), "ping");
                let bytes = self.rpc_bytes(sender_id, RpcKind::Pong { rpc_id });
                effects.push(Effect::Send {
                    addr: src_addr,
                    bytes,
                });
            }

            RpcKind::Pong { rpc_id } => {
                if let Some(pending) = self.pending_pings.remove(&rpc_id) {
                    let _ = pending.tx_alive.send(true);
                } else {
                    debug!(from = %sender_id.short_hex(), "pong without a matching ping");
                }
            }

            RpcKind::Store { key, value } => {
                debug!(key = %key, len = value.len(), "store request");
                self.records.insert(key, value);
            }

            RpcKind::FindNode { target } => {
                let closest = self.routing_table.k_closest(target);
                let bytes = self.rpc_bytes(
                    sender_id,
                    RpcKind::Nodes {
                        target,
                        nodes: closest,
                    },
                );
                effects.push(Effect::Send {
                    addr: src_addr,
                    bytes,
                });
            }

            RpcKind::FindValue { key } => {
                if let Some(value) = self.records.get(&key) {
                    let bytes = self.rpc_bytes(
                        sender_id,
                        RpcKind::ValueFound {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    );
                    effects.push(Effect::Send {
                        addr: src_addr,
                        bytes,
                    });
                } else {
                    // Not held here; answer with the peers closest to the
                    // key's position in identifier space.
                    let target = NodeId::from_key(&key);
                    let closest = self.routing_table.k_closest(target);
                    let bytes = self.rpc_bytes(
                        sender_id,
                        RpcKind::Nodes {
                            target,
                            nodes: closest,
                        },
                    );
                    effects.push(Effect::Send {
                        addr: src_addr,
                        bytes,
                    });
                }
            }

            RpcKind::Nodes { target, nodes } => {
                for n in &nodes {
                    self.routing_table.add(*n);
                }
                if let Some(pending) = self.pending_lookups.get_mut(&target) {
                    pending.lookup.on_response(sender_id);
                    if matches!(pending.lookup.kind, LookupKind::Value(_)) {
                        pending.lookup.record_non_holder(NodeInfo {
                            ip_address: src_addr.ip(),
                            udp_port: src_addr.port(),
                            node_id: sender_id,
                        });
                    }
                    pending.lookup.merge_new_nodes(nodes);
                    effects.extend(pending.lookup.top_up_alpha_requests());
                } else {
                    debug!(target = %target.short_hex(), "nodes reply without a lookup");
                }
                effects.extend(self.finalize_finished_lookups(Instant::now()));
            }

            RpcKind::ValueFound { key, value } => {
                let target = NodeId::from_key(&key);
                if let Some(pending) = self.pending_lookups.remove(&target) {
                    info!(key = %key, from = %sender_id.short_hex(), "value lookup resolved");
                    if let LookupAction::Get { tx_value } = pending.action {
                        let _ = tx_value.send(Some(value.clone()));
                    }
                    // Cache the record at the closest peer that searched for
                    // it and came up empty.
                    if let Some(non_holder) = pending.lookup.best_non_holder() {
                        let bytes = self.rpc_bytes(
                            non_holder.node_id,
                            RpcKind::Store {
                                key: key.clone(),
                                value: value.clone(),
                            },
                        );
                        effects.push(Effect::Send {
                            addr: SocketAddr::new(non_holder.ip_address, non_holder.udp_port),
                            bytes,
                        });
                    }
                }
                self.records.insert(key, value);
            }

            RpcKind::HolePunchRequest => {
                let requester = NodeInfo {
                    ip_address: src_addr.ip(),
                    udp_port: src_addr.port(),
                    node_id: sender_id,
                };
                info!(from = %requester, "hole punch request");
                let bytes = self.rpc_bytes(sender_id, RpcKind::HolePunchResponse);
                effects.push(Effect::Send {
                    addr: src_addr,
                    bytes,
                });
                effects.push(Effect::RespondHolePunch { requester });
            }

            RpcKind::HolePunchResponse => {
                debug!(from = %sender_id.short_hex(), "hole punch response");
            }
        }

        effects
    }

    /// Remove finished lookups and resolve their callers. Put-style lookups
    /// dispatch their STORE fan-out here, against the converged shortlist.
    fn finalize_finished_lookups(&mut self, now: Instant) -> Vec<Effect> {
        let finished: Vec<NodeId> = self
            .pending_lookups
            .iter()
            .filter(|(_, p)| p.lookup.is_finished(now))
            .map(|(target, _)| *target)
            .collect();

        let mut effects = Vec::new();
        for target in finished {
            let Some(pending) = self.pending_lookups.remove(&target) else {
                continue;
            };
            let closest = pending.lookup.short_list.clone();
            match pending.action {
                LookupAction::Get { tx_value } => {
                    // Converged without anyone producing the value.
                    let _ = tx_value.send(None);
                }
                LookupAction::Put {
                    key,
                    value,
                    tx_done,
                } => {
                    for n in &closest {
                        let bytes = self.rpc_bytes(
                            n.node_id,
                            RpcKind::Store {
                                key: key.clone(),
                                value: value.clone(),
                            },
                        );
                        effects.push(Effect::Send {
                            addr: SocketAddr::new(n.ip_address, n.udp_port),
                            bytes,
                        });
                    }
                    // The originator doubles as a replica.
                    self.records.insert(key, value);
                    if let Some(tx) = tx_done {
                        let _ = tx.send(true);
                    }
                }
                LookupAction::FindNodes { tx_nodes } => {
                    let _ = tx_nodes.send(closest);
                }
                LookupAction::Bootstrap => {
                    info!(peers = self.routing_table.peer_count(), "bootstrap lookup converged");
                }
                LookupAction::Refresh => {}
            }
        }
        effects
    }

    /// Expire timed-out pings and lookup RPCs, then top lookups back up to α
    /// and finalize any that have converged.
    fn sweep_timeouts_and_topup(&mut self, now: Instant) -> Vec<Effect> {
        let expired: Vec<RpcId> = self
            .pending_pings
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for rpc_id in expired {
            if let Some(pending) = self.pending_pings.remove(&rpc_id) {
                let _ = pending.tx_alive.send(false);
            }
        }

        let mut effects = Vec::new();
        for pending in self.pending_lookups.values_mut() {
            pending.lookup.sweep_expired(now);
            effects.extend(pending.lookup.top_up_alpha_requests());
        }
        effects.extend(self.finalize_finished_lookups(now));
        effects
    }

    /// One maintenance pass: refresh every bucket, republish every record,
    /// then expire. Republish precedes expire so a record about to lapse is
    /// re-replicated from its snapshot value first.
    fn run_maintenance(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.routing_table.peer_count() > 0 {
            let my_id = self.my_info.node_id;
            for i in 0..ID_BITS {
                let target = my_id.flip_bit(i);
                effects.extend(self.start_lookup(target, LookupKind::Node, LookupAction::Refresh));
            }
        }

        let records = self.records.snapshot();
        for (key, value) in records {
            let target = NodeId::from_key(&key);
            effects.extend(self.start_lookup(
                target,
                LookupKind::Node,
                LookupAction::Put {
                    key,
                    value,
                    tx_done: None,
                },
            ));
        }

        let removed = self.records.expire(Instant::now());
        if removed > 0 {
            info!(removed, "expired records");
        }

        effects
    }

    async fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Send { addr, bytes } => {
                // Transport faults are per-RPC failures: log and move on, the
                // peer simply never replies.
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    warn!(%addr, error = %e, "send failed");
                }
            }
            Effect::StartHolePunch { target, tx_result } => {
                let conn_info = self.conn_info.clone();
                tokio::spawn(async move {
                    let outcome = holepunch::initiate(target, conn_info, DEFAULT_REFLECTORS).await;
                    let _ = tx_result.send(outcome);
                });
            }
            Effect::RespondHolePunch { requester } => {
                let conn_info = self.conn_info.clone();
                tokio::spawn(holepunch::respond(requester, conn_info, DEFAULT_REFLECTORS));
            }
        }
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.apply_effect(effect).await;
        }
    }

    /// Fail everything still outstanding. Runs once at shutdown.
    fn fail_outstanding(&mut self) {
        for (_, pending) in self.pending_lookups.drain() {
            pending.action.fail();
        }
        for (_, pending) in self.pending_pings.drain() {
            let _ = pending.tx_alive.send(false);
        }
    }

    /// The protocol event loop: inbound datagrams, user commands, the
    /// timeout sweeper, and the periodic maintenance pass, all serialized
    /// on this task.
    pub async fn run(mut self) {
        let mut buf = [0u8; RECV_BUFFER];

        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut maintenance = interval_at(
            Instant::now() + MAINTENANCE_INTERVAL,
            MAINTENANCE_INTERVAL,
        );
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(me = %self.my_info, "protocol loop started");

        while self.running {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src_addr)) => {
                            let effects = self.handle_datagram(&buf[..len], src_addr);
                            self.apply_effects(effects).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "recv failed");
                        }
                    }
                }

                maybe_command = async {
                    match self.rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // No command channel: park this arm forever.
                        None => std::future::pending::<Option<Command>>().await,
                    }
                } => {
                    match maybe_command {
                        Some(command) => {
                            let effects = self.handle_command(command);
                            self.apply_effects(effects).await;
                        }
                        None => {
                            // Command channel closed; continue headless.
                            self.rx = None;
                        }
                    }
                }

                _ = sweep.tick() => {
                    let effects = self.sweep_timeouts_and_topup(Instant::now());
                    self.apply_effects(effects).await;
                }

                _ = maintenance.tick() => {
                    let effects = self.run_maintenance();
                    self.apply_effects(effects).await;
                }
            }
        }

        self.fail_outstanding();
        info!("protocol loop stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::{id_with_first_byte, make_peer};

    async fn headless(k: usize, alpha: usize) -> ProtocolManager {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        ProtocolManager::new_headless(socket, k, alpha).unwrap()
    }

    fn decode(bytes: &[u8]) -> Rpc {
        rmp_serde::from_slice(bytes).unwrap()
    }

    fn sends_of(effects: Vec<Effect>) -> Vec<(SocketAddr, Rpc)> {
        effects
            .into_iter()
            .filter_map(|e| match e {
                Effect::Send { addr, bytes } => Some((addr, decode(&bytes))),
                _ => None,
            })
            .collect()
    }

    fn addr_of(info: &NodeInfo) -> SocketAddr {
        SocketAddr::new(info.ip_address, info.udp_port)
    }

    #[tokio::test]
    async fn ping_gets_pong_and_sender_is_learned() {
        let mut pm = headless(20, 3).await;

        let src_id = NodeId::new_random();
        let rpc_id = RpcId::new_random();
        let msg = Rpc {
            sender: NodeInfo {
                ip_address: "127.0.0.1".parse().unwrap(),
                udp_port: 4000,
                node_id: src_id,
            },
            receiver: pm.my_info.node_id,
            kind: RpcKind::Ping { rpc_id },
        };
        let src: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let effects = pm.handle_message(msg, src);

        assert!(pm.routing_table.contains(src_id));

        let sends = sends_of(effects);
        assert_eq!(sends.len(), 1);
        let (addr, reply) = &sends[0];
        assert_eq!(*addr, src);
        assert!(matches!(reply.kind, RpcKind::Pong { rpc_id: pid } if pid == rpc_id));
        assert_eq!(reply.sender.node_id, pm.my_info.node_id);
    }

    #[tokio::test]
    async fn store_then_find_value_round_trip() {
        let mut pm = headless(20, 3).await;

        let src_id = NodeId::new_random();
        let src: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let sender = NodeInfo {
            ip_address: src.ip(),
            udp_port: src.port(),
            node_id: src_id,
        };

        let key = DhtKey::from("world");
        let value = b"hello".to_vec();
        pm.handle_message(
            Rpc {
                sender,
                receiver: pm.my_info.node_id,
                kind: RpcKind::Store {
                    key: key.clone(),
                    value: value.clone(),
                },
            },
            src,
        );

        assert_eq!(pm.records.get(&key), Some(&value));

        let effects = pm.handle_message(
            Rpc {
                sender,
                receiver: pm.my_info.node_id,
                kind: RpcKind::FindValue { key: key.clone() },
            },
            src,
        );
        let sends = sends_of(effects);
        assert_eq!(sends.len(), 1);
        match &sends[0].1.kind {
            RpcKind::ValueFound { key: k, value: v } => {
                assert_eq!(*k, key);
                assert_eq!(*v, value);
            }
            other => panic!("expected ValueFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_value_miss_returns_closest_nodes() {
        let mut pm = headless(20, 3).await;
        let key = DhtKey::from("missing");

        let src_id = NodeId::new_random();
        let src: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let effects = pm.handle_message(
            Rpc {
                sender: NodeInfo {
                    ip_address: src.ip(),
                    udp_port: src.port(),
                    node_id: src_id,
                },
                receiver: pm.my_info.node_id,
                kind: RpcKind::FindValue { key: key.clone() },
            },
            src,
        );

        let sends = sends_of(effects);
        assert_eq!(sends.len(), 1);
        match &sends[0].1.kind {
            RpcKind::Nodes { target, .. } => assert_eq!(*target, NodeId::from_key(&key)),
            other => panic!("expected Nodes, got {other:?}"),
        }
        assert!(pm.routing_table.contains(src_id));
    }

    #[tokio::test]
    async fn get_sends_alpha_queries_to_closest() {
        let mut pm = headless(20, 3).await;

        let p1 = make_peer(1, 5001, 0x00);
        let p2 = make_peer(2, 5002, 0x01);
        let p3 = make_peer(3, 5003, 0x02);
        let p4 = make_peer(4, 5004, 0x80); // far
        for p in [p1, p2, p3, p4] {
            pm.add_known_peer(p);
        }

        // SHA-1 of the key is effectively a random target; with only four
        // peers the three queried ones are simply the three closest.
        let key = DhtKey::from("some-key");
        let target = NodeId::from_key(&key);
        let (tx, _rx) = oneshot::channel();
        let effects = pm.handle_command(Command::Get { key, tx_value: tx });

        let dests: std::collections::HashSet<SocketAddr> = sends_of(effects)
            .into_iter()
            .filter(|(_, rpc)| matches!(rpc.kind, RpcKind::FindValue { .. }))
            .map(|(addr, _)| addr)
            .collect();
        assert_eq!(dests.len(), 3, "alpha queries go out");

        let expected: std::collections::HashSet<SocketAddr> = pm
            .routing_table
            .closest(target, 3)
            .iter()
            .map(addr_of)
            .collect();
        assert_eq!(dests, expected);
    }

    #[tokio::test]
    async fn get_served_locally_without_queries() {
        let mut pm = headless(20, 3).await;
        pm.add_known_peer(make_peer(1, 5001, 0x00));
        let key = DhtKey::from("local");
        pm.records.insert(key.clone(), b"here".to_vec());

        let (tx, rx) = oneshot::channel();
        let effects = pm.handle_command(Command::Get { key, tx_value: tx });
        assert!(sends_of(effects).is_empty());
        assert_eq!(rx.await.unwrap(), Some(b"here".to_vec()));
    }

    #[tokio::test]
    async fn nodes_reply_tops_up_to_new_candidate() {
        let mut pm = headless(20, 2).await;

        let target = id_with_first_byte(0x00);
        let p1 = make_peer(1, 6001, 0x00);
        let p2 = make_peer(2, 6002, 0x01);
        pm.add_known_peer(p1);
        pm.add_known_peer(p2);

        let (tx, _rx) = oneshot::channel();
        let _ = pm.handle_command(Command::FindNode {
            target,
            tx_nodes: tx,
        });

        // p1 introduces p_new; the freed slot should query it.
        let p_new = make_peer(3, 6003, 0x02);
        let effects = pm.handle_message(
            Rpc {
                sender: p1,
                receiver: pm.my_info.node_id,
                kind: RpcKind::Nodes {
                    target,
                    nodes: vec![p_new],
                },
            },
            addr_of(&p1),
        );

        let sent_to_new = sends_of(effects)
            .iter()
            .any(|(addr, rpc)| *addr == addr_of(&p_new) && matches!(rpc.kind, RpcKind::FindNode { .. }));
        assert!(sent_to_new, "new candidate gets queried");
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_timeout_tops_up_next_peer() {
        let mut pm = headless(20, 2).await;

        let target = id_with_first_byte(0x00);
        let p1 = make_peer(1, 6101, 0x00);
        let p2 = make_peer(2, 6102, 0x01);
        let p3 = make_peer(3, 6103, 0x80); // far, not in the initial two
        for p in [p1, p2, p3] {
            pm.add_known_peer(p);
        }

        let (tx, _rx) = oneshot::channel();
        let effects = pm.handle_command(Command::FindNode {
            target,
            tx_nodes: tx,
        });
        assert_eq!(sends_of(effects).len(), 2, "initial sends match alpha");

        tokio::time::advance(LOOKUP_RPC_TIMEOUT + Duration::from_millis(1)).await;
        let effects = pm.sweep_timeouts_and_topup(Instant::now());

        let sent_to_p3 = sends_of(effects)
            .iter()
            .any(|(addr, rpc)| *addr == addr_of(&p3) && matches!(rpc.kind, RpcKind::FindNode { .. }));
        assert!(sent_to_p3, "timeout frees slots for the next candidate");
    }

    #[tokio::test]
    async fn lookup_finishes_when_shortlist_stops_improving() {
        let mut pm = headless(20, 2).await;

        let target = id_with_first_byte(0x00);
        let p1 = make_peer(1, 9001, 0x00);
        let p2 = make_peer(2, 9002, 0x01);
        pm.add_known_peer(p1);
        pm.add_known_peer(p2);

        let (tx, rx) = oneshot::channel();
        let effects = pm.handle_command(Command::FindNode {
            target,
            tx_nodes: tx,
        });
        assert_eq!(sends_of(effects).len(), 2);

        // Both peers answer with nothing new.
        for p in [p1, p2] {
            let effects = pm.handle_message(
                Rpc {
                    sender: p,
                    receiver: pm.my_info.node_id,
                    kind: RpcKind::Nodes {
                        target,
                        nodes: vec![p1, p2],
                    },
                },
                addr_of(&p),
            );
            let queries = sends_of(effects)
                .into_iter()
                .filter(|(_, rpc)| matches!(rpc.kind, RpcKind::FindNode { .. }))
                .count();
            assert_eq!(queries, 0, "no further queries once the list is stable");
        }

        assert!(pm.pending_lookups.is_empty(), "lookup removed on convergence");
        let mut nodes = rx.await.unwrap();
        nodes.sort_by_key(|n| n.udp_port);
        assert_eq!(nodes, vec![p1, p2]);
    }

    #[tokio::test]
    async fn put_stores_to_converged_shortlist_and_locally() {
        let mut pm = headless(20, 2).await;

        let p1 = make_peer(1, 9101, 0x00);
        let p2 = make_peer(2, 9102, 0x01);
        pm.add_known_peer(p1);
        pm.add_known_peer(p2);

        let key = DhtKey::from("replicate-me");
        let target = NodeId::from_key(&key);
        let value = b"payload".to_vec();
        let (tx, rx) = oneshot::channel();
        let effects = pm.handle_command(Command::Put {
            key: key.clone(),
            value: value.clone(),
            tx_done: tx,
        });
        assert_eq!(sends_of(effects).len(), 2, "alpha-capped FindNode fan-out");

        let mut store_dests = std::collections::HashSet::new();
        for p in [p1, p2] {
            let effects = pm.handle_message(
                Rpc {
                    sender: p,
                    receiver: pm.my_info.node_id,
                    kind: RpcKind::Nodes {
                        target,
                        nodes: vec![p1, p2],
                    },
                },
                addr_of(&p),
            );
            for (addr, rpc) in sends_of(effects) {
                if let RpcKind::Store { key: k, value: v } = rpc.kind {
                    assert_eq!(k, key);
                    assert_eq!(v, value);
                    store_dests.insert(addr);
                }
            }
        }

        let expected: std::collections::HashSet<SocketAddr> =
            [addr_of(&p1), addr_of(&p2)].into_iter().collect();
        assert_eq!(store_dests, expected, "STORE reaches the final shortlist");
        assert_eq!(pm.records.get(&key), Some(&value), "originator keeps a replica");
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn value_found_resolves_lookup_and_caches_at_non_holder() {
        let mut pm = headless(20, 1).await;

        let key = DhtKey::from("cached");
        let target = NodeId::from_key(&key);
        let value = b"v".to_vec();

        let p1 = make_peer(1, 8001, 0x40);
        let p2 = make_peer(2, 8002, 0x00);
        pm.add_known_peer(p1);

        let (tx, rx) = oneshot::channel();
        let _ = pm.handle_command(Command::Get {
            key: key.clone(),
            tx_value: tx,
        });

        // p1 does not hold the value and points at p2.
        let effects = pm.handle_message(
            Rpc {
                sender: p1,
                receiver: pm.my_info.node_id,
                kind: RpcKind::Nodes {
                    target,
                    nodes: vec![p2],
                },
            },
            addr_of(&p1),
        );
        let queried_p2 = sends_of(effects)
            .iter()
            .any(|(addr, rpc)| *addr == addr_of(&p2) && matches!(rpc.kind, RpcKind::FindValue { .. }));
        assert!(queried_p2);

        // p2 produces the value; p1 (the non-holder) gets the caching STORE.
        let effects = pm.handle_message(
            Rpc {
                sender: p2,
                receiver: pm.my_info.node_id,
                kind: RpcKind::ValueFound {
                    key: key.clone(),
                    value: value.clone(),
                },
            },
            addr_of(&p2),
        );

        assert_eq!(rx.await.unwrap(), Some(value.clone()));
        assert!(pm.pending_lookups.is_empty());
        assert_eq!(pm.records.get(&key), Some(&value), "value cached locally");

        let cached_at_p1 = sends_of(effects)
            .iter()
            .any(|(addr, rpc)| *addr == addr_of(&p1) && matches!(rpc.kind, RpcKind::Store { .. }));
        assert!(cached_at_p1, "caching STORE goes to the closest non-holder");
    }

    #[tokio::test]
    async fn connect_unknown_peer_fails_fast() {
        let mut pm = headless(20, 3).await;
        let (tx, rx) = oneshot::channel();
        let effects = pm.handle_command(Command::Connect {
            id: NodeId::new_random(),
            tx_result: tx,
        });
        assert!(effects.is_empty());
        assert_eq!(rx.await.unwrap(), PunchOutcome::Failed);
    }

    #[tokio::test]
    async fn connect_known_peer_sends_request_and_starts_ladder() {
        let mut pm = headless(20, 3).await;
        let peer = make_peer(1, 7001, 0x01);
        pm.add_known_peer(peer);

        let (tx, _rx) = oneshot::channel();
        let effects = pm.handle_command(Command::Connect {
            id: peer.node_id,
            tx_result: tx,
        });

        let mut saw_request = false;
        let mut saw_ladder = false;
        for effect in effects {
            match effect {
                Effect::Send { addr, bytes } => {
                    assert_eq!(addr, addr_of(&peer));
                    assert!(matches!(decode(&bytes).kind, RpcKind::HolePunchRequest));
                    saw_request = true;
                }
                Effect::StartHolePunch { target, .. } => {
                    assert_eq!(target.node_id, peer.node_id);
                    saw_ladder = true;
                }
                other => panic!("unexpected effect {other:?}"),
            }
        }
        assert!(saw_request && saw_ladder);
    }

    #[tokio::test]
    async fn hole_punch_request_spawns_responder_and_acks() {
        let mut pm = headless(20, 3).await;
        let requester_id = NodeId::new_random();
        let src: SocketAddr = "127.0.0.1:7100".parse().unwrap();

        let effects = pm.handle_message(
            Rpc {
                sender: NodeInfo {
                    ip_address: src.ip(),
                    udp_port: src.port(),
                    node_id: requester_id,
                },
                receiver: pm.my_info.node_id,
                kind: RpcKind::HolePunchRequest,
            },
            src,
        );

        let mut saw_response = false;
        let mut saw_responder = false;
        for effect in effects {
            match effect {
                Effect::Send { addr, bytes } => {
                    assert_eq!(addr, src);
                    assert!(matches!(decode(&bytes).kind, RpcKind::HolePunchResponse));
                    saw_response = true;
                }
                Effect::RespondHolePunch { requester } => {
                    assert_eq!(requester.node_id, requester_id);
                    saw_responder = true;
                }
                other => panic!("unexpected effect {other:?}"),
            }
        }
        assert!(saw_response && saw_responder);
    }

    #[tokio::test]
    async fn probe_datagrams_get_acked() {
        let mut pm = headless(20, 3).await;
        let src: SocketAddr = "127.0.0.1:7200".parse().unwrap();

        for probe in [&b"DIRECT_CONNECT"[..], b"LOCAL_CONNECT", b"STUN_CONNECT 1.2.3.4:5"] {
            let effects = pm.handle_datagram(probe, src);
            match &effects[..] {
                [Effect::Send { addr, bytes }] => {
                    assert_eq!(*addr, src);
                    assert_eq!(bytes, PROBE_ACK);
                }
                other => panic!("expected one ack, got {other:?}"),
            }
        }

        // Response-side probe traffic and garbage are dropped silently.
        for noise in [&b"LOCAL_CONNECT_RESPONSE"[..], b"PROBE_ACK", b"\x01\x02junk"] {
            assert!(pm.handle_datagram(noise, src).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_republishes_then_expires() {
        let mut pm = headless(20, 3).await;
        // No peers: replication cannot go anywhere, so an aged record must
        // be gone after the pass rather than resurrected.
        let key = DhtKey::from("stale");
        pm.records.insert(key.clone(), b"v".to_vec());

        tokio::time::advance(crate::core::storage::RECORD_TTL + Duration::from_millis(1)).await;
        let effects = pm.run_maintenance();
        assert!(sends_of(effects).is_empty());
        assert!(!pm.records.contains(&key), "expired record is dropped");
    }

    #[tokio::test]
    async fn maintenance_refresh_targets_every_bucket() {
        let mut pm = headless(20, 1).await;
        let peer = make_peer(1, 7301, 0x01);
        pm.add_known_peer(peer);

        let effects = pm.run_maintenance();
        // One peer known: every refresh lookup queries it once.
        let queries = sends_of(effects)
            .into_iter()
            .filter(|(_, rpc)| matches!(rpc.kind, RpcKind::FindNode { .. }))
            .count();
        assert_eq!(queries, ID_BITS);
        assert_eq!(pm.pending_lookups.len(), ID_BITS);
    }

    #[tokio::test]
    async fn truncated_datagram_is_dropped() {
        // A datagram clipped at the 4 KiB receive buffer no longer decodes
        // and must vanish without a reply.
        let mut pm = headless(20, 3).await;
        let src: SocketAddr = "127.0.0.1:7400".parse().unwrap();
        let effects = pm.handle_datagram(&vec![0xC1; RECV_BUFFER], src);
        assert!(effects.is_empty());
    }
}
