use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::core::identifier::{DhtKey, NodeId, NodeInfo};
use crate::core::routing_table::K;
use crate::core::storage::Value;
use crate::nat::stun::DEFAULT_REFLECTORS;
use crate::nat::{classify, NatType, PunchOutcome, SharedConnectionInfo};
use crate::protocol::{Command, NodeReport, ProtocolManager, ALPHA};

/// Async handle to a running DHT node. All calls are forwarded into the
/// protocol event loop and complete through per-request oneshot channels,
/// so none of them block the loop itself.
pub struct Dht {
    tx: mpsc::Sender<Command>,
    conn_info: SharedConnectionInfo,
    local_addr: SocketAddr,
    pub node_info: NodeInfo,
}

impl Dht {
    /// Bind a node and join the overlay through the given bootstrap
    /// addresses. With no addresses the node starts as a bootstrap itself.
    pub async fn start(bind_addr: &str, bootstrap_addrs: Vec<SocketAddr>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>(100);
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let manager = ProtocolManager::new(socket, rx, K, ALPHA)?;
        let node_info = manager.my_info;
        let conn_info = manager.connection_info();

        // The loop must be live before bootstrap replies can come back.
        tokio::spawn(manager.run());

        if !bootstrap_addrs.is_empty() {
            tx.send(Command::Bootstrap {
                addrs: bootstrap_addrs,
            })
            .await?;
        }

        Ok(Self {
            tx,
            conn_info,
            local_addr,
            node_info,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replicate `value` under `key` on the k closest peers. Resolves once
    /// the lookup converged and the STORE fan-out was dispatched; delivery
    /// itself stays best-effort.
    pub async fn put(&self, key: DhtKey, value: Value) -> anyhow::Result<bool> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx.send(Command::Put { key, value, tx_done }).await?;
        Ok(rx_done.await?)
    }

    /// Look up the value for `key`, if any node holds it.
    pub async fn get(&self, key: DhtKey) -> anyhow::Result<Option<Value>> {
        let (tx_value, rx_value) = oneshot::channel();
        self.tx.send(Command::Get { key, tx_value }).await?;
        Ok(rx_value.await?)
    }

    /// The k closest reachable peers to `target`.
    pub async fn find_node(&self, target: NodeId) -> anyhow::Result<Vec<NodeInfo>> {
        let (tx_nodes, rx_nodes) = oneshot::channel();
        self.tx.send(Command::FindNode { target, tx_nodes }).await?;
        Ok(rx_nodes.await?)
    }

    /// Ping a peer from the routing table; true iff it answered in time.
    pub async fn ping(&self, id: NodeId) -> anyhow::Result<bool> {
        let (tx_alive, rx_alive) = oneshot::channel();
        self.tx.send(Command::Ping { id, tx_alive }).await?;
        Ok(rx_alive.await?)
    }

    /// Hole-punch toward a peer from the routing table.
    pub async fn connect(&self, id: NodeId) -> anyhow::Result<PunchOutcome> {
        let (tx_result, rx_result) = oneshot::channel();
        self.tx.send(Command::Connect { id, tx_result }).await?;
        Ok(rx_result.await?)
    }

    pub async fn info(&self) -> anyhow::Result<NodeReport> {
        let (tx_report, rx_report) = oneshot::channel();
        self.tx.send(Command::Info { tx_report }).await?;
        Ok(rx_report.await?)
    }

    /// Classify our NAT against the public reflectors and record the
    /// verdict in the node's connection info.
    pub async fn detect_nat(&self) -> NatType {
        classify::detect_nat_type(&self.conn_info, DEFAULT_REFLECTORS).await
    }

    /// Discover our reflexive endpoint, recording it for the hole puncher.
    pub async fn public_endpoint(&self) -> Option<(std::net::Ipv4Addr, u16)> {
        classify::refresh_public_endpoint(&self.conn_info, DEFAULT_REFLECTORS)
            .await
            .ok()
    }

    /// Stop the protocol loop. Outstanding lookups fail their callbacks.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.tx.send(Command::Shutdown).await?;
        Ok(())
    }

    /// Test/debug helper: whether this node currently holds `key` locally.
    pub async fn debug_has_value(&self, key: DhtKey) -> anyhow::Result<bool> {
        let (tx_has, rx_has) = oneshot::channel();
        self.tx.send(Command::DebugHasValue { key, tx_has }).await?;
        Ok(rx_has.await?)
    }
}
