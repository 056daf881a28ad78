use std::net::SocketAddr;
use tokio::sync::oneshot;

use crate::core::identifier::{DhtKey, NodeId, NodeInfo};
use crate::core::storage::Value;
use crate::nat::{ConnectionInfo, PunchOutcome};

/// Commands are the user-facing API into the protocol event loop.
///
/// A higher-level handle (`Dht`) holds an `mpsc::Sender<Command>` and sends
/// requests into the single protocol task, which owns all socket I/O,
/// routing-table state, and lookup state. Replies travel back over the
/// oneshot carried in each command, so callers never block the loop.
pub enum Command {
    /// Replicate `value` under `key`: node-lookup the key's hash, then send
    /// `Store` to the k closest peers and keep a local replica. The oneshot
    /// reports whether replication was dispatched.
    Put {
        key: DhtKey,
        value: Value,
        tx_done: oneshot::Sender<bool>,
    },
    /// Value lookup for `key`. Completed with `Some(value)` as soon as any
    /// peer returns the value, or `None` when the lookup converges dry.
    Get {
        key: DhtKey,
        tx_value: oneshot::Sender<Option<Value>>,
    },
    /// Iterative node lookup; completes with the k closest peers found.
    FindNode {
        target: NodeId,
        tx_nodes: oneshot::Sender<Vec<NodeInfo>>,
    },
    /// Ping a peer already present in the routing table. Completes `true`
    /// on a pong within the RPC timeout.
    Ping {
        id: NodeId,
        tx_alive: oneshot::Sender<bool>,
    },
    /// Hole-punch toward a peer in the routing table. The request RPC goes
    /// out over the DHT socket; the punch ladder itself runs on its own
    /// sockets and resolves the oneshot exactly once.
    Connect {
        id: NodeId,
        tx_result: oneshot::Sender<PunchOutcome>,
    },
    /// Initiate bootstrap: a self-lookup seeded by `FindNode(self)` to the
    /// given addresses, populating the routing table per the join procedure.
    Bootstrap { addrs: Vec<SocketAddr> },
    /// Snapshot of the node's identity, connection info, and routing view.
    Info { tx_report: oneshot::Sender<NodeReport> },
    /// Stop the event loop. Outstanding lookups fail their callbacks.
    Shutdown,

    /// Test/debug helper: does this node currently hold a value for `key`?
    DebugHasValue {
        key: DhtKey,
        tx_has: oneshot::Sender<bool>,
    },
}

/// Answer to [`Command::Info`].
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub my_info: NodeInfo,
    pub connection: ConnectionInfo,
    pub peers: Vec<NodeInfo>,
    pub stored_records: usize,
}
