use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::core::identifier::{DhtKey, NodeId, NodeInfo};
use crate::core::storage::Value;

/// Response window for each outstanding lookup RPC.
pub(super) const LOOKUP_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(super) enum LookupKind {
    /// FIND_NODE toward a target identifier.
    Node,
    /// FIND_VALUE for a key; the lookup target is the key's hash.
    Value(DhtKey),
}

/// What to do once a lookup converges. Owning the caller's oneshot here
/// ties the callback's lifetime to the lookup itself.
#[derive(Debug)]
pub(super) enum LookupAction {
    Get {
        tx_value: oneshot::Sender<Option<Value>>,
    },
    Put {
        key: DhtKey,
        value: Value,
        tx_done: Option<oneshot::Sender<bool>>,
    },
    FindNodes {
        tx_nodes: oneshot::Sender<Vec<NodeInfo>>,
    },
    Bootstrap,
    Refresh,
}

impl LookupAction {
    /// Resolve the caller with a failure, consuming the action.
    pub(super) fn fail(self) {
        match self {
            LookupAction::Get { tx_value } => {
                let _ = tx_value.send(None);
            }
            LookupAction::Put { tx_done, .. } => {
                if let Some(tx) = tx_done {
                    let _ = tx.send(false);
                }
            }
            LookupAction::FindNodes { tx_nodes } => {
                let _ = tx_nodes.send(Vec::new());
            }
            LookupAction::Bootstrap | LookupAction::Refresh => {}
        }
    }
}

/// One iterative α-parallel lookup: a shortlist of the closest known
/// candidates, the set already queried, and the queries still in flight.
#[derive(Debug)]
pub(super) struct Lookup {
    pub(super) k: usize,
    pub(super) alpha: usize,
    pub(super) my_info: NodeInfo,
    pub(super) target: NodeId,
    pub(super) kind: LookupKind,
    pub(super) short_list: Vec<NodeInfo>,
    pub(super) already_queried: HashSet<NodeId>,
    pub(super) in_flight: HashMap<NodeId, Instant>,
    // Peers that answered a value lookup with Nodes, i.e. did not hold the
    // value. The closest of them receives a caching STORE on success.
    non_holders: Vec<NodeInfo>,
    created_at: Instant,
}

impl Lookup {
    pub(super) fn new(
        k: usize,
        alpha: usize,
        my_info: NodeInfo,
        target: NodeId,
        kind: LookupKind,
        initial_candidates: Vec<NodeInfo>,
    ) -> Self {
        let mut short_list = initial_candidates;
        short_list.retain(|n| n.node_id != my_info.node_id);
        short_list.sort_by_key(|n| (n.node_id.distance(&target), n.node_id));
        Lookup {
            k,
            alpha,
            my_info,
            target,
            kind,
            short_list,
            already_queried: HashSet::new(),
            in_flight: HashMap::new(),
            non_holders: Vec::new(),
            created_at: Instant::now(),
        }
    }

    /// Record a responder that returned Nodes rather than the value.
    pub(super) fn record_non_holder(&mut self, responder: NodeInfo) {
        if responder.node_id == self.my_info.node_id {
            return;
        }
        if !self.non_holders.iter().any(|n| n.node_id == responder.node_id) {
            self.non_holders.push(responder);
        }
    }

    /// The closest recorded non-holder to the target, if any.
    pub(super) fn best_non_holder(&self) -> Option<NodeInfo> {
        self.non_holders
            .iter()
            .min_by_key(|n| n.node_id.distance(&self.target))
            .copied()
    }

    pub(super) fn on_response(&mut self, from: NodeId) {
        self.in_flight.remove(&from);
    }

    /// Issue queries until α are in flight, walking the shortlist closest
    /// first and skipping anyone already asked.
    pub(super) fn top_up_alpha_requests(&mut self) -> Vec<super::Effect> {
        let mut effects = Vec::new();

        let available: Vec<_> = self
            .short_list
            .iter()
            .filter(|c| !self.already_queried.contains(&c.node_id))
            .take(self.alpha.saturating_sub(self.in_flight.len()))
            .cloned()
            .collect();

        for info in available {
            let kind = match &self.kind {
                LookupKind::Node => super::RpcKind::FindNode { target: self.target },
                LookupKind::Value(key) => super::RpcKind::FindValue { key: key.clone() },
            };
            let rpc = super::Rpc {
                sender: self.my_info,
                receiver: info.node_id,
                kind,
            };
            let bytes = rmp_serde::to_vec(&rpc).expect("serialize lookup query");
            effects.push(super::Effect::Send {
                addr: SocketAddr::new(info.ip_address, info.udp_port),
                bytes,
            });

            let deadline = Instant::now() + LOOKUP_RPC_TIMEOUT;
            self.in_flight.insert(info.node_id, deadline);
            self.already_queried.insert(info.node_id);
        }
        effects
    }

    /// Merge a Nodes response into the shortlist, keeping the k closest
    /// unique candidates.
    pub(super) fn merge_new_nodes(&mut self, nodes: Vec<NodeInfo>) {
        self.short_list.extend(nodes);

        let mut seen = HashSet::new();
        self.short_list.retain(|n| seen.insert(n.node_id));
        self.short_list.retain(|n| n.node_id != self.my_info.node_id);

        self.short_list
            .sort_by_key(|n| (n.node_id.distance(&self.target), n.node_id));

        if self.short_list.len() > self.k {
            self.short_list.truncate(self.k);
        }
    }

    /// Drop in-flight queries whose response window has passed. A peer that
    /// never answered also leaves the shortlist, so the final report only
    /// carries peers that responded or were never asked to.
    pub(super) fn sweep_expired(&mut self, now: Instant) {
        let expired: Vec<NodeId> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.in_flight.remove(&id);
            self.short_list.retain(|n| n.node_id != id);
        }
    }

    /// A lookup is done once every shortlist member has been asked and no
    /// answer is outstanding. A lookup that has not yet queried anyone (a
    /// bootstrap waiting on its seeds) gets one RPC window before it can be
    /// declared dry.
    pub(super) fn is_finished(&self, now: Instant) -> bool {
        if !self.in_flight.is_empty() {
            return false;
        }
        if self.already_queried.is_empty() {
            return now >= self.created_at + LOOKUP_RPC_TIMEOUT;
        }
        self.short_list
            .iter()
            .all(|n| self.already_queried.contains(&n.node_id))
    }
}

#[derive(Debug)]
pub(super) struct PendingLookup {
    pub(super) lookup: Lookup,
    pub(super) action: LookupAction,
}
