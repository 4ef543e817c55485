//! Redis key layout.
//!
//! Key names are stable across component versions; every process computes
//! them from these functions only.

/// Hash mapping device host to the node currently hosting its pinned worker.
pub const HOST_TO_NODE_MAP: &str = "netpulse:host_to_node_map";

/// Hash mapping node id to its inventory entry (capacity, count, heartbeat).
pub const NODE_INFO_MAP: &str = "netpulse:node_info_map";

/// List backing a named queue (`fifo` or `pinned_{host}`).
pub fn queue(name: &str) -> String {
    format!("netpulse:queue:{}", name)
}

/// Hash holding one job record.
pub fn job(id: &str) -> String {
    format!("netpulse:job:{}", id)
}

/// Hash of pinned-worker descriptors owned by one node, keyed by host.
pub fn node_workers(node_id: &str) -> String {
    format!("netpulse:node_workers:{}", node_id)
}

/// Request list consumed by one node worker.
pub fn node_requests(node_id: &str) -> String {
    format!("netpulse:node_requests:{}", node_id)
}

/// Reply list for one spawn/terminate request.
pub fn reply(request_id: &str) -> String {
    format!("netpulse:reply:{}", request_id)
}

/// Single-use boot payload stash for a freshly spawned pinned worker.
pub fn worker_boot(worker_id: &str) -> String {
    format!("netpulse:worker_boot:{}", worker_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_deterministic() {
        assert_eq!(queue("fifo"), "netpulse:queue:fifo");
        assert_eq!(queue("pinned_10.0.0.1"), "netpulse:queue:pinned_10.0.0.1");
        assert_eq!(job("abc"), "netpulse:job:abc");
        assert_eq!(node_workers("node-a"), "netpulse:node_workers:node-a");
        assert_eq!(HOST_TO_NODE_MAP, "netpulse:host_to_node_map");
        assert_eq!(NODE_INFO_MAP, "netpulse:node_info_map");
    }
}
