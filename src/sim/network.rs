//! Shared registry of simulated nodes, plus fault injection and call
//! accounting.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};

use super::node::NodeShared;

#[derive(Default)]
struct NetworkInner {
    nodes: RwLock<HashMap<String, Weak<NodeShared>>>,
    advertise_calls: Mutex<HashMap<String, usize>>,
    withdraw_calls: Mutex<HashMap<String, usize>>,
    listen_faults: Mutex<HashMap<usize, io::ErrorKind>>,
    advertise_faults: Mutex<HashMap<String, usize>>,
}

/// Handle to the simulated network. Clones share one registry.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<NetworkInner>,
}

impl SimNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_node(&self, host: &str, node: &Arc<NodeShared>) {
        self.inner
            .nodes
            .write()
            .insert(host.to_string(), Arc::downgrade(node));
    }

    pub(crate) fn deregister_node(&self, host: &str) {
        self.inner.nodes.write().remove(host);
    }

    pub(crate) fn node(&self, host: &str) -> Option<Arc<NodeShared>> {
        self.inner.nodes.read().get(host).and_then(Weak::upgrade)
    }

    /// Hosts of live, registered nodes, sorted.
    pub fn live_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .inner
            .nodes
            .read()
            .iter()
            .filter(|(_, node)| node.strong_count() > 0)
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Make the next `listen` of the node with ordinal `index` fail with
    /// `kind`.
    pub fn fail_listen(&self, index: usize, kind: io::ErrorKind) {
        self.inner.listen_faults.lock().insert(index, kind);
    }

    pub(crate) fn take_listen_fault(&self, index: usize) -> Option<io::ErrorKind> {
        self.inner.listen_faults.lock().remove(&index)
    }

    /// Reject the next `times` advertise calls for `service`.
    pub fn fail_advertise(&self, service: &str, times: usize) {
        self.inner
            .advertise_faults
            .lock()
            .insert(service.to_string(), times);
    }

    pub(crate) fn take_advertise_fault(&self, service: &str) -> bool {
        let mut faults = self.inner.advertise_faults.lock();
        match faults.get_mut(service) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn record_advertise(&self, service: &str) {
        *self
            .inner
            .advertise_calls
            .lock()
            .entry(service.to_string())
            .or_default() += 1;
    }

    pub(crate) fn record_withdraw(&self, service: &str) {
        *self
            .inner
            .withdraw_calls
            .lock()
            .entry(service.to_string())
            .or_default() += 1;
    }

    /// Advertise calls that reached the mesh for `service`.
    pub fn advertise_calls(&self, service: &str) -> usize {
        self.inner
            .advertise_calls
            .lock()
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    /// Withdraw calls that reached the mesh for `service`.
    pub fn withdraw_calls(&self, service: &str) -> usize {
        self.inner
            .withdraw_calls
            .lock()
            .get(service)
            .copied()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("nodes", &self.inner.nodes.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_fault_fires_once() {
        let network = SimNetwork::new();
        network.fail_listen(1, io::ErrorKind::ConnectionRefused);
        assert_eq!(network.take_listen_fault(0), None);
        assert_eq!(
            network.take_listen_fault(1),
            Some(io::ErrorKind::ConnectionRefused)
        );
        assert_eq!(network.take_listen_fault(1), None);
    }

    #[test]
    fn test_advertise_fault_counts_down() {
        let network = SimNetwork::new();
        network.fail_advertise("bob", 2);
        assert!(network.take_advertise_fault("bob"));
        assert!(network.take_advertise_fault("bob"));
        assert!(!network.take_advertise_fault("bob"));
        assert!(!network.take_advertise_fault("steve"));
    }

    #[test]
    fn test_call_accounting() {
        let network = SimNetwork::new();
        network.record_advertise("bob");
        network.record_advertise("bob");
        network.record_withdraw("bob");
        assert_eq!(network.advertise_calls("bob"), 2);
        assert_eq!(network.withdraw_calls("bob"), 1);
        assert_eq!(network.advertise_calls("steve"), 0);
    }
}
