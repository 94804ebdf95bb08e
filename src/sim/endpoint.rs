//! Simulated auxiliary endpoint (remote or dummy).

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::debug;

use super::SimNetwork;
use crate::{
    channel::Channel,
    error::{Error, Result},
    mesh::{AdvertiseOp, AdvertiseRequest, AdvertiseResponse, Endpoint, HostList},
};

/// An endpoint outside the ring that reaches the mesh through its seeds.
pub struct SimEndpoint {
    name: String,
    seeds: HostList,
    network: SimNetwork,
    channel: Channel,
    host: OnceLock<String>,
    listener: Mutex<Option<TcpListener>>,
    destroyed: AtomicBool,
}

impl SimEndpoint {
    pub(crate) fn new(name: &str, seeds: HostList, network: SimNetwork) -> Self {
        Self {
            name: name.to_string(),
            seeds,
            network,
            channel: Channel::new(),
            host: OnceLock::new(),
            listener: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `destroy` has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Endpoint for SimEndpoint {
    async fn listen(&self) -> Result<SocketAddr> {
        if self.is_destroyed() {
            return Err(Error::Closed);
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        self.host.get_or_init(|| addr.to_string());
        *self.listener.lock() = Some(listener);
        Ok(addr)
    }

    fn host_port(&self) -> Option<String> {
        self.host.get().cloned()
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn advertise(
        &self,
        op: AdvertiseOp,
        request: AdvertiseRequest,
    ) -> Result<AdvertiseResponse> {
        if self.is_destroyed() {
            return Err(Error::Closed);
        }
        let Some(from) = self.host.get() else {
            return Err(Error::Rpc(format!("{} is not listening", self.name)));
        };
        let body = request.encode()?;

        for service in request.service_names() {
            match op {
                AdvertiseOp::Advertise => self.network.record_advertise(service),
                AdvertiseOp::Withdraw => self.network.record_withdraw(service),
            }
            if op == AdvertiseOp::Advertise && self.network.take_advertise_fault(service) {
                return Err(Error::Rpc(format!("{op} rejected for {service}")));
            }
        }

        // Hop onto the mesh on a later turn.
        tokio::task::yield_now().await;

        let entry = self
            .seeds
            .snapshot()
            .into_iter()
            .find_map(|host| self.network.node(&host));
        let Some(entry) = entry else {
            return Err(Error::Rpc(format!("{op}: no reachable mesh node")));
        };
        let response = entry.handle_advertise(op, &body, from, &self.channel)?;
        debug!(
            endpoint = %self.name,
            method = op.method(),
            connections = response.connection_count,
            "advertise delivered"
        );
        Ok(response)
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.close_all();
        self.listener.lock().take();
        debug!(endpoint = %self.name, "endpoint destroyed");
    }
}

impl std::fmt::Debug for SimEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEndpoint")
            .field("name", &self.name)
            .field("host", &self.host.get())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_advertise_requires_listen() {
        let endpoint = SimEndpoint::new("bob", HostList::new(), SimNetwork::new());
        let err = endpoint
            .advertise(AdvertiseOp::Advertise, AdvertiseRequest::single("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(_)));
    }

    #[tokio::test]
    async fn test_advertise_without_mesh_fails_but_is_counted() {
        let network = SimNetwork::new();
        let endpoint = SimEndpoint::new("bob", HostList::new(), network.clone());
        endpoint.listen().await.unwrap();
        assert!(endpoint
            .advertise(AdvertiseOp::Advertise, AdvertiseRequest::single("bob"))
            .await
            .is_err());
        assert_eq!(network.advertise_calls("bob"), 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let endpoint = SimEndpoint::new("dummy-0", HostList::new(), SimNetwork::new());
        endpoint.listen().await.unwrap();
        endpoint.destroy().await;
        endpoint.destroy().await;
        assert!(endpoint.is_destroyed());
        assert!(matches!(endpoint.listen().await, Err(Error::Closed)));
    }
}
