//! Connection Manager: pooled, signed transports to remote tool servers.

pub mod endpoint;
pub mod ephemeral;
pub mod health;
pub mod persistent;
pub mod pool;
pub mod transport;

pub use endpoint::{
    normalize, AuthRequirement, EndpointClassifier, PoolKey, RemoteTarget, RequestProfile,
    ResolvedEndpoint, TransportKind,
};
pub use pool::{ConnectionLease, ConnectionManager, PoolStats, PooledConnection};
pub use transport::{Connector, HttpSender, Transport};

use async_trait::async_trait;
use std::sync::Arc;

use crate::types::Result;
use ephemeral::EphemeralTransport;
use persistent::PersistentTransport;

/// Production connector: both transports over one signing HTTP sender.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    sender: Arc<HttpSender>,
}

impl HttpConnector {
    pub fn new(sender: Arc<HttpSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &ResolvedEndpoint) -> Result<Arc<dyn Transport>> {
        let sender = Arc::clone(&self.sender);
        let transport: Arc<dyn Transport> = match endpoint.key.transport {
            TransportKind::Ephemeral => Arc::new(EphemeralTransport::new(sender, endpoint.clone())),
            TransportKind::Persistent => {
                Arc::new(PersistentTransport::establish(sender, endpoint.clone()).await?)
            }
        };
        Ok(transport)
    }
}
