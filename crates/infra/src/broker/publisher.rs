//! Confirmed, persistent publishing to the main exchange.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use castline_core::{JobId, TraceId};
use castline_events::{
    encode, BrokerChannel, BrokerConnector, BrokerError, CodecError, OutgoingMessage, QueueMessage,
    SubmitMessage, UpdateMessage, CONTENT_TYPE_JSON,
};

use super::topology::TopologyManager;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Publishes onto the main exchange of a [`TopologyManager`].
///
/// Every call waits for the broker confirm (bounded by the configured
/// timeout). Failures propagate unchanged; there is no internal retry.
pub struct Publisher<K: BrokerConnector> {
    topology: Arc<TopologyManager<K>>,
}

impl<K: BrokerConnector> Clone for Publisher<K> {
    fn clone(&self) -> Self {
        Self {
            topology: self.topology.clone(),
        }
    }
}

impl<K: BrokerConnector> Publisher<K> {
    pub fn new(topology: Arc<TopologyManager<K>>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Arc<TopologyManager<K>> {
        &self.topology
    }

    #[instrument(
        skip_all,
        fields(routing_key = %routing_key, trace_id = %trace_id, job_id = %job_id),
        err
    )]
    pub async fn publish<M: Serialize + Sync>(
        &self,
        routing_key: &str,
        message: &M,
        trace_id: TraceId,
        job_id: JobId,
    ) -> Result<(), PublishError> {
        let config = self.topology.config();
        let body = encode(message)?;
        let outgoing = OutgoingMessage {
            body,
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
        };

        let channel = self.topology.channel()?;
        let timeout = config.publish_confirm_timeout;
        match tokio::time::timeout(timeout, channel.publish(&config.exchange, routing_key, outgoing)).await {
            Ok(result) => result?,
            Err(_) => return Err(BrokerError::ConfirmTimeout(timeout).into()),
        }

        debug!("message confirmed");
        Ok(())
    }

    async fn publish_message<M: QueueMessage>(&self, routing_key: &str, message: &M) -> Result<(), PublishError> {
        self.publish(routing_key, message, message.trace_id(), message.job_id())
            .await
    }

    /// Publish on the submit routing key.
    pub async fn publish_submit(&self, message: &SubmitMessage) -> Result<(), PublishError> {
        let routing_key = self.topology.config().submit_routing_key.clone();
        self.publish_message(&routing_key, message).await
    }

    /// Publish on the update routing key.
    pub async fn publish_update(&self, message: &UpdateMessage) -> Result<(), PublishError> {
        let routing_key = self.topology.config().update_routing_key.clone();
        self.publish_message(&routing_key, message).await
    }
}
