use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tracing::{info, trace};
use transport_bus::{Bus, BusMessage, ConnectionState};

use crate::topics::{TopicConfig, TopicName, TopicTable};
use crate::{ProtoError, ProtoResult};

/// Bus handle bound to one client identity and one topic table.
///
/// Paths are resolved through the table, so callers only ever name logical
/// topics. Traffic on topics flagged `log` is reported at info level.
pub struct TopicClient<B: Bus> {
    bus: Arc<B>,
    identity: String,
    topics: TopicTable,
}

impl<B: Bus> TopicClient<B> {
    pub fn new(bus: Arc<B>, identity: impl Into<String>, topics: TopicTable) -> Self {
        Self {
            bus,
            identity: identity.into(),
            topics,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn topics(&self) -> &TopicTable {
        &self.topics
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn config(&self, name: TopicName) -> ProtoResult<&TopicConfig> {
        self.topics.get(name).ok_or(ProtoError::UnknownTopic(name))
    }

    /// Path of `name` in this client's own namespace.
    pub fn topic_path(&self, name: TopicName) -> ProtoResult<String> {
        self.topic_path_for(name, &self.identity)
    }

    /// Path of `name` in another client's namespace.
    pub fn topic_path_for(&self, name: TopicName, identity: &str) -> ProtoResult<String> {
        Ok(self.config(name)?.resolve(identity))
    }

    pub fn publish(&self, name: TopicName, payload: impl Into<Bytes>) -> ProtoResult<()> {
        self.publish_to(name, &self.identity, payload)
    }

    pub fn publish_to(
        &self,
        name: TopicName,
        identity: &str,
        payload: impl Into<Bytes>,
    ) -> ProtoResult<()> {
        let config = self.config(name)?;
        let path = config.resolve(identity);
        let payload = payload.into();
        if config.log {
            info!(
                target = "picam.bus",
                topic = %path,
                payload = %String::from_utf8_lossy(&payload),
                "publishing"
            );
        } else {
            trace!(target = "picam.bus", topic = %path, bytes = payload.len(), "publishing");
        }
        self.bus.publish(&path, payload, config.qos)?;
        Ok(())
    }

    pub fn subscribe(&self, name: TopicName) -> ProtoResult<broadcast::Receiver<BusMessage>> {
        self.subscribe_to(name, &self.identity)
    }

    pub fn subscribe_to(
        &self,
        name: TopicName,
        identity: &str,
    ) -> ProtoResult<broadcast::Receiver<BusMessage>> {
        let config = self.config(name)?;
        let path = config.resolve(identity);
        trace!(target = "picam.bus", topic = %path, qos = config.qos.level(), "subscribing");
        Ok(self.bus.subscribe(&path, config.qos))
    }

    /// Logs an inbound message according to its topic's `log` flag.
    pub fn log_inbound(&self, name: TopicName, message: &BusMessage) {
        let logged = self.topics.get(name).map(|config| config.log).unwrap_or(false);
        if logged {
            info!(
                target = "picam.bus",
                topic = %message.topic,
                payload = %String::from_utf8_lossy(&message.payload),
                "received"
            );
        } else {
            trace!(
                target = "picam.bus",
                topic = %message.topic,
                bytes = message.payload.len(),
                "received"
            );
        }
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.bus.connection()
    }
}

impl<B: Bus> Clone for TopicClient<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            identity: self.identity.clone(),
            topics: self.topics.clone(),
        }
    }
}
