use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = BusError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BusError::InvalidQos(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus is not connected")]
    NotConnected,
    #[error("invalid qos level {0}")]
    InvalidQos(u8),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> BusResult<()>;
    /// Connection lifecycle. The receiver always holds the latest state.
    fn connection(&self) -> watch::Receiver<ConnectionState>;
}

/// In-process bus for tests and single-host fleets.
///
/// Publishing to a topic nobody listens on is not an error; the message is
/// simply discarded, the same way a broker drops traffic with no subscribers.
#[derive(Debug)]
pub struct LocalBus {
    topics: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>,
    state: watch::Sender<ConnectionState>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_state(ConnectionState::Connected)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus that rejects publishes until [`LocalBus::connect`] is called.
    pub fn disconnected() -> Self {
        Self::with_state(ConnectionState::Disconnected)
    }

    fn with_state(state: ConnectionState) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            topics: parking_lot::RwLock::new(std::collections::HashMap::new()),
            state,
        }
    }

    pub fn connect(&self) {
        self.state.send_replace(ConnectionState::Connected);
    }

    pub fn disconnect(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str, _qos: QoS) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let sender = self.sender_for(topic);
        // a send error only means there are no receivers right now
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("cam-1/control", QoS::ExactlyOnce);
        bus.publish("cam-1/control", Bytes::from_static(b"ping"), QoS::ExactlyOnce)
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "cam-1/control");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        assert_eq!(msg.qos, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn preserves_publish_order_per_topic() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("cam-1/imaging", QoS::ExactlyOnce);
        for n in 0..10u8 {
            bus.publish("cam-1/imaging", Bytes::from(vec![n]), QoS::ExactlyOnce)
                .expect("publish ok");
        }
        for n in 0..10u8 {
            let msg = sub.recv().await.expect("receive ok");
            assert_eq!(msg.payload.as_ref(), &[n]);
        }
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        bus.publish("nobody/listens", Bytes::from_static(b"x"), QoS::AtMostOnce)
            .expect("publish ok");
    }

    #[test]
    fn rejects_publish_while_disconnected() {
        let bus = LocalBus::disconnected();
        let err = bus
            .publish("cam-1/control", Bytes::from_static(b"x"), QoS::AtLeastOnce)
            .expect_err("publish must fail");
        assert!(matches!(err, BusError::NotConnected));
        bus.connect();
        bus.publish("cam-1/control", Bytes::from_static(b"x"), QoS::AtLeastOnce)
            .expect("publish ok after connect");
    }

    #[tokio::test]
    async fn reports_connection_changes() {
        let bus = LocalBus::new();
        let mut state = bus.connection();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);
        bus.disconnect();
        state.changed().await.expect("state change");
        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[test]
    fn qos_levels_round_trip_through_u8() {
        for level in 0..=2u8 {
            assert_eq!(QoS::try_from(level).expect("valid").level(), level);
        }
        assert!(matches!(QoS::try_from(3), Err(BusError::InvalidQos(3))));
    }
}
