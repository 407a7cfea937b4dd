use std::collections::BTreeMap;
use std::fmt;

use transport_bus::QoS;

pub const NAMESPACE_SEPARATOR: char = '/';

/// Logical topics of the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicName {
    Control,
    Imaging,
    Deployment,
    Params,
}

impl TopicName {
    pub const ALL: [TopicName; 4] = [
        TopicName::Control,
        TopicName::Imaging,
        TopicName::Deployment,
        TopicName::Params,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TopicName::Control => "control",
            TopicName::Imaging => "imaging",
            TopicName::Deployment => "deployment",
            TopicName::Params => "params",
        }
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing attributes of one topic for one installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicConfig {
    pub name: TopicName,
    pub qos: QoS,
    /// Prefix the path with the client identity.
    pub local_namespace: bool,
    /// The local process subscribes to this topic.
    pub subscribe: bool,
    /// Payload traffic is logged at info level.
    pub log: bool,
}

impl TopicConfig {
    /// Builds the fully-qualified topic path for `identity`.
    pub fn resolve(&self, identity: &str) -> String {
        if self.local_namespace {
            format!("{identity}{NAMESPACE_SEPARATOR}{}", self.name)
        } else {
            self.name.as_str().to_string()
        }
    }
}

/// Client identity encoded in the first segment of a topic path.
pub fn target_of(path: &str) -> &str {
    path.split(NAMESPACE_SEPARATOR).next().unwrap_or(path)
}

/// Immutable topic table, fixed when a client is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTable {
    topics: BTreeMap<TopicName, TopicConfig>,
}

impl TopicTable {
    pub fn new(configs: impl IntoIterator<Item = TopicConfig>) -> Self {
        Self {
            topics: configs.into_iter().map(|config| (config.name, config)).collect(),
        }
    }

    /// Topics as seen by a device agent.
    pub fn agent() -> Self {
        Self::new([
            namespaced(TopicName::Control, true, true),
            namespaced(TopicName::Imaging, false, false),
            namespaced(TopicName::Deployment, true, true),
            namespaced(TopicName::Params, false, true),
        ])
    }

    /// Topics as seen by an acquisition orchestrator.
    pub fn orchestrator() -> Self {
        Self::new([
            namespaced(TopicName::Control, false, true),
            namespaced(TopicName::Imaging, true, false),
            namespaced(TopicName::Deployment, false, true),
            namespaced(TopicName::Params, true, true),
        ])
    }

    pub fn get(&self, name: TopicName) -> Option<&TopicConfig> {
        self.topics.get(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicConfig> {
        self.topics.values()
    }

    pub fn subscribed(&self) -> impl Iterator<Item = &TopicConfig> {
        self.topics.values().filter(|config| config.subscribe)
    }
}

fn namespaced(name: TopicName, subscribe: bool, log: bool) -> TopicConfig {
    TopicConfig {
        name,
        qos: QoS::ExactlyOnce,
        local_namespace: true,
        subscribe,
        log,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_topics_are_prefixed_with_identity() {
        let control = TopicTable::agent()
            .get(TopicName::Control)
            .copied()
            .expect("control configured");
        assert_eq!(control.resolve("cam-1"), "cam-1/control");
        assert_eq!(control.resolve("cam-1"), control.resolve("cam-1"));
        assert_ne!(control.resolve("cam-1"), control.resolve("cam-2"));
    }

    #[test]
    fn global_topics_ignore_identity() {
        let config = TopicConfig {
            name: TopicName::Imaging,
            qos: QoS::AtMostOnce,
            local_namespace: false,
            subscribe: false,
            log: false,
        };
        assert_eq!(config.resolve("cam-1"), "imaging");
        assert_eq!(config.resolve("cam-2"), "imaging");
    }

    #[test]
    fn target_is_first_path_segment() {
        assert_eq!(target_of("cam-1/params"), "cam-1");
        assert_eq!(target_of("params"), "params");
        assert_eq!(target_of(""), "");
    }

    #[test]
    fn every_role_uses_exactly_once_delivery() {
        for table in [TopicTable::agent(), TopicTable::orchestrator()] {
            assert_eq!(table.iter().count(), TopicName::ALL.len());
            assert!(table.iter().all(|config| config.qos == QoS::ExactlyOnce));
            assert!(table.iter().all(|config| config.local_namespace));
        }
    }

    #[test]
    fn subscriptions_follow_role() {
        let agent: Vec<_> = TopicTable::agent().subscribed().map(|c| c.name).collect();
        assert_eq!(agent, vec![TopicName::Control, TopicName::Deployment]);

        let host: Vec<_> = TopicTable::orchestrator()
            .subscribed()
            .map(|c| c.name)
            .collect();
        assert_eq!(host, vec![TopicName::Imaging, TopicName::Params]);

        let imaging = TopicTable::agent()
            .get(TopicName::Imaging)
            .copied()
            .expect("imaging configured");
        assert!(!imaging.log);
    }
}
