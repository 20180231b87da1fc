use crate::models::Metric;

/// Derives every topic the monitor publishes to from (prefix, hostname, metric).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
    discovery_prefix: String,
    node_id: String,
}

impl TopicBuilder {
    pub fn new(prefix: &str, discovery_prefix: &str, hostname: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
            node_id: sanitize_node_id(hostname),
        }
    }

    /// Sanitized hostname used inside topics and ids.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state_topic(&self, metric: Metric) -> String {
        format!("{}/{}/{}", self.prefix, self.node_id, metric.key())
    }

    /// JSON object with every reading of a cycle.
    pub fn aggregate_topic(&self) -> String {
        format!("{}/{}/state", self.prefix, self.node_id)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/{}/status", self.prefix, self.node_id)
    }

    pub fn unique_id(&self, metric: Metric) -> String {
        format!("{}_{}", self.node_id, metric.key())
    }

    pub fn discovery_topic(&self, metric: Metric) -> String {
        format!(
            "{}/{}/{}/config",
            self.discovery_prefix,
            metric.component(),
            self.unique_id(metric)
        )
    }
}

/// Replace everything outside `[A-Za-z0-9_-]` so the hostname is safe both as
/// a topic level and as a discovery object id.
fn sanitize_node_id(hostname: &str) -> String {
    let sanitized: String = hostname
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}
