//! Message Envelope
//!
//! The unit of exchange between cloud components and edge nodes. Envelopes are
//! immutable once built: every field is private and the builder methods consume
//! `self`, so handing a clone to another task is the only way to share one.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::types::{MessageId, NodeId, Timestamp};

/// Destination value marking an envelope as cloud-bound
pub const CLOUD_DESTINATION: &str = "";

// ----------------------------------------------------------------------------
// Operation
// ----------------------------------------------------------------------------

/// Logical verb of an envelope; the hub routes on it but never interprets it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Query,
    Response,
    Upload,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Query => "query",
            Operation::Response => "response",
            Operation::Upload => "upload",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// A routed message between the cloud and one edge node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<MessageId>,
    source: String,
    #[serde(default)]
    destination: String,
    operation: Operation,
    resource: String,
    #[serde(default, with = "payload_base64")]
    payload: Vec<u8>,
    timestamp: Timestamp,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        operation: Operation,
        resource: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            parent_id: None,
            source: source.into(),
            destination: destination.into(),
            operation,
            resource: resource.into(),
            payload: payload.into(),
            timestamp: Timestamp::now(),
        }
    }

    /// Create an envelope addressed to an edge node
    pub fn to_node(
        source: impl Into<String>,
        node_id: &NodeId,
        operation: Operation,
        resource: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(source, node_id.as_str(), operation, resource, payload)
    }

    /// Create a cloud-bound envelope
    pub fn to_cloud(
        source: impl Into<String>,
        operation: Operation,
        resource: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(source, CLOUD_DESTINATION, operation, resource, payload)
    }

    /// Build the reply to `request`: correlated by `parent_id` and routed back
    /// to the request's source
    pub fn response_to(
        request: &Envelope,
        source: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let mut reply = Self::new(
            source,
            request.source.clone(),
            Operation::Response,
            request.resource.clone(),
            payload,
        );
        reply.parent_id = Some(request.id.clone());
        reply
    }

    /// Replace the generated id (producers that carry their own correlation ids)
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the envelope this one answers
    pub fn with_parent(mut self, parent_id: MessageId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Replace the timestamp
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Re-address an envelope received from `node_id` as cloud-bound.
    ///
    /// The source is always overwritten with the authenticated node identity so
    /// an edge node cannot impersonate another.
    pub fn into_cloud_bound(mut self, node_id: &NodeId) -> Self {
        self.source = node_id.as_str().to_string();
        self.destination = CLOUD_DESTINATION.to_string();
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&MessageId> {
        self.parent_id.as_ref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// True when the destination denotes the cloud rather than a node
    pub fn is_cloud_bound(&self) -> bool {
        self.destination == CLOUD_DESTINATION
    }

    /// Approximate in-memory size, used for byte budgets on node queues
    pub fn size_hint(&self) -> usize {
        self.id.as_str().len()
            + self.parent_id.as_ref().map_or(0, |p| p.as_str().len())
            + self.source.len()
            + self.destination.len()
            + self.resource.len()
            + self.payload.len()
            + core::mem::size_of::<Timestamp>()
            + core::mem::size_of::<Operation>()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {:?} ({} bytes)",
            self.id,
            self.operation,
            self.resource,
            self.destination,
            self.payload.len()
        )
    }
}

// ----------------------------------------------------------------------------
// Payload Encoding
// ----------------------------------------------------------------------------

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_envelope_routing_helpers() {
        let to_node = Envelope::to_node(
            "devicecontroller",
            &node("node-1"),
            Operation::Update,
            "device/twin",
            b"{}".to_vec(),
        );
        assert_eq!(to_node.destination(), "node-1");
        assert!(!to_node.is_cloud_bound());

        let to_cloud = Envelope::to_cloud("node-1", Operation::Insert, "pod/status", vec![1, 2]);
        assert!(to_cloud.is_cloud_bound());
    }

    #[test]
    fn test_response_is_correlated() {
        let request = Envelope::to_node(
            "metamanager",
            &node("node-1"),
            Operation::Query,
            "configmap/default",
            Vec::new(),
        )
        .with_id("req-1");

        let reply = Envelope::response_to(&request, "node-1", b"ok".to_vec());
        assert_eq!(reply.parent_id(), Some(&MessageId::from("req-1")));
        assert_eq!(reply.destination(), "metamanager");
        assert_eq!(reply.operation(), Operation::Response);
        assert_eq!(reply.resource(), "configmap/default");
    }

    #[test]
    fn test_into_cloud_bound_overwrites_source() {
        let forged = Envelope::new("node-2", "node-9", Operation::Update, "x", Vec::new());
        let normalized = forged.into_cloud_bound(&node("node-1"));
        assert_eq!(normalized.source(), "node-1");
        assert!(normalized.is_cloud_bound());
    }

    #[test]
    fn test_payload_serializes_as_base64() {
        let envelope = Envelope::to_cloud("node-1", Operation::Upload, "log", vec![0xff, 0x00])
            .with_id("e1")
            .with_timestamp(Timestamp::new(42));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"], "/wA=");
        assert_eq!(json["operation"], "upload");
        assert_eq!(json["timestamp"], 42);
        assert!(json.get("parent_id").is_none());

        let decoded: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, envelope);
    }
}
