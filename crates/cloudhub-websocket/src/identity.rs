//! Node identity extraction for WebSocket upgrades
//!
//! An edge node names itself either with a `node_id` request header or with
//! the request path `/{project_id}/{node_id}/events`. The header wins when both
//! are present.

use cloudhub_core::{NodeId, SessionError};

/// Request header carrying the node identity
pub const NODE_ID_HEADER: &str = "node_id";

/// Final path segment of the events endpoint
pub const EVENTS_SEGMENT: &str = "events";

/// Resolve the node identity from the upgrade request's header and path
pub fn node_id_from_request(header: Option<&str>, path: &str) -> Result<NodeId, SessionError> {
    if let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) {
        return NodeId::new(value);
    }

    match node_id_from_path(path) {
        Some(segment) => NodeId::new(segment),
        None => Err(SessionError::HandshakeFailed {
            reason: format!(
                "no {} header and path {:?} is not /{{project_id}}/{{node_id}}/{}",
                NODE_ID_HEADER, path, EVENTS_SEGMENT
            ),
        }),
    }
}

fn node_id_from_path(path: &str) -> Option<&str> {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [_project, node_id, events] if *events == EVENTS_SEGMENT => Some(*node_id),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
