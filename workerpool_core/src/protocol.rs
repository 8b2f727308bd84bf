/*!
 * Wire codec: the envelopes exchanged between a `WorkerHandle` and its
 * worker endpoint, plus the two reserved control method identifiers.
 *
 * The two worker kinds share this same vocabulary. A thread endpoint moves
 * these values directly through a `tokio::sync::mpsc` channel; a process
 * endpoint serializes them as one JSON object per line (NDJSON) over the
 * child's stdin/stdout. Either way the state machine in
 * [`crate::handle`] only ever sees [`Outbound`] and [`Inbound`].
 */
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SerializedError;

/// Reserved method name instructing a worker to run its termination
/// handler and exit. Chosen to be unrepresentable as a user method name.
pub const TERMINATE_METHOD: &str = "__workerpool-terminate__";

/// Reserved method name instructing a worker to run its registered abort
/// listeners for one in-flight task and acknowledge.
pub const CLEANUP_METHOD: &str = "__workerpool-cleanup__";

/// A single outbound request. `id` is assigned by the `WorkerHandle` from a
/// per-handle monotonic counter starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Everything a `WorkerHandle` can push down the wire to its endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    /// A normal method invocation, or a `CLEANUP_METHOD` request targeting
    /// the task identified by `request.id`.
    Call(Request),
    /// The bare terminate signal. Carries no envelope on purpose: there is
    /// nothing to correlate a response to.
    Terminate,
}

/// Everything a worker endpoint can push back up the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inbound {
    /// Sent exactly once, after `register` has installed the method table.
    Ready,
    /// Terminal success for task `id`.
    Result { id: u32, result: Value },
    /// Terminal failure for task `id`.
    Error { id: u32, error: SerializedError },
    /// A non-terminal progress notification for task `id`. Zero or more of
    /// these may precede the terminal `Result`/`Error` for the same id.
    Event { id: u32, payload: Value },
    /// Acknowledges a `CLEANUP_METHOD` request for task `id`. `error` is
    /// `None` when every abort listener ran to completion; otherwise it
    /// carries the listener failure (the handle destroys the worker
    /// either way once `error` is set, or on timeout, but the ack itself
    /// always names the outcome).
    ControlAck {
        id: u32,
        error: Option<SerializedError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_call_round_trips_through_json() {
        let msg = Outbound::Call(Request {
            id: 7,
            method: "double".into(),
            params: vec![Value::from(21)],
        });
        let line = serde_json::to_string(&msg).unwrap();
        let back: Outbound = serde_json::from_str(&line).unwrap();
        match back {
            Outbound::Call(req) => {
                assert_eq!(req.id, 7);
                assert_eq!(req.method, "double");
                assert_eq!(req.params, vec![Value::from(21)]);
            }
            Outbound::Terminate => panic!("expected Call"),
        }
    }

    #[test]
    fn terminate_has_no_payload_fields() {
        let line = serde_json::to_string(&Outbound::Terminate).unwrap();
        assert_eq!(line, r#"{"kind":"terminate"}"#);
    }

    #[test]
    fn control_ack_without_error_round_trips() {
        let msg = Inbound::ControlAck { id: 3, error: None };
        let line = serde_json::to_string(&msg).unwrap();
        let back: Inbound = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, Inbound::ControlAck { id: 3, error: None }));
    }

    #[test]
    fn reserved_method_names_are_not_ordinary_identifiers() {
        assert!(TERMINATE_METHOD.starts_with("__"));
        assert!(CLEANUP_METHOD.starts_with("__"));
        assert_ne!(TERMINATE_METHOD, CLEANUP_METHOD);
    }
}
