//! Cross-feature RPC over driver streams.
//!
//! An RPC call is an `rpc:call` message written to the target feature's
//! stream with labels `{feature, method, rpcID, caller}`; the matching
//! `rpc:return` is correlated by `rpcID`. In-process callers use
//! [`NO_CALLER`] so the supervisor resolves returns against the local
//! [`RpcRegistry`] instead of forwarding them to a driver.
//!
//! # Call shapes
//!
//! Everything funnels through one primitive (encode params, stamp
//! labels, optionally register a pending slot) exposed as four typed
//! wrappers:
//!
//! | Method | Params | Waits |
//! |--------|--------|-------|
//! | [`RpcCaller::call`] | JSON value | yes |
//! | [`RpcCaller::call_raw`] | bytes | yes |
//! | [`RpcCaller::call_no_wait`] | JSON value | no |
//! | [`RpcCaller::call_raw_no_wait`] | bytes, caller-supplied `rpcID` | no |

use crate::error::RpcError;
use async_trait::async_trait;
use plexus_wire::{
    Message, MessageWriter, Payload, CHANNEL_RPC, LABEL_CALLER, LABEL_ERROR, LABEL_FEATURE,
    LABEL_METHOD, LABEL_RPC_ID, NO_CALLER, SUBJECT_CALL,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

type PendingSlot = oneshot::Sender<Result<Vec<u8>, RpcError>>;

/// Correlation table for in-flight RPC calls.
///
/// IDs are unique within the process: a monotonic counter prefixed
/// with the pid, so they stay unambiguous across daemon restarts
/// sharing a driver's lifetime.
pub struct RpcRegistry {
    pending: parking_lot::Mutex<HashMap<String, PendingSlot>>,
    seq: AtomicU64,
    timeout: Duration,
}

impl RpcRegistry {
    /// Creates a registry whose calls expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: parking_lot::Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            timeout,
        }
    }

    /// Returns a fresh process-unique RPC ID.
    #[must_use]
    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}.{seq}", std::process::id())
    }

    /// Number of calls still waiting for a return.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, rpc_id: &str) -> oneshot::Receiver<Result<Vec<u8>, RpcError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(rpc_id.to_string(), tx);
        rx
    }

    fn abandon(&self, rpc_id: &str) {
        self.pending.lock().remove(rpc_id);
    }

    async fn wait(
        &self,
        rpc_id: &str,
        rx: oneshot::Receiver<Result<Vec<u8>, RpcError>>,
    ) -> Result<Vec<u8>, RpcError> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Dropped),
            Err(_) => {
                self.abandon(rpc_id);
                Err(RpcError::Timeout {
                    rpc_id: rpc_id.to_string(),
                })
            }
        }
    }

    /// Resolves an `rpc:return` message against the pending table.
    ///
    /// Unmatched returns are dropped with a warning; the caller may
    /// already have timed out, or never waited at all.
    pub fn handle_return(&self, msg: &Message) {
        let Some(rpc_id) = msg.label(LABEL_RPC_ID) else {
            warn!("rpc return without an rpcID label");
            return;
        };
        let Some(slot) = self.pending.lock().remove(rpc_id) else {
            warn!(rpc_id, "unmatched rpc return dropped");
            return;
        };

        let outcome = match msg.label(LABEL_ERROR) {
            Some(err) => Err(RpcError::Remote(err.to_string())),
            None => Ok(return_payload(msg)),
        };
        let _ = slot.send(outcome);
    }
}

fn return_payload(msg: &Message) -> Vec<u8> {
    match &msg.payload {
        Some(Payload::Raw(bytes)) => bytes.clone(),
        Some(Payload::Decoded(value)) => serde_json::to_vec(value).unwrap_or_default(),
        None => Vec::new(),
    }
}

/// RPC caller surface for anything that owns driver streams.
#[async_trait]
pub trait RpcCaller: Sync {
    /// The pending-call table backing this caller.
    fn rpc_registry(&self) -> &RpcRegistry;

    /// Resolves a feature to its stdin writer.
    ///
    /// # Errors
    ///
    /// [`RpcError::FeatureUnavailable`] when no runtime is loaded for
    /// the feature.
    fn rpc_stream(&self, feature: &str) -> Result<MessageWriter, RpcError>;

    /// Calls a method on a feature and waits for the return payload.
    async fn call(&self, feature: &str, method: &str, params: &Value) -> Result<Vec<u8>, RpcError> {
        self.call_raw(feature, method, serde_json::to_vec(params)?)
            .await
    }

    /// [`call`](Self::call) with pre-encoded params.
    async fn call_raw(
        &self,
        feature: &str,
        method: &str,
        params: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let registry = self.rpc_registry();
        let rpc_id = registry.next_id();
        let rx = registry.register(&rpc_id);

        if let Err(err) = self.send_call(feature, method, params, &rpc_id).await {
            registry.abandon(&rpc_id);
            return Err(err);
        }
        registry.wait(&rpc_id, rx).await
    }

    /// Fire-and-forget call; any return is dropped with a warning.
    async fn call_no_wait(
        &self,
        feature: &str,
        method: &str,
        params: &Value,
    ) -> Result<(), RpcError> {
        let rpc_id = self.rpc_registry().next_id();
        self.call_raw_no_wait(feature, method, serde_json::to_vec(params)?, &rpc_id)
            .await
    }

    /// Fire-and-forget with pre-encoded params and a caller-supplied ID.
    async fn call_raw_no_wait(
        &self,
        feature: &str,
        method: &str,
        params: Vec<u8>,
        rpc_id: &str,
    ) -> Result<(), RpcError> {
        self.send_call(feature, method, params, rpc_id).await
    }

    /// Emits one `rpc:call` frame on the feature's stream.
    async fn send_call(
        &self,
        feature: &str,
        method: &str,
        params: Vec<u8>,
        rpc_id: &str,
    ) -> Result<(), RpcError> {
        let stream = self.rpc_stream(feature)?;
        let mut msg = Message::new(CHANNEL_RPC, SUBJECT_CALL)
            .with_label(LABEL_FEATURE, feature)
            .with_label(LABEL_METHOD, method)
            .with_label(LABEL_RPC_ID, rpc_id)
            .with_label(LABEL_CALLER, NO_CALLER);
        if !params.is_empty() {
            msg = msg.with_raw(params);
        }
        stream.send(&msg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_wire::{codec, SUBJECT_RETURN};
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::io::BufReader;

    /// Caller with a single stream, enough to exercise the trait.
    struct LoopCaller {
        registry: RpcRegistry,
        stream: MessageWriter,
    }

    impl RpcCaller for LoopCaller {
        fn rpc_registry(&self) -> &RpcRegistry {
            &self.registry
        }

        fn rpc_stream(&self, feature: &str) -> Result<MessageWriter, RpcError> {
            if feature == "kv" {
                Ok(self.stream.clone())
            } else {
                Err(RpcError::FeatureUnavailable(feature.to_string()))
            }
        }
    }

    fn caller(timeout: Duration) -> (LoopCaller, tokio::io::DuplexStream) {
        let (tx, rx) = tokio::io::duplex(64 * 1024);
        (
            LoopCaller {
                registry: RpcRegistry::new(timeout),
                stream: MessageWriter::new(tx),
            },
            rx,
        )
    }

    #[test]
    fn ids_are_unique_and_pid_prefixed() {
        let registry = RpcRegistry::new(Duration::from_secs(1));
        let prefix = format!("{}.", std::process::id());
        let ids: HashSet<String> = (0..100).map(|_| registry.next_id()).collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.starts_with(&prefix)));
    }

    #[tokio::test]
    async fn call_resolves_on_matching_return() {
        let (caller, rx) = caller(Duration::from_secs(5));

        // Echo peer: parse the call off the stream, answer by rpcID.
        let registry_msg = tokio::spawn(async move {
            let mut reader = BufReader::new(rx);
            codec::read_message(&mut reader).await.unwrap().unwrap()
        });

        let call_body = json!({"key": "host"});
        let call = caller.call("kv", "get", &call_body);
        let (outcome, received) = tokio::join!(call, async {
            let received = registry_msg.await.unwrap();
            assert_eq!(received.label(LABEL_METHOD), Some("get"));
            assert_eq!(received.label(LABEL_CALLER), Some(NO_CALLER));
            let rpc_id = received.label(LABEL_RPC_ID).unwrap().to_string();

            let ret = Message::new(CHANNEL_RPC, SUBJECT_RETURN)
                .with_label(LABEL_RPC_ID, &rpc_id)
                .with_raw(b"{\"value\":\"db01\"}".to_vec());
            caller.rpc_registry().handle_return(&ret);
            received
        });

        assert_eq!(outcome.unwrap(), b"{\"value\":\"db01\"}");
        assert_eq!(received.raw(), Some(&b"{\"key\":\"host\"}"[..]));
        assert_eq!(caller.rpc_registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn call_times_out_without_return() {
        let (caller, _rx) = caller(Duration::from_millis(50));
        let err = caller.call("kv", "get", &json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert_eq!(caller.rpc_registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn error_label_surfaces_as_remote_error() {
        let (caller, rx) = caller(Duration::from_secs(5));

        let peer = tokio::spawn(async move {
            let mut reader = BufReader::new(rx);
            codec::read_message(&mut reader).await.unwrap().unwrap()
        });

        let call_body = json!({});
        let call = caller.call("kv", "get", &call_body);
        let (outcome, _) = tokio::join!(call, async {
            let received = peer.await.unwrap();
            let ret = Message::new(CHANNEL_RPC, SUBJECT_RETURN)
                .with_label(LABEL_RPC_ID, received.label(LABEL_RPC_ID).unwrap())
                .with_label(LABEL_ERROR, "key not found");
            caller.rpc_registry().handle_return(&ret);
        });

        assert!(matches!(outcome, Err(RpcError::Remote(e)) if e == "key not found"));
    }

    #[tokio::test]
    async fn no_wait_leaves_no_pending_entry() {
        let (caller, _rx) = caller(Duration::from_secs(5));
        caller.call_no_wait("kv", "bump", &json!({"n": 1})).await.unwrap();
        assert_eq!(caller.rpc_registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_feature_is_unavailable() {
        let (caller, _rx) = caller(Duration::from_secs(5));
        let err = caller.call("missing", "get", &json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::FeatureUnavailable(_)));
        assert_eq!(caller.rpc_registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_return_is_dropped_quietly() {
        let registry = RpcRegistry::new(Duration::from_secs(1));
        let ret = Message::new(CHANNEL_RPC, SUBJECT_RETURN).with_label(LABEL_RPC_ID, "999.0");
        registry.handle_return(&ret);
        assert_eq!(registry.pending_count(), 0);
    }
}
