//! API call dispatch collaborator surface.
//!
//! `api:call` messages are routed by their `fn` label to handlers
//! registered on the service. The [`ResponseFactory`] is injected by
//! the layer that owns response semantics (session tracking, multi-node
//! aggregation); the supervisor only builds the raw ingredients: the
//! decoded request and the eventbus reply stream.

use plexus_wire::{Message, MessageWriter};

/// One in-flight API invocation handed to a registered handler.
pub struct ApiResponse {
    /// The `api:call` request, payload already decoded.
    pub request: Message,
    /// Reply channel: the eventbus driver's stream.
    pub reply: MessageWriter,
    /// Identity of the daemon answering.
    pub daemon_id: String,
}

impl std::fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiResponse")
            .field("fn", &self.request.label(plexus_wire::LABEL_FN))
            .field("daemon_id", &self.daemon_id)
            .finish_non_exhaustive()
    }
}

/// Builds [`ApiResponse`] objects for `api:call` messages.
///
/// Returning `None` skips the call, e.g. a request addressed to a
/// different node, or one this daemon has already answered.
pub trait ResponseFactory: Send + Sync {
    /// Builds the response context for one request, or declines it.
    fn new_response(
        &self,
        daemon_id: &str,
        eventbus: MessageWriter,
        request: &Message,
    ) -> Option<ApiResponse>;
}

/// Factory that accepts every request as-is.
///
/// Enough for single-node deployments and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllResponses;

impl ResponseFactory for AcceptAllResponses {
    fn new_response(
        &self,
        daemon_id: &str,
        eventbus: MessageWriter,
        request: &Message,
    ) -> Option<ApiResponse> {
        Some(ApiResponse {
            request: request.clone(),
            reply: eventbus,
            daemon_id: daemon_id.to_string(),
        })
    }
}
