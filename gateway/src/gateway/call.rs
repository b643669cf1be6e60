//! Lifecycle of a single routed call.
//!
//! ```text
//! Received -> Authenticating -> Dispatched -> Streaming -> Completed -> Closed
//!                   |               |             |
//!                   +---------------+-------------+------> Error -----> Closed
//! ```
//!
//! `Unauthorized` goes straight from `Authenticating` to `Closed`. Any live
//! state may jump to `Closed` when the caller goes away.

use std::fmt;
use std::time::Instant;

use uuid::Uuid;

use super::admission::AdmissionPermit;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Received,
    Authenticating,
    Dispatched,
    Streaming,
    Completed,
    Error,
    Closed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        self == CallState::Closed
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Completed, _) | (Error, _) => false,
            (_, Error) => true,
            (Received, Authenticating)
            | (Authenticating, Dispatched)
            | (Dispatched, Streaming)
            | (Dispatched, Completed)
            | (Streaming, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Received => "received",
            CallState::Authenticating => "authenticating",
            CallState::Dispatched => "dispatched",
            CallState::Streaming => "streaming",
            CallState::Completed => "completed",
            CallState::Error => "error",
            CallState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Tracks one call through its states and owns its admission slot.
///
/// Dropping the trace moves it to `Closed` and frees the slot, so the slot is
/// released exactly once however the call ends.
pub struct CallTrace {
    id: Uuid,
    kind: &'static str,
    state: CallState,
    started: Instant,
    permit: Option<AdmissionPermit>,
}

impl CallTrace {
    pub fn new(kind: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: CallState::Received,
            started: Instant::now(),
            permit: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn advance(&mut self, next: CallState) {
        let legal = self.state.can_transition_to(next);
        debug_assert!(legal, "illegal call transition {} -> {}", self.state, next);
        if !legal {
            tracing::warn!(
                call_id = %self.id,
                "Ignoring illegal call transition {} -> {}",
                self.state,
                next
            );
            return;
        }
        tracing::trace!(call_id = %self.id, kind = self.kind, "{} -> {}", self.state, next);
        self.state = next;
    }

    /// Attach the admission slot this call runs under.
    pub fn admit(&mut self, permit: AdmissionPermit) {
        self.permit = Some(permit);
    }

    /// Record a failure. An unauthenticated call closes without an error state.
    pub fn fail(&mut self, err: &GatewayError) {
        match (self.state, err) {
            (CallState::Authenticating, GatewayError::Unauthorized) => {
                tracing::debug!(call_id = %self.id, kind = self.kind, "Rejected unauthenticated call");
            }
            _ => {
                tracing::warn!(
                    call_id = %self.id,
                    kind = self.kind,
                    code = %err.code(),
                    "Call failed in state {}: {}",
                    self.state,
                    err
                );
                self.advance(CallState::Error);
            }
        }
    }
}

impl Drop for CallTrace {
    fn drop(&mut self) {
        let last = self.state;
        if !last.is_terminal() {
            self.state = CallState::Closed;
        }
        self.permit.take();
        tracing::debug!(
            call_id = %self.id,
            kind = self.kind,
            last_state = %last,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Call closed"
        );
    }
}
