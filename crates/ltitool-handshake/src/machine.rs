//! The client-side storage handshake as an explicit state machine
//!
//! The browser flow is event-driven (postMessage responses racing a give-up
//! timer), which is exactly the kind of logic that rots when spread across
//! ad hoc event handlers mutating shared globals. Here it is one value type:
//! feed it inbound [`StorageMessage`]s, collect [`Outbound`] messages, and
//! read the final [`Disposition`] once the machine is done.
//!
//! States: `Init -> AwaitingCapabilities -> Exchanging -> Done`. The
//! capability probe goes to the parent window; each pending key then gets
//! exactly one data request toward the advertised frame, tagged with a
//! message id scoped to the current launch so concurrent launches in other
//! tabs cannot cross-talk. Duplicate or mismatched responses are ignored,
//! which bounds the handshake to finite work even under a misbehaving
//! platform frame. A bounded timer always wins: on timeout the machine
//! completes with whatever resolved, and the downstream validator decides
//! whether the launch can proceed.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{Outbound, StorageMessage};

/// Shortest give-up timer observed across platform variants.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest give-up timer observed across platform variants.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);
/// Recommended default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake tuning; today just the give-up timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    timeout: Duration,
}

impl HandshakeConfig {
    /// Clamp the timeout into the observed 5-60s band.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Which direction values move through the platform frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// This page is recovering values stored earlier (`lti.get_data`).
    Fetch,
    /// This page is pushing values before redirecting (`lti.put_data`).
    Store,
}

impl Flow {
    fn data_subject(self) -> &'static str {
        match self {
            Self::Fetch => "lti.get_data",
            Self::Store => "lti.put_data",
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    value: Option<String>,
    resolved: bool,
    message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Init,
    AwaitingCapabilities,
    Exchanging { frame: String },
    Done,
}

/// Where the page goes once the machine completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Navigate to the next hop carrying the resolved values.
    Redirect {
        location: String,
        values: BTreeMap<String, String>,
    },
    /// No storage capability: navigate without enrichment and let the
    /// validator reject cleanly if cookies really are blocked.
    NoStorage { location: String },
}

/// The handshake state machine. See the module docs for the protocol.
#[derive(Debug, Clone)]
pub struct StorageHandshake {
    flow: Flow,
    scope: String,
    redirect_location: String,
    config: HandshakeConfig,
    state: State,
    storage_found: bool,
    pending: BTreeMap<String, Pending>,
}

impl StorageHandshake {
    /// Machine that recovers `keys` through the platform frame before
    /// re-entering the launch flow at `redirect_location`.
    ///
    /// `scope` is the launch's `state` value; it namespaces the per-key
    /// message ids.
    pub fn fetch(
        scope: impl Into<String>,
        redirect_location: impl Into<String>,
        keys: &[&str],
        config: HandshakeConfig,
    ) -> Self {
        let pending = keys
            .iter()
            .map(|k| {
                (
                    (*k).to_string(),
                    Pending {
                        value: None,
                        resolved: false,
                        message_id: None,
                    },
                )
            })
            .collect();
        Self {
            flow: Flow::Fetch,
            scope: scope.into(),
            redirect_location: redirect_location.into(),
            config,
            state: State::Init,
            storage_found: false,
            pending,
        }
    }

    /// Machine that pushes `values` into the platform frame before
    /// completing the redirect to `redirect_location`.
    pub fn store(
        scope: impl Into<String>,
        redirect_location: impl Into<String>,
        values: BTreeMap<String, String>,
        config: HandshakeConfig,
    ) -> Self {
        let pending = values
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    Pending {
                        value: Some(v),
                        resolved: false,
                        message_id: None,
                    },
                )
            })
            .collect();
        Self {
            flow: Flow::Store,
            scope: scope.into(),
            redirect_location: redirect_location.into(),
            config,
            state: State::Init,
            storage_found: false,
            pending,
        }
    }

    /// Kick off the handshake: post the capability probe to the parent.
    ///
    /// With nothing pending there is no handshake to run and the machine
    /// completes immediately.
    pub fn start(&mut self) -> Vec<Outbound> {
        if self.state != State::Init {
            return Vec::new();
        }
        if self.pending.is_empty() {
            self.state = State::Done;
            return Vec::new();
        }
        self.state = State::AwaitingCapabilities;
        vec![Outbound {
            frame: None,
            message: StorageMessage::Capabilities,
        }]
    }

    /// Feed one inbound postMessage; returns messages to post in response.
    pub fn handle(&mut self, message: &StorageMessage) -> Vec<Outbound> {
        match message {
            StorageMessage::CapabilitiesResponse { supported_messages } => {
                self.on_capabilities(supported_messages)
            }
            StorageMessage::GetDataResponse {
                message_id,
                key,
                value,
                error,
            } => {
                self.on_get_response(message_id, key, value.as_deref(), error.is_some());
                Vec::new()
            }
            StorageMessage::PutDataResponse {
                message_id, error, ..
            } => {
                self.on_put_response(message_id, error.is_some());
                Vec::new()
            }
            other => {
                debug!(subject = other.subject(), "ignoring unexpected message");
                Vec::new()
            }
        }
    }

    /// The give-up timer fired: complete with whatever resolved.
    pub fn on_timeout(&mut self) {
        if self.state != State::Done {
            warn!(
                timeout_secs = self.config.timeout().as_secs(),
                unresolved = self.unresolved_count(),
                "storage handshake timed out, proceeding without enrichment"
            );
            self.state = State::Done;
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Final outcome; `None` while the handshake is still running.
    pub fn disposition(&self) -> Option<Disposition> {
        if self.state != State::Done {
            return None;
        }
        if !self.storage_found {
            return Some(Disposition::NoStorage {
                location: self.redirect_location.clone(),
            });
        }
        let values = self
            .pending
            .iter()
            .filter(|(_, p)| p.resolved)
            .filter_map(|(k, p)| p.value.clone().map(|v| (k.clone(), v)))
            .collect();
        Some(Disposition::Redirect {
            location: self.redirect_location.clone(),
            values,
        })
    }

    /// Keys still awaiting a response.
    pub fn unresolved_count(&self) -> usize {
        self.pending.values().filter(|p| !p.resolved).count()
    }

    fn on_capabilities(
        &mut self,
        supported: &[crate::protocol::SupportedMessage],
    ) -> Vec<Outbound> {
        if self.state != State::AwaitingCapabilities {
            debug!("ignoring capabilities response outside probe state");
            return Vec::new();
        }

        let subject = self.flow.data_subject();
        let Some(frame) = supported
            .iter()
            .find(|s| s.subject == subject)
            .and_then(|s| s.frame.clone())
        else {
            debug!(subject, "platform advertises no usable storage frame");
            self.state = State::Done;
            return Vec::new();
        };

        self.storage_found = true;
        let mut out = Vec::new();
        for (key, pending) in &mut self.pending {
            if pending.resolved {
                continue;
            }
            let message_id = match self.flow {
                // get-flow ids are deterministic per key, scoped by the
                // launch state so parallel launches cannot collide
                Flow::Fetch => format!("{key}_{}", self.scope),
                Flow::Store => Uuid::new_v4().to_string(),
            };
            pending.message_id = Some(message_id.clone());
            let message = match self.flow {
                Flow::Fetch => StorageMessage::GetData {
                    message_id,
                    key: key.clone(),
                },
                Flow::Store => StorageMessage::PutData {
                    message_id,
                    key: key.clone(),
                    value: pending.value.clone().unwrap_or_default(),
                },
            };
            out.push(Outbound {
                frame: Some(frame.clone()),
                message,
            });
        }
        self.state = State::Exchanging { frame };
        out
    }

    fn on_get_response(
        &mut self,
        message_id: &str,
        key: &str,
        value: Option<&str>,
        errored: bool,
    ) {
        if !matches!(self.state, State::Exchanging { .. }) {
            return;
        }
        let Some(pending) = self.pending.get_mut(key) else {
            debug!(key, "response for unknown key ignored");
            return;
        };
        if pending.resolved {
            debug!(key, "duplicate response for resolved key ignored");
            return;
        }
        if pending.message_id.as_deref() != Some(message_id) {
            warn!(key, message_id, "message id mismatch, possible cross-talk");
            return;
        }
        if errored {
            // the key will never arrive; resolve it empty so the machine
            // still terminates
            warn!(key, "platform reported storage error for key");
            pending.resolved = true;
        } else {
            pending.value = value.map(str::to_string);
            pending.resolved = true;
        }
        self.finish_if_complete();
    }

    fn on_put_response(&mut self, message_id: &str, errored: bool) {
        if !matches!(self.state, State::Exchanging { .. }) {
            return;
        }
        let Some(pending) = self
            .pending
            .values_mut()
            .find(|p| p.message_id.as_deref() == Some(message_id))
        else {
            debug!(message_id, "put response with unknown message id ignored");
            return;
        };
        if pending.resolved {
            return;
        }
        if errored {
            warn!(message_id, "platform reported storage error on put");
        }
        pending.resolved = true;
        self.finish_if_complete();
    }

    fn finish_if_complete(&mut self) {
        if self.pending.values().all(|p| p.resolved) {
            self.state = State::Done;
        }
    }
}
