//! Session envelope: sealed launch data bound to one session
//!
//! Validated launch data is stored client-visible only as an encrypted
//! blob. The envelope embeds the session id it was sealed for, so a blob
//! copied into another session fails with a binding mismatch even though
//! it decrypts cleanly. OAuth protocol parameters (`oauth_*`) are stripped
//! before sealing; they are transport material, not launch data.

use serde::{Deserialize, Serialize};
use tracing::debug;

use ltitool_core::{LaunchData, LtiError, LtiResult};

use crate::codec::SessionCodec;

#[derive(Debug, Serialize, Deserialize)]
struct LaunchEnvelope {
    session_binding: String,
    claims: LaunchData,
}

/// Seals launch data into, and recovers it from, a session-bound blob.
#[derive(Debug, Clone)]
pub struct LaunchSession {
    codec: SessionCodec,
}

impl LaunchSession {
    pub fn new(codec: SessionCodec) -> Self {
        Self { codec }
    }

    /// Seal `data` for the session identified by `session_id`.
    pub fn seal(&self, session_id: &str, data: &LaunchData) -> LtiResult<String> {
        let envelope = LaunchEnvelope {
            session_binding: session_id.to_string(),
            claims: strip_oauth_params(data),
        };
        self.codec.seal(&envelope)
    }

    /// Open a sealed blob for the current session.
    ///
    /// A blob sealed under a different session id is rejected; the caller
    /// should treat that as "no session" and force a fresh launch.
    pub fn open(&self, session_id: &str, blob: &str) -> LtiResult<LaunchData> {
        let envelope: LaunchEnvelope = self.codec.open(blob)?;
        if envelope.session_binding != session_id {
            debug!("sealed launch data presented under a different session");
            return Err(LtiError::SessionBindingMismatch);
        }
        Ok(envelope.claims)
    }
}

/// Drop `oauth_*` parameters from 1.1 launches; 1.3 claims carry none.
fn strip_oauth_params(data: &LaunchData) -> LaunchData {
    match data {
        LaunchData::Flat(params) => LaunchData::Flat(
            params
                .iter()
                .filter(|(k, _)| !k.starts_with("oauth_"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        nested @ LaunchData::Nested(_) => nested.clone(),
    }
}
