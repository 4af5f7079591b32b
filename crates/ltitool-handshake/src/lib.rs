//! # ltitool-handshake - LTI Client-Side Storage Handshake
//!
//! Browsers increasingly block third-party cookies, which breaks session
//! continuity for a tool living inside an LMS iframe. The LTI client-side
//! storage protocol negotiates an alternative channel: the tool's frame
//! round-trips its session-binding values (`state`, `nonce`, session cookie)
//! through the *platform's* frame via `window.postMessage`.
//!
//! This crate holds the whole of that protocol:
//!
//! - [`protocol`] - serde types for the `lti.capabilities` /
//!   `lti.put_data` / `lti.get_data` message family
//! - [`machine`] - the explicit client state machine (capability probe,
//!   per-key exchange with scoped message ids, bounded timeout, redirect)
//! - [`pages`] - the server-rendered HTML/JS that drives the machine in the
//!   browser: the cookie-check interstitial and the storing/fetching
//!   redirect pages
//!
//! The machine is deliberately a pure value type: feed it inbound messages,
//! collect outbound ones. The rendered pages mirror its transitions in
//! JavaScript; tests exercise the Rust machine directly.

pub mod machine;
pub mod pages;
pub mod protocol;

pub use machine::{Disposition, Flow, HandshakeConfig, StorageHandshake};
pub use pages::{
    render_cookie_check_page, render_launch_redirect, render_redirect, CookieCheckTexts,
};
pub use protocol::{MessageError, Outbound, StorageMessage, SupportedMessage};
