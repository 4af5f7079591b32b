//! # ltitool-core - Shared LTI Launch Types
//!
//! Foundation types for the ltitool LTI Tool Provider:
//!
//! - [`error`] - the launch-failure taxonomy and its HTTP boundary mapping
//! - [`launch_data`] - one accessor surface over LTI 1.1 flat parameters and
//!   LTI 1.3 nested claims
//! - [`roles`] - role URN resolution and the member/admin authorization model
//!
//! Both launch generations funnel into [`launch_data::LaunchData`]: an LTI 1.1
//! form POST yields flat `key=value` parameters, an LTI 1.3 `id_token` yields
//! nested claim namespaces under `https://purl.imsglobal.org/spec/lti/claim/`.
//! Application code reads either shape through `LaunchData::claim`.

pub mod error;
pub mod launch_data;
pub mod roles;

pub use error::{LtiError, LtiResult};
pub use launch_data::{
    CanvasLaunch, LaunchData, CLAIM_BASE, CLAIM_DEPLOYMENT_ID, CLAIM_ROLES, CLAIM_TOOL_PLATFORM,
};
pub use roles::{RequiredRole, RoleSet};
