//! One accessor surface over LTI 1.1 flat parameters and LTI 1.3 claims
//!
//! LTI 1.1 launches arrive as a flat `application/x-www-form-urlencoded`
//! parameter map (`context_label`, `custom_canvas_user_id`, ...). LTI 1.3
//! launches arrive as a JWT payload whose claims nest the same data under
//! namespace URIs (`https://purl.imsglobal.org/spec/lti/claim/context` ->
//! `{"label": ...}`). [`LaunchData`] is the tagged union over both shapes;
//! [`LaunchData::claim`] sniffs the 1.3 nested claim first and falls back to
//! the flattened 1.1 key so callers never branch on the protocol generation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LtiError, LtiResult};

/// Namespace prefix for LTI 1.3 claim URIs.
pub const CLAIM_BASE: &str = "https://purl.imsglobal.org/spec/lti/claim/";

/// The LTI 1.3 roles claim (an array of vocabulary URNs).
pub const CLAIM_ROLES: &str = "https://purl.imsglobal.org/spec/lti/claim/roles";

/// The LTI 1.3 tool-platform claim (product family, instance metadata).
pub const CLAIM_TOOL_PLATFORM: &str =
    "https://purl.imsglobal.org/spec/lti/claim/tool_platform";

/// The LTI 1.3 deployment-id claim.
pub const CLAIM_DEPLOYMENT_ID: &str =
    "https://purl.imsglobal.org/spec/lti/claim/deployment_id";

/// Validated launch parameters, either generation.
///
/// Serializes transparently as the underlying map, so a sealed session blob
/// round-trips to the same variant: a flat string map deserializes as
/// `Flat`, anything carrying nested claim objects as `Nested`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LaunchData {
    /// LTI 1.1 form parameters.
    Flat(HashMap<String, String>),
    /// LTI 1.3 id_token claims.
    Nested(Map<String, Value>),
}

impl LaunchData {
    /// Wrap validated LTI 1.1 form parameters.
    pub fn from_params(params: HashMap<String, String>) -> Self {
        Self::Flat(params)
    }

    /// Wrap validated LTI 1.3 id_token claims.
    pub fn from_claims(claims: Map<String, Value>) -> Self {
        Self::Nested(claims)
    }

    /// Top-level parameter or claim, as a string.
    ///
    /// Non-string 1.3 claim values (arrays, objects) yield `None` here; use
    /// [`LaunchData::claim`] or [`LaunchData::raw`] for those.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            Self::Flat(map) => map.get(key).map(String::as_str),
            Self::Nested(map) => map.get(key).and_then(Value::as_str),
        }
    }

    /// Top-level claim as raw JSON (1.3 only; flat launches yield `None`).
    pub fn raw(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Flat(_) => None,
            Self::Nested(map) => map.get(key),
        }
    }

    /// First of `key` / `alt` present at top level.
    pub fn either(&self, key: &str, alt: &str) -> Option<&str> {
        self.get(key).or_else(|| self.get(alt))
    }

    /// Namespaced lookup: the 1.3 nested claim
    /// `https://purl.imsglobal.org/spec/lti/claim/<namespace>` -> `{key}`
    /// first, then the flattened 1.1 `<namespace>_<key>` parameter.
    pub fn claim(&self, namespace: &str, key: &str) -> Option<&str> {
        if let Self::Nested(map) = self {
            let nested = map
                .get(&format!("{CLAIM_BASE}{namespace}"))
                .and_then(Value::as_object)
                .and_then(|obj| obj.get(key))
                .and_then(Value::as_str);
            if nested.is_some() {
                return nested;
            }
        }
        self.get(&format!("{namespace}_{key}"))
    }

    /// [`LaunchData::claim`] with a default.
    pub fn claim_or<'a>(&'a self, namespace: &str, key: &str, default: &'a str) -> &'a str {
        self.claim(namespace, key).unwrap_or(default)
    }

    /// Platform product family (`canvas`, `moodle`, ...), from the 1.1
    /// parameter or the 1.3 tool-platform claim.
    pub fn platform_family(&self) -> Option<&str> {
        self.get("tool_consumer_info_product_family_code")
            .or_else(|| self.claim("tool_platform", "product_family_code"))
    }

    /// Number of top-level parameters/claims.
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(map) => map.len(),
            Self::Nested(map) => map.len(),
        }
    }

    /// True when no parameters survived validation.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Typed view of a Canvas launch, either protocol generation.
///
/// Field sources mirror what Canvas actually sends: internal ids under the
/// `custom` namespace, SIS ids under `lis`, user identity split between
/// `lis_person_*` (1.1) and OIDC standard claims (1.3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasLaunch {
    pub canvas_course_id: Option<String>,
    pub canvas_user_id: Option<String>,
    pub canvas_account_id: Option<String>,
    pub course_sis_id: Option<String>,
    pub user_sis_id: Option<String>,
    pub account_sis_id: Option<String>,
    pub course_short_name: Option<String>,
    pub course_long_name: Option<String>,
    pub user_login_id: Option<String>,
    pub user_full_name: Option<String>,
    pub user_first_name: Option<String>,
    pub user_last_name: Option<String>,
    pub user_email: Option<String>,
    pub user_avatar_url: Option<String>,
    pub link_title: Option<String>,
    pub return_url: Option<String>,
    pub canvas_api_domain: Option<String>,
}

impl CanvasLaunch {
    /// Build the typed view, rejecting launches from any platform whose
    /// product family is not Canvas.
    pub fn from_launch(data: &LaunchData) -> LtiResult<Self> {
        let family = data.platform_family().unwrap_or_default();
        if !family.eq_ignore_ascii_case("canvas") {
            return Err(LtiError::UnsupportedPlatform {
                platform: family.to_string(),
            });
        }

        let s = |v: Option<&str>| v.map(str::to_string);
        Ok(Self {
            canvas_course_id: s(data.claim("custom", "canvas_course_id")),
            canvas_user_id: s(data.claim("custom", "canvas_user_id")),
            canvas_account_id: s(data.claim("custom", "canvas_account_id")),
            course_sis_id: s(data.claim("lis", "course_offering_sourcedid")),
            user_sis_id: s(data.claim("lis", "person_sourcedid")),
            account_sis_id: s(data.claim("custom", "canvas_account_sis_id")),
            course_short_name: s(data.claim("context", "label")),
            course_long_name: s(data.claim("context", "title")),
            user_login_id: s(data.claim("custom", "canvas_user_login_id")),
            user_full_name: s(data.either("lis_person_name_full", "name")),
            user_first_name: s(data.either("lis_person_name_given", "given_name")),
            user_last_name: s(data.either("lis_person_name_family", "family_name")),
            user_email: s(data.either("lis_person_contact_email_primary", "email")),
            user_avatar_url: s(data.either("user_image", "picture")),
            link_title: s(data.claim("resource_link", "title")),
            return_url: s(data.claim("launch_presentation", "return_url")),
            canvas_api_domain: s(data.claim("custom", "canvas_api_domain")),
        })
    }
}
