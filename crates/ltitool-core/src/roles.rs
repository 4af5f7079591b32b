//! Role resolution and the member/admin authorization model
//!
//! LTI 1.1 sends roles as comma-joined strings in the `roles` and
//! `ext_roles` parameters, mixing bare names (`Learner`) with namespaced
//! URNs (`urn:lti:instrole:ims/lis/Observer`). LTI 1.3 sends an array of
//! fully-qualified vocabulary URNs under the roles claim. Both resolve here
//! to bare role names, which the aggregate `member`/`admin` checks and
//! literal specific-role checks run against.
//!
//! Only Canvas-family platforms are supported; anything else is rejected
//! before any role inspection.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{LtiError, LtiResult};
use crate::launch_data::{LaunchData, CLAIM_ROLES};

/// Prefix of the LTI 1.3 role vocabulary.
pub const ROLE_VOCAB_PREFIX: &str = "http://purl.imsglobal.org/vocab/lis/v2/";

/// Roles granting course membership.
const MEMBER_ROLES: [&str; 6] = [
    "Administrator",
    "Instructor",
    "TeachingAssistant",
    "ContentDeveloper",
    "Learner",
    "Observer",
];

/// Roles granting administrative access.
const ADMIN_ROLES: [&str; 4] = [
    "Administrator",
    "Instructor",
    "TeachingAssistant",
    "ContentDeveloper",
];

/// Access level a view requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredRole {
    /// No role check at all.
    Public,
    /// Any course-membership role.
    Member,
    /// Administrative roles only.
    Admin,
    /// One literal role name.
    Specific(String),
}

impl RequiredRole {
    /// Parse the view-level role string; `None`/`"public"` pass everyone.
    pub fn parse(role: Option<&str>) -> Self {
        match role {
            None | Some("") | Some("public") => Self::Public,
            Some("member") => Self::Member,
            Some("admin") => Self::Admin,
            Some(name) => Self::Specific(name.to_string()),
        }
    }
}

/// Bare role names resolved from one launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet {
    roles: HashSet<String>,
}

impl RoleSet {
    /// Resolve the launch's role strings, both generations.
    pub fn from_launch(data: &LaunchData) -> Self {
        let mut roles = HashSet::new();

        if let Some(listed) = data.get("roles") {
            // 1.1: comma-joined roles + ext_roles
            let ext = data.get("ext_roles").unwrap_or_default();
            for role in listed.split(',').chain(ext.split(',')) {
                if let Some(name) = bare_role_1p1(role.trim()) {
                    roles.insert(name.to_string());
                }
            }
        } else if let Some(claimed) = data.raw(CLAIM_ROLES).and_then(|v| v.as_array()) {
            // 1.3: vocabulary URN array
            for role in claimed.iter().filter_map(|v| v.as_str()) {
                if let Some(name) = bare_role_1p3(role) {
                    roles.insert(name.to_string());
                }
            }
        }

        Self { roles }
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn has_any(&self, valid: &[&str]) -> bool {
        valid.iter().any(|r| self.roles.contains(*r))
    }
}

/// Unwrap a 1.1 role string to its bare name.
///
/// Accepts bare alphabetic names and `urn:lti:(inst|sys)?role:ims/lis/<Role>`
/// URNs; anything else resolves to nothing.
fn bare_role_1p1(role: &str) -> Option<&str> {
    if let Some(rest) = role.strip_prefix("urn:lti:") {
        let rest = rest
            .strip_prefix("instrole:")
            .or_else(|| rest.strip_prefix("sysrole:"))
            .or_else(|| rest.strip_prefix("role:"))?;
        let name = rest.strip_prefix("ims/lis/")?;
        return is_bare_name(name).then_some(name);
    }
    is_bare_name(role).then_some(role)
}

/// Unwrap a 1.3 vocabulary URN to the bare name after the last `#`.
fn bare_role_1p3(role: &str) -> Option<&str> {
    if !role.starts_with(ROLE_VOCAB_PREFIX) {
        return None;
    }
    let name = role.rsplit('#').next()?;
    (name.len() < role.len() && is_bare_name(name)).then_some(name)
}

fn is_bare_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphabetic())
}

/// Authorize one launch against a required access level.
///
/// The platform gate runs first: a non-Canvas product family is rejected
/// even for `Public`.
pub fn authorize(data: &LaunchData, required: &RequiredRole) -> LtiResult<()> {
    let family = data.platform_family().unwrap_or_default();
    if !family.eq_ignore_ascii_case("canvas") {
        return Err(LtiError::UnsupportedPlatform {
            platform: family.to_string(),
        });
    }

    if *required == RequiredRole::Public {
        return Ok(());
    }

    let roles = RoleSet::from_launch(data);
    let allowed = match required {
        RequiredRole::Public => true,
        RequiredRole::Member => roles.has_any(&MEMBER_ROLES),
        RequiredRole::Admin => roles.has_any(&ADMIN_ROLES),
        RequiredRole::Specific(name) => roles.contains(name),
    };

    if allowed {
        Ok(())
    } else {
        debug!(required = ?required, resolved = ?roles.roles, "role check failed");
        Err(LtiError::Forbidden)
    }
}

/// Expand short role names into full 1.3 vocabulary URNs.
///
/// Mirrors how Canvas reports memberships: a name can imply several
/// vocabulary entries (a Learner is both an institution Student and a
/// membership Learner). Used to build 1.3 launch fixtures.
pub fn vocabulary_urns_for(role_names: &[&str]) -> Vec<String> {
    let mut urns = Vec::new();
    for name in role_names {
        let parts: &[&str] = match *name {
            "User" => &["system/person#User"],
            "Observer" | "Mentor" => &[
                "institution/person#Observer",
                "institution/person#Mentor",
                "membership#Mentor",
            ],
            "Student" | "Learner" => &[
                "institution/person#Learner",
                "institution/person#Student",
                "membership#Learner",
            ],
            "Instructor" | "Faculty" | "Teacher" => &[
                "institution/person#Instructor",
                "institution/person#Faculty",
                "membership#Instructor",
            ],
            "Administrator" => &[
                "system/person#User",
                "institution/person#Administrator",
                "membership#Administrator",
            ],
            "TeachingAssistant" => &["membership/Instructor#TeachingAssistant"],
            "ContentDeveloper" => &["membership#ContentDeveloper"],
            _ => &[],
        };
        urns.extend(parts.iter().map(|p| format!("{ROLE_VOCAB_PREFIX}{p}")));
    }
    urns
}
