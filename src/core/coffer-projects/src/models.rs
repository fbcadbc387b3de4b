//! Records persisted by the projects engine.

use serde::{Deserialize, Serialize};

use crate::permission::Action;

/// A tenant. Users, identities and projects all belong to exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    /// Organization id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// URL-safe identifier.
    pub slug: String,
    /// Creation time (Unix seconds).
    pub created_at: u64,
}

/// Role of a user inside its organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrgRole {
    /// Manages identities, SCIM tokens and org settings.
    Admin,
    /// Regular member.
    Member,
}

/// A human user of an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUser {
    /// User id.
    pub id: String,
    /// Owning organization.
    pub org_id: String,
    /// Email address, unique within the organization.
    pub email: String,
    /// Login name (SCIM `userName`).
    pub username: String,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Organization role.
    pub org_role: OrgRole,
    /// Deactivated users keep their record but cannot act.
    pub active: bool,
    /// Creation time.
    pub created_at: u64,
}

/// Fields for a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Email address.
    pub email: String,
    /// Login name; defaults to the email.
    pub username: Option<String>,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Organization role.
    pub org_role: OrgRole,
}

/// Partial update of a user. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    /// New email.
    pub email: Option<String>,
    /// New given name.
    pub first_name: Option<String>,
    /// New family name.
    pub last_name: Option<String>,
    /// Activate or deactivate.
    pub active: Option<bool>,
}

/// A project groups environments, folders and everything stored in them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Project id.
    pub id: String,
    /// Owning organization.
    pub org_id: String,
    /// Display name.
    pub name: String,
    /// Slug, unique within the organization.
    pub slug: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Creation time.
    pub created_at: u64,
}

/// An environment of a project (`dev`, `staging`, `prod`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Environment id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Display name.
    pub name: String,
    /// Slug used in every API call.
    pub slug: String,
    /// Display order.
    pub position: u32,
}

/// A folder inside one environment of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    /// Folder id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Environment slug.
    pub environment: String,
    /// Path of the parent folder.
    pub parent_path: String,
    /// Folder name.
    pub name: String,
    /// Absolute path of the folder itself.
    pub path: String,
    /// Creation time.
    pub created_at: u64,
}

/// Role of a member inside a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectRole {
    /// Full control.
    Admin,
    /// Day-to-day secret management.
    Member,
    /// Read-only.
    Viewer,
    /// Member without any role permission; only privileges apply.
    NoAccess,
}

impl std::str::FromStr for ProjectRole {
    type Err = crate::ProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(ProjectRole::Admin),
            "member" => Ok(ProjectRole::Member),
            "viewer" => Ok(ProjectRole::Viewer),
            "no-access" => Ok(ProjectRole::NoAccess),
            other => Err(crate::ProjectError::Invalid(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

/// Whether a project member is a human or a machine identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActorKind {
    /// A user.
    User,
    /// A machine identity.
    Identity,
}

/// Project membership of a user or identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    /// Project.
    pub project_id: String,
    /// User or identity id.
    pub actor_id: String,
    /// Kind of actor.
    pub actor_kind: ActorKind,
    /// Role.
    pub role: ProjectRole,
    /// Creation time.
    pub created_at: u64,
}

/// What a privilege allows: actions on secrets in matching folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivilegeGrant {
    /// Environment slug.
    pub environment: String,
    /// Folder glob.
    pub secret_path: String,
    /// Allowed actions.
    pub actions: Vec<Action>,
}

/// Additional permission granted to one member, usually by an approved
/// access request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Privilege {
    /// Privilege id.
    pub id: String,
    /// Project.
    pub project_id: String,
    /// Beneficiary.
    pub actor_id: String,
    /// Granted permission.
    pub grant: PrivilegeGrant,
    /// End of a temporary privilege; `None` is permanent.
    pub temporary_end: Option<u64>,
    /// Creation time.
    pub created_at: u64,
}

impl Privilege {
    /// Whether the privilege still applies at `now`.
    pub fn is_active(&self, now: u64) -> bool {
        self.temporary_end.map_or(true, |end| now < end)
    }
}
