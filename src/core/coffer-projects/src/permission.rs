//! Project permissions.
//!
//! A member's effective permission is its role's permission set plus any
//! active privileges. Privileges only ever widen access to secrets.

use serde::{Deserialize, Serialize};

use crate::models::{Privilege, ProjectRole};
use crate::path::glob_matches;
use crate::ProjectError;

/// What a permission is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subject {
    /// Project settings.
    Project,
    /// Project memberships.
    Members,
    /// Environments.
    Environments,
    /// Secret values.
    Secrets,
    /// Folders.
    SecretFolders,
    /// Dynamic secret configurations and leases.
    DynamicSecrets,
    /// Approval policies and requests.
    SecretApproval,
    /// KMIP clients and managed objects.
    Kmip,
    /// SSH certificate authorities.
    SshCertificateAuthorities,
    /// SSH certificate templates.
    SshCertificateTemplates,
    /// Issuing SSH certificates.
    SshCertificates,
    /// Audit logs.
    AuditLogs,
}

/// What is done to a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Read.
    Read,
    /// Create.
    Create,
    /// Modify.
    Edit,
    /// Delete.
    Delete,
    /// Request a dynamic secret lease.
    Lease,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Read => "read",
            Action::Create => "create",
            Action::Edit => "edit",
            Action::Delete => "delete",
            Action::Lease => "lease",
        };
        f.write_str(name)
    }
}

/// Whether `role` alone allows `action` on `subject`.
pub fn role_allows(role: ProjectRole, subject: Subject, action: Action) -> bool {
    use Action::*;
    use Subject::*;

    match role {
        ProjectRole::Admin => true,
        ProjectRole::NoAccess => false,
        ProjectRole::Viewer => action == Read && subject != Kmip && subject != SshCertificates,
        ProjectRole::Member => match subject {
            Secrets | SecretFolders => action != Lease,
            DynamicSecrets => matches!(action, Read | Lease),
            SshCertificates => action == Create,
            Kmip => false,
            Project | Members | Environments | SecretApproval | SshCertificateAuthorities
            | SshCertificateTemplates | AuditLogs => action == Read,
        },
    }
}

/// Effective permission of one actor in one project.
#[derive(Debug, Clone)]
pub struct ProjectPermission {
    /// Project.
    pub project_id: String,
    /// Organization of the project.
    pub org_id: String,
    /// User or identity id.
    pub actor_id: String,
    /// Membership role.
    pub role: ProjectRole,
    privileges: Vec<Privilege>,
    now: u64,
}

impl ProjectPermission {
    /// Builds a permission evaluated at `now`. Inactive privileges are dropped.
    pub fn new(
        project_id: impl Into<String>,
        org_id: impl Into<String>,
        actor_id: impl Into<String>,
        role: ProjectRole,
        privileges: Vec<Privilege>,
        now: u64,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            org_id: org_id.into(),
            actor_id: actor_id.into(),
            role,
            privileges: privileges.into_iter().filter(|p| p.is_active(now)).collect(),
            now,
        }
    }

    /// Whether the actor is a project admin.
    pub fn is_admin(&self) -> bool {
        self.role == ProjectRole::Admin
    }

    /// Whether the actor may perform `action` on `subject`.
    pub fn can(&self, subject: Subject, action: Action) -> bool {
        role_allows(self.role, subject, action)
    }

    /// Whether the actor may perform `action` on secrets of `environment`
    /// under `secret_path`.
    pub fn can_secret(&self, action: Action, environment: &str, secret_path: &str) -> bool {
        self.can(Subject::Secrets, action)
            || self.privileges.iter().any(|p| {
                p.is_active(self.now)
                    && p.grant.environment == environment
                    && p.grant.actions.contains(&action)
                    && glob_matches(&p.grant.secret_path, secret_path)
            })
    }

    /// Fails with [`ProjectError::Forbidden`] unless [`Self::can`] holds.
    pub fn require(&self, subject: Subject, action: Action) -> Result<(), ProjectError> {
        if self.can(subject, action) {
            Ok(())
        } else {
            Err(ProjectError::Forbidden(format!(
                "{} on {:?} requires a higher role",
                action, subject
            )))
        }
    }

    /// Fails with [`ProjectError::Forbidden`] unless [`Self::can_secret`] holds.
    pub fn require_secret(
        &self,
        action: Action,
        environment: &str,
        secret_path: &str,
    ) -> Result<(), ProjectError> {
        if self.can_secret(action, environment, secret_path) {
            Ok(())
        } else {
            Err(ProjectError::Forbidden(format!(
                "{} on secrets in {}:{} is not allowed",
                action, environment, secret_path
            )))
        }
    }

    /// Fails unless the actor is a project admin.
    pub fn require_admin(&self) -> Result<(), ProjectError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ProjectError::Forbidden("project admin required".into()))
        }
    }
}
