//! # Coffer Approvals
//!
//! N-of-M approval workflows.
//!
//! ## Policies
//!
//! A policy selects secrets by environment and folder glob. When several
//! policies of the same kind match, the most specific glob wins.
//!
//! - `access` policies gate access requests: once enough approvers approve,
//!   the requester receives a (possibly temporary) privilege.
//! - `change` policies gate secret writes: writes are held in a change
//!   request and applied when it is merged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod change;
pub mod error;
pub mod models;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use coffer_crypto::{DataKey, RootKey};
use coffer_projects::{now, path, ProjectError, ProjectsEngine};
use coffer_secrets::SecretsEngine;
use coffer_storage::{Collection, StorageBackend};

pub use error::ApprovalError;
pub use models::{
    AccessRequest, AccessRequestCount, AccessRequestStatus, ApprovalPolicy, ChangeRequest,
    ChangeStatus, CommitOp, Enforcement, NewAccessRequest, NewCommit, NewPolicy, PolicyKind,
    PolicyUpdate, Review, ReviewStatus, SecretCommit,
};

const KEY_PURPOSE: &str = "approvals";

/// Stores approval policies and runs the request workflows.
pub struct ApprovalsEngine {
    projects: Arc<ProjectsEngine>,
    secrets: Arc<SecretsEngine>,
    root_key: RootKey,
    policies: Collection<ApprovalPolicy>,
    access_requests: Collection<AccessRequest>,
    change_requests: Collection<ChangeRequest>,
    // serializes review and merge read-modify-write cycles
    review_lock: Mutex<()>,
}

impl ApprovalsEngine {
    /// Creates the engine.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        projects: Arc<ProjectsEngine>,
        secrets: Arc<SecretsEngine>,
        root_key: RootKey,
    ) -> Self {
        Self {
            projects,
            secrets,
            root_key,
            policies: Collection::new(Arc::clone(&storage), "approval-policies"),
            access_requests: Collection::new(Arc::clone(&storage), "access-requests"),
            change_requests: Collection::new(storage, "change-requests"),
            review_lock: Mutex::new(()),
        }
    }

    fn data_key(&self, project_id: &str) -> Result<DataKey, ApprovalError> {
        Ok(self.root_key.data_key(project_id, KEY_PURPOSE)?)
    }

    fn validate_glob(secret_path: &str) -> Result<String, ApprovalError> {
        path::validate_glob(secret_path).map_err(|e| match e {
            ProjectError::Invalid(message) => ApprovalError::Invalid(message),
            other => other.into(),
        })
    }

    fn validate_approvers(approvals: u32, approvers: &mut Vec<String>) -> Result<(), ApprovalError> {
        approvers.sort();
        approvers.dedup();
        if approvals == 0 {
            return Err(ApprovalError::Invalid("at least one approval is required".into()));
        }
        if approvals as usize > approvers.len() {
            return Err(ApprovalError::Invalid(format!(
                "{} approvals required but only {} approvers",
                approvals,
                approvers.len()
            )));
        }
        Ok(())
    }

    // ---- Policies ------------------------------------------------------

    /// Creates a policy.
    pub async fn create_policy(
        &self,
        project_id: &str,
        new: NewPolicy,
    ) -> Result<ApprovalPolicy, ApprovalError> {
        self.projects
            .get_environment(project_id, &new.environment)
            .await?;

        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(ApprovalError::Invalid("policy name cannot be empty".into()));
        }
        let secret_path = Self::validate_glob(&new.secret_path)?;
        let mut approvers = new.approvers;
        Self::validate_approvers(new.approvals, &mut approvers)?;

        if self
            .policies
            .find_one(|p| p.project_id == project_id && p.kind == new.kind && p.name == name)
            .await?
            .is_some()
        {
            return Err(ApprovalError::AlreadyExists(format!("policy '{}'", name)));
        }

        let now = now();
        let policy = ApprovalPolicy {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            kind: new.kind,
            name,
            environment: new.environment,
            secret_path,
            approvals: new.approvals,
            approvers,
            enforcement: new.enforcement,
            created_at: now,
            updated_at: now,
        };
        self.policies.insert(&policy.id, &policy).await?;

        info!(
            project_id = %project_id,
            policy_id = %policy.id,
            kind = ?policy.kind,
            approvals = policy.approvals,
            "Approval policy created"
        );
        Ok(policy)
    }

    /// Loads a policy.
    pub async fn get_policy(&self, policy_id: &str) -> Result<ApprovalPolicy, ApprovalError> {
        self.policies
            .get(policy_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(format!("policy '{}'", policy_id)))
    }

    /// Lists the policies of a project, optionally of one kind.
    pub async fn list_policies(
        &self,
        project_id: &str,
        kind: Option<PolicyKind>,
    ) -> Result<Vec<ApprovalPolicy>, ApprovalError> {
        let mut policies = self
            .policies
            .find(|p| p.project_id == project_id && kind.map_or(true, |k| p.kind == k))
            .await?;
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(policies)
    }

    /// Applies a partial update to a policy.
    pub async fn update_policy(
        &self,
        policy_id: &str,
        update: PolicyUpdate,
    ) -> Result<ApprovalPolicy, ApprovalError> {
        let mut policy = self.get_policy(policy_id).await?;

        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ApprovalError::Invalid("policy name cannot be empty".into()));
            }
            if name != policy.name
                && self
                    .policies
                    .find_one(|p| {
                        p.project_id == policy.project_id && p.kind == policy.kind && p.name == name
                    })
                    .await?
                    .is_some()
            {
                return Err(ApprovalError::AlreadyExists(format!("policy '{}'", name)));
            }
            policy.name = name;
        }
        if let Some(secret_path) = update.secret_path {
            policy.secret_path = Self::validate_glob(&secret_path)?;
        }
        if let Some(approvers) = update.approvers {
            policy.approvers = approvers;
        }
        if let Some(approvals) = update.approvals {
            policy.approvals = approvals;
        }
        if let Some(enforcement) = update.enforcement {
            policy.enforcement = enforcement;
        }
        Self::validate_approvers(policy.approvals, &mut policy.approvers)?;

        policy.updated_at = now();
        self.policies.put(&policy.id, &policy).await?;

        info!(policy_id = %policy.id, "Approval policy updated");
        Ok(policy)
    }

    /// Deletes a policy.
    pub async fn delete_policy(&self, policy_id: &str) -> Result<ApprovalPolicy, ApprovalError> {
        let policy = self.get_policy(policy_id).await?;
        self.policies.remove(policy_id).await?;
        info!(policy_id = %policy_id, "Approval policy deleted");
        Ok(policy)
    }

    /// Finds the most specific policy of `kind` covering `secret_path`.
    pub async fn find_policy(
        &self,
        project_id: &str,
        kind: PolicyKind,
        environment: &str,
        secret_path: &str,
    ) -> Result<Option<ApprovalPolicy>, ApprovalError> {
        let secret_path = Self::validate_glob(secret_path)?;
        Ok(self
            .policies
            .find(|p| {
                p.project_id == project_id
                    && p.kind == kind
                    && p.environment == environment
                    && (p.secret_path == secret_path
                        || path::glob_matches(&p.secret_path, &secret_path))
            })
            .await?
            .into_iter()
            .max_by_key(|p| path::specificity(&p.secret_path)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use coffer_projects::{ActorKind, NewProject, ProjectRole};
    use coffer_storage::MemoryBackend;
    use coffer_storage_sqlite::SqliteBackend;

    pub(crate) struct Fixture {
        pub engine: ApprovalsEngine,
        pub projects: Arc<ProjectsEngine>,
        pub secrets: Arc<SecretsEngine>,
        pub project_id: String,
    }

    /// Project with an admin, two approvers and a member.
    pub(crate) async fn fixture() -> Fixture {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let projects = Arc::new(ProjectsEngine::new(Arc::clone(&storage)));
        let root_key = RootKey::generate();
        let secrets = Arc::new(
            SecretsEngine::new(
                SqliteBackend::in_memory().await.unwrap(),
                root_key.clone(),
            )
            .await
            .unwrap(),
        );

        let org = projects.create_org("Acme").await.unwrap();
        let project = projects
            .create_project(
                &org.id,
                "admin",
                ActorKind::User,
                NewProject {
                    name: "Backend".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for member in ["alice", "bob", "carol"] {
            projects
                .add_membership(&project.id, member, ActorKind::User, ProjectRole::Member)
                .await
                .unwrap();
        }

        let engine = ApprovalsEngine::new(
            storage,
            Arc::clone(&projects),
            Arc::clone(&secrets),
            root_key,
        );
        Fixture {
            engine,
            projects,
            secrets,
            project_id: project.id,
        }
    }

    pub(crate) fn policy(kind: PolicyKind, path: &str, approvals: u32) -> NewPolicy {
        NewPolicy {
            kind,
            name: format!("{:?} {}", kind, path),
            environment: "prod".into(),
            secret_path: path.into(),
            approvals,
            approvers: vec!["alice".into(), "bob".into()],
            enforcement: Enforcement::Hard,
        }
    }
}
