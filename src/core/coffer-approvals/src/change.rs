//! Secret change requests.
//!
//! Writes to a folder covered by a `change` policy are held in a change
//! request. Approvers review it; merging applies every commit through the
//! secrets engine in one transaction and closes the request.

use tracing::{info, warn};
use uuid::Uuid;

use coffer_crypto::Sealed;
use coffer_projects::now;
use coffer_secrets::{SecretLocation, SecretUpdate, SecretWrite};

use crate::{
    ApprovalError, ApprovalPolicy, ApprovalsEngine, ChangeRequest, ChangeStatus, CommitOp,
    Enforcement, NewCommit, PolicyKind, Review, ReviewStatus, SecretCommit,
};

fn commit_aad(request_id: &str, index: usize) -> String {
    format!("{}:{}", request_id, index)
}

impl ApprovalsEngine {
    /// Holds `commits` for review under `policy`.
    pub async fn create_change_request(
        &self,
        policy: &ApprovalPolicy,
        committer_id: &str,
        secret_path: &str,
        commits: Vec<NewCommit>,
    ) -> Result<ChangeRequest, ApprovalError> {
        if policy.kind != PolicyKind::Change {
            return Err(ApprovalError::Invalid(format!(
                "policy '{}' is not a change policy",
                policy.name
            )));
        }
        if commits.is_empty() {
            return Err(ApprovalError::Invalid("change request has no commits".into()));
        }

        let id = Uuid::new_v4().to_string();
        let key = self.data_key(&policy.project_id)?;
        let mut sealed = Vec::with_capacity(commits.len());
        for (index, commit) in commits.into_iter().enumerate() {
            if commit.op == CommitOp::Create && commit.value.is_none() {
                return Err(ApprovalError::Invalid(format!(
                    "creating '{}' requires a value",
                    commit.key
                )));
            }
            if sealed.iter().any(|c: &SecretCommit| c.key == commit.key) {
                return Err(ApprovalError::Invalid(format!(
                    "secret '{}' appears twice",
                    commit.key
                )));
            }
            let value = commit
                .value
                .map(|v| Sealed::seal(&key, v.as_bytes(), &commit_aad(&id, index)))
                .transpose()?;
            sealed.push(SecretCommit {
                op: commit.op,
                key: commit.key,
                new_key: commit.new_key,
                comment: commit.comment,
                value,
            });
        }

        let now = now();
        let request = ChangeRequest {
            id,
            project_id: policy.project_id.clone(),
            policy_id: policy.id.clone(),
            environment: policy.environment.clone(),
            secret_path: secret_path.to_string(),
            committer_id: committer_id.to_string(),
            status: ChangeStatus::Open,
            commits: sealed,
            reviews: Vec::new(),
            has_merged: false,
            merged_by: None,
            merged_at: None,
            bypass_reason: None,
            status_changed_by: None,
            created_at: now,
            updated_at: now,
        };
        self.change_requests.insert(&request.id, &request).await?;

        info!(
            project_id = %request.project_id,
            request_id = %request.id,
            commits = request.commits.len(),
            "Change request opened"
        );
        Ok(request)
    }

    /// Loads a change request.
    pub async fn get_change_request(
        &self,
        request_id: &str,
    ) -> Result<ChangeRequest, ApprovalError> {
        self.change_requests
            .get(request_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(format!("change request '{}'", request_id)))
    }

    /// Lists change requests of a project, newest first.
    pub async fn list_change_requests(
        &self,
        project_id: &str,
        status: Option<ChangeStatus>,
        committer_id: Option<&str>,
    ) -> Result<Vec<ChangeRequest>, ApprovalError> {
        let mut requests = self
            .change_requests
            .find(|r| {
                r.project_id == project_id
                    && status.map_or(true, |s| r.status == s)
                    && committer_id.map_or(true, |c| r.committer_id == c)
            })
            .await?;
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    fn can_act_on(
        request: &ChangeRequest,
        policy: &ApprovalPolicy,
        actor_id: &str,
        is_admin: bool,
    ) -> bool {
        is_admin || request.committer_id == actor_id || policy.approvers.iter().any(|a| a == actor_id)
    }

    /// Records or replaces the review of `reviewer_id`. Only approvers and
    /// project admins review.
    pub async fn review_change_request(
        &self,
        request_id: &str,
        reviewer_id: &str,
        reviewer_is_admin: bool,
        status: ReviewStatus,
    ) -> Result<ChangeRequest, ApprovalError> {
        let _guard = self.review_lock.lock().await;

        let mut request = self.get_change_request(request_id).await?;
        let policy = self.get_policy(&request.policy_id).await?;

        if !reviewer_is_admin && !policy.approvers.iter().any(|a| a == reviewer_id) {
            return Err(ApprovalError::Forbidden("not an approver of this policy".into()));
        }
        if request.status == ChangeStatus::Closed {
            return Err(ApprovalError::Invalid("the change request is closed".into()));
        }

        let now = now();
        request.reviews.retain(|r| r.reviewer_id != reviewer_id);
        request.reviews.push(Review {
            reviewer_id: reviewer_id.to_string(),
            status,
            created_at: now,
        });
        request.updated_at = now;
        self.change_requests.put(&request.id, &request).await?;

        info!(request_id = %request.id, reviewer_id = %reviewer_id, status = ?status, "Change request reviewed");
        Ok(request)
    }

    /// Opens or closes a change request.
    pub async fn set_change_request_status(
        &self,
        request_id: &str,
        actor_id: &str,
        actor_is_admin: bool,
        status: ChangeStatus,
    ) -> Result<ChangeRequest, ApprovalError> {
        let _guard = self.review_lock.lock().await;

        let mut request = self.get_change_request(request_id).await?;
        let policy = self.get_policy(&request.policy_id).await?;

        if !Self::can_act_on(&request, &policy, actor_id, actor_is_admin) {
            return Err(ApprovalError::Forbidden(
                "not allowed to change this request".into(),
            ));
        }
        if request.has_merged {
            return Err(ApprovalError::Invalid("the change request is merged".into()));
        }
        if request.status == status {
            return Err(ApprovalError::Invalid(format!(
                "the change request is already {:?}",
                status
            )));
        }

        request.status = status;
        request.status_changed_by = Some(actor_id.to_string());
        request.updated_at = now();
        self.change_requests.put(&request.id, &request).await?;

        info!(request_id = %request.id, status = ?status, "Change request status changed");
        Ok(request)
    }

    /// Applies the commits of an approved change request.
    ///
    /// Requires the policy's number of approvals from its approvers and no
    /// rejection. Under soft enforcement a project admin may merge anyway by
    /// giving `bypass_reason`.
    pub async fn merge_change_request(
        &self,
        request_id: &str,
        actor_id: &str,
        actor_is_admin: bool,
        bypass_reason: Option<&str>,
    ) -> Result<ChangeRequest, ApprovalError> {
        let _guard = self.review_lock.lock().await;

        let mut request = self.get_change_request(request_id).await?;
        let policy = self.get_policy(&request.policy_id).await?;

        if !Self::can_act_on(&request, &policy, actor_id, actor_is_admin) {
            return Err(ApprovalError::Forbidden(
                "not allowed to merge this request".into(),
            ));
        }
        if request.has_merged || request.status == ChangeStatus::Closed {
            return Err(ApprovalError::Invalid("the change request is closed".into()));
        }

        let approvals = request
            .reviews
            .iter()
            .filter(|r| {
                r.status == ReviewStatus::Approved && policy.approvers.contains(&r.reviewer_id)
            })
            .count();
        let rejected = request
            .reviews
            .iter()
            .any(|r| r.status == ReviewStatus::Rejected);
        let has_min_approvals = approvals >= policy.approvals as usize && !rejected;

        let reason = bypass_reason.map(str::trim).filter(|r| !r.is_empty());
        let bypassed = if has_min_approvals {
            false
        } else if policy.enforcement == Enforcement::Soft && actor_is_admin && reason.is_some() {
            warn!(request_id = %request.id, actor_id = %actor_id, "Change request merged without approvals");
            true
        } else {
            return Err(ApprovalError::Invalid(format!(
                "{} of {} required approvals",
                approvals, policy.approvals
            )));
        };

        let loc = SecretLocation::new(
            request.project_id.clone(),
            request.environment.clone(),
            &request.secret_path,
        )?;
        let key = self.data_key(&request.project_id)?;
        let mut writes = Vec::with_capacity(request.commits.len());
        for (index, commit) in request.commits.iter().enumerate() {
            let value = match &commit.value {
                Some(sealed) => {
                    let plain = sealed.open(&key, &commit_aad(&request.id, index))?;
                    Some(
                        String::from_utf8(plain.to_vec())
                            .map_err(|e| ApprovalError::Invalid(e.to_string()))?,
                    )
                },
                None => None,
            };

            writes.push(match commit.op {
                CommitOp::Create => SecretWrite::Create {
                    key: commit.key.clone(),
                    value: value.unwrap_or_default(),
                    comment: commit.comment.clone(),
                },
                CommitOp::Update => SecretWrite::Update {
                    key: commit.key.clone(),
                    update: SecretUpdate {
                        value,
                        new_key: commit.new_key.clone(),
                        comment: commit.comment.clone(),
                        expected_version: None,
                    },
                },
                CommitOp::Delete => SecretWrite::Delete {
                    key: commit.key.clone(),
                },
            });
        }
        // All commits land in one transaction or none do.
        self.secrets
            .apply(&loc, writes, &request.committer_id)
            .await?;

        let now = now();
        request.has_merged = true;
        request.status = ChangeStatus::Closed;
        request.merged_by = Some(actor_id.to_string());
        request.merged_at = Some(now);
        request.bypass_reason = if bypassed { reason.map(str::to_string) } else { None };
        request.updated_at = now;
        self.change_requests.put(&request.id, &request).await?;

        info!(
            request_id = %request.id,
            merged_by = %actor_id,
            commits = request.commits.len(),
            "Change request merged"
        );
        Ok(request)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use crate::testing::*;
    use crate::*;
    use coffer_secrets::SecretLocation;

    fn commit(op: CommitOp, key: &str, value: Option<&str>) -> NewCommit {
        NewCommit {
            op,
            key: key.into(),
            new_key: None,
            value: value.map(str::to_string),
            comment: None,
        }
    }

    async fn open_request(f: &Fixture, enforcement: Enforcement) -> ChangeRequest {
        let mut new = policy(PolicyKind::Change, "/", 2);
        new.enforcement = enforcement;
        let policy = f.engine.create_policy(&f.project_id, new).await.unwrap();
        f.engine
            .create_change_request(
                &policy,
                "carol",
                "/",
                vec![commit(CommitOp::Create, "DB_URL", Some("postgres://db"))],
            )
            .await
            .unwrap()
    }

    fn location(f: &Fixture) -> SecretLocation {
        SecretLocation::new(f.project_id.clone(), "prod", "/").unwrap()
    }

    #[tokio::test]
    async fn test_values_are_sealed() {
        let f = fixture().await;
        let request = open_request(&f, Enforcement::Hard).await;
        assert!(request.commits[0].has_value());
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("postgres://db"));
    }

    #[tokio::test]
    async fn test_merge_requires_approvals() {
        let f = fixture().await;
        let request = open_request(&f, Enforcement::Hard).await;

        f.engine
            .review_change_request(&request.id, "alice", false, ReviewStatus::Approved)
            .await
            .unwrap();
        assert!(matches!(
            f.engine
                .merge_change_request(&request.id, "carol", false, None)
                .await,
            Err(ApprovalError::Invalid(_))
        ));
        // hard enforcement ignores a bypass reason
        assert!(f
            .engine
            .merge_change_request(&request.id, "admin", true, Some("urgent"))
            .await
            .is_err());

        f.engine
            .review_change_request(&request.id, "bob", false, ReviewStatus::Approved)
            .await
            .unwrap();
        let merged = f
            .engine
            .merge_change_request(&request.id, "carol", false, None)
            .await
            .unwrap();
        assert!(merged.has_merged);
        assert_eq!(merged.status, ChangeStatus::Closed);

        let secret = f
            .secrets
            .get(&location(&f), "DB_URL", None)
            .await
            .unwrap();
        assert_eq!(secret.value, "postgres://db");

        assert!(f
            .engine
            .merge_change_request(&request.id, "carol", false, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_request_cannot_merge() {
        let f = fixture().await;
        let request = open_request(&f, Enforcement::Hard).await;
        for approver in ["alice", "bob"] {
            f.engine
                .review_change_request(&request.id, approver, false, ReviewStatus::Approved)
                .await
                .unwrap();
        }

        f.engine
            .set_change_request_status(&request.id, "carol", false, ChangeStatus::Closed)
            .await
            .unwrap();
        assert!(f
            .engine
            .merge_change_request(&request.id, "carol", false, None)
            .await
            .is_err());

        let reopened = f
            .engine
            .set_change_request_status(&request.id, "carol", false, ChangeStatus::Open)
            .await
            .unwrap();
        assert_eq!(reopened.status, ChangeStatus::Open);
        f.engine
            .merge_change_request(&request.id, "carol", false, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejection_blocks_merge() {
        let f = fixture().await;
        let request = open_request(&f, Enforcement::Hard).await;
        f.engine
            .review_change_request(&request.id, "alice", false, ReviewStatus::Approved)
            .await
            .unwrap();
        f.engine
            .review_change_request(&request.id, "bob", false, ReviewStatus::Rejected)
            .await
            .unwrap();
        assert!(f
            .engine
            .merge_change_request(&request.id, "alice", false, None)
            .await
            .is_err());

        // carol is not an approver
        assert!(matches!(
            f.engine
                .review_change_request(&request.id, "carol", false, ReviewStatus::Approved)
                .await,
            Err(ApprovalError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_enforcement_bypass() {
        let f = fixture().await;
        let request = open_request(&f, Enforcement::Soft).await;

        assert!(f
            .engine
            .merge_change_request(&request.id, "admin", true, None)
            .await
            .is_err());
        assert!(f
            .engine
            .merge_change_request(&request.id, "carol", false, Some("hotfix"))
            .await
            .is_err());

        let merged = f
            .engine
            .merge_change_request(&request.id, "admin", true, Some("hotfix"))
            .await
            .unwrap();
        assert_eq!(merged.bypass_reason.as_deref(), Some("hotfix"));
        assert_eq!(merged.merged_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_update_and_delete_commits() {
        let f = fixture().await;
        f.secrets
            .create(&location(&f), "API_KEY", "old", None, "carol")
            .await
            .unwrap();
        f.secrets
            .create(&location(&f), "LEGACY", "x", None, "carol")
            .await
            .unwrap();

        let policy = f
            .engine
            .create_policy(&f.project_id, policy(PolicyKind::Change, "/", 1))
            .await
            .unwrap();
        let request = f
            .engine
            .create_change_request(
                &policy,
                "carol",
                "/",
                vec![
                    commit(CommitOp::Update, "API_KEY", Some("new")),
                    commit(CommitOp::Delete, "LEGACY", None),
                ],
            )
            .await
            .unwrap();
        f.engine
            .review_change_request(&request.id, "bob", false, ReviewStatus::Approved)
            .await
            .unwrap();
        f.engine
            .merge_change_request(&request.id, "bob", false, None)
            .await
            .unwrap();

        let secret = f
            .secrets
            .get(&location(&f), "API_KEY", None)
            .await
            .unwrap();
        assert_eq!(secret.value, "new");
        assert_eq!(secret.version, 2);
        assert!(f.secrets.get(&location(&f), "LEGACY", None).await.is_err());
    }

    #[tokio::test]
    async fn test_conflicting_commit_merges_nothing() {
        let f = fixture().await;
        f.secrets
            .create(&location(&f), "TAKEN", "existing", None, "carol")
            .await
            .unwrap();

        let policy = f
            .engine
            .create_policy(&f.project_id, policy(PolicyKind::Change, "/", 1))
            .await
            .unwrap();
        let request = f
            .engine
            .create_change_request(
                &policy,
                "carol",
                "/",
                vec![
                    commit(CommitOp::Create, "FRESH", Some("a")),
                    commit(CommitOp::Create, "TAKEN", Some("b")),
                ],
            )
            .await
            .unwrap();
        f.engine
            .review_change_request(&request.id, "bob", false, ReviewStatus::Approved)
            .await
            .unwrap();

        assert!(f
            .engine
            .merge_change_request(&request.id, "bob", false, None)
            .await
            .is_err());
        assert!(f.secrets.get(&location(&f), "FRESH", None).await.is_err());
        let stored = f.engine.get_change_request(&request.id).await.unwrap();
        assert!(!stored.has_merged);
        assert_eq!(stored.status, ChangeStatus::Open);

        // once the conflict is gone the same request merges fully
        f.secrets.delete(&location(&f), "TAKEN").await.unwrap();
        f.engine
            .merge_change_request(&request.id, "bob", false, None)
            .await
            .unwrap();
        assert_eq!(
            f.secrets
                .get(&location(&f), "FRESH", None)
                .await
                .unwrap()
                .value,
            "a"
        );
        assert_eq!(
            f.secrets
                .get(&location(&f), "TAKEN", None)
                .await
                .unwrap()
                .value,
            "b"
        );
    }
}

