//! Access requests.
//!
//! A member asks for actions on a folder glob. The matching access policy
//! decides who may approve and how many approvals are needed. When approved
//! reviews reach that number, a privilege is granted to the requester.

use tracing::{debug, info};
use uuid::Uuid;

use coffer_projects::{now, PrivilegeGrant};

use crate::{
    AccessRequest, AccessRequestCount, AccessRequestStatus, ApprovalError, ApprovalsEngine,
    NewAccessRequest, PolicyKind, Review, ReviewStatus,
};

fn parse_range(range: &str) -> Result<u64, ApprovalError> {
    let duration = humantime::parse_duration(range)
        .map_err(|e| ApprovalError::Invalid(format!("invalid temporary range '{}': {}", range, e)))?;
    if duration.as_secs() == 0 {
        return Err(ApprovalError::Invalid("temporary range must be positive".into()));
    }
    Ok(duration.as_secs())
}

impl ApprovalsEngine {
    /// Opens an access request for `requested_by`.
    pub async fn create_access_request(
        &self,
        project_id: &str,
        requested_by: &str,
        new: NewAccessRequest,
    ) -> Result<AccessRequest, ApprovalError> {
        if self
            .projects
            .get_membership(project_id, requested_by)
            .await?
            .is_none()
        {
            return Err(ApprovalError::Forbidden("not a member of this project".into()));
        }
        self.projects
            .get_environment(project_id, &new.environment)
            .await?;

        let mut actions = new.actions;
        actions.sort_by_key(|a| a.to_string());
        actions.dedup();
        if actions.is_empty() {
            return Err(ApprovalError::Invalid("at least one action is required".into()));
        }
        if let Some(range) = &new.temporary_range {
            parse_range(range)?;
        }
        let secret_path = Self::validate_glob(&new.secret_path)?;

        let policy = self
            .find_policy(project_id, PolicyKind::Access, &new.environment, &secret_path)
            .await?
            .ok_or_else(|| ApprovalError::NotFound("access policy matching criteria".into()))?;

        let is_temporary = new.temporary_range.is_some();
        let duplicates = self
            .access_requests
            .find(|r| {
                r.policy_id == policy.id
                    && r.requested_by == requested_by
                    && r.environment == new.environment
                    && r.secret_path == secret_path
                    && r.actions == actions
                    && r.is_temporary == is_temporary
            })
            .await?;
        let now = now();
        for duplicate in duplicates {
            if let Some(privilege_id) = &duplicate.privilege_id {
                let privilege = self.projects.get_privilege(project_id, privilege_id).await?;
                if privilege.is_some_and(|p| p.is_active(now)) {
                    return Err(ApprovalError::AlreadyExists(
                        "active privilege with the same criteria".into(),
                    ));
                }
            } else if duplicate.status == AccessRequestStatus::Pending {
                return Err(ApprovalError::AlreadyExists(
                    "pending access request with the same criteria".into(),
                ));
            }
        }

        let request = AccessRequest {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            policy_id: policy.id,
            requested_by: requested_by.to_string(),
            environment: new.environment,
            secret_path,
            actions,
            is_temporary,
            temporary_range: new.temporary_range,
            privilege_id: None,
            status: AccessRequestStatus::Pending,
            reviews: Vec::new(),
            created_at: now,
        };
        self.access_requests.insert(&request.id, &request).await?;

        info!(
            project_id = %project_id,
            request_id = %request.id,
            requested_by = %requested_by,
            "Access request created"
        );
        Ok(request)
    }

    /// Loads an access request.
    pub async fn get_access_request(
        &self,
        request_id: &str,
    ) -> Result<AccessRequest, ApprovalError> {
        self.access_requests
            .get(request_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(format!("access request '{}'", request_id)))
    }

    /// Lists access requests of a project, newest first.
    pub async fn list_access_requests(
        &self,
        project_id: &str,
        environment: Option<&str>,
        requested_by: Option<&str>,
    ) -> Result<Vec<AccessRequest>, ApprovalError> {
        let mut requests = self
            .access_requests
            .find(|r| {
                r.project_id == project_id
                    && environment.map_or(true, |e| r.environment == e)
                    && requested_by.map_or(true, |u| r.requested_by == u)
            })
            .await?;
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    /// Counts pending and finalized access requests of a project.
    pub async fn count_access_requests(
        &self,
        project_id: &str,
    ) -> Result<AccessRequestCount, ApprovalError> {
        let requests = self
            .access_requests
            .find(|r| r.project_id == project_id)
            .await?;
        let pending_count = requests
            .iter()
            .filter(|r| r.status == AccessRequestStatus::Pending)
            .count();
        Ok(AccessRequestCount {
            pending_count,
            finalized_count: requests.len() - pending_count,
        })
    }

    /// Records a review.
    ///
    /// Project admins and the policy's approvers may approve or reject. The
    /// requester may only reject, which withdraws the request.
    pub async fn review_access_request(
        &self,
        request_id: &str,
        reviewer_id: &str,
        reviewer_is_admin: bool,
        status: ReviewStatus,
    ) -> Result<AccessRequest, ApprovalError> {
        let _guard = self.review_lock.lock().await;

        let mut request = self.get_access_request(request_id).await?;
        let policy = self.get_policy(&request.policy_id).await?;

        let is_approver = policy.approvers.iter().any(|a| a == reviewer_id);
        let is_requester = request.requested_by == reviewer_id;
        let withdrawing = is_requester && status == ReviewStatus::Rejected;
        if !reviewer_is_admin && !is_approver && !withdrawing {
            return Err(ApprovalError::Forbidden(
                "not authorized to review this request".into(),
            ));
        }

        if request.status == AccessRequestStatus::Rejected {
            return Err(ApprovalError::Invalid(
                "the request has already been rejected".into(),
            ));
        }
        if request.reviews.iter().any(|r| r.reviewer_id == reviewer_id) {
            return Err(ApprovalError::Invalid("already reviewed this request".into()));
        }

        let now = now();
        request.reviews.push(Review {
            reviewer_id: reviewer_id.to_string(),
            status,
            created_at: now,
        });

        let approved = request
            .reviews
            .iter()
            .filter(|r| r.status == ReviewStatus::Approved)
            .count();

        if status == ReviewStatus::Rejected {
            request.status = AccessRequestStatus::Rejected;
        } else if request.privilege_id.is_none() && approved == policy.approvals as usize {
            let temporary_end = match &request.temporary_range {
                Some(range) => Some(now + parse_range(range)?),
                None => None,
            };
            let privilege = self
                .projects
                .create_privilege(
                    &request.project_id,
                    &request.requested_by,
                    PrivilegeGrant {
                        environment: request.environment.clone(),
                        secret_path: request.secret_path.clone(),
                        actions: request.actions.clone(),
                    },
                    temporary_end,
                )
                .await?;
            request.privilege_id = Some(privilege.id);
            request.status = AccessRequestStatus::Approved;
        }

        self.access_requests.put(&request.id, &request).await?;

        debug!(
            request_id = %request.id,
            reviewer_id = %reviewer_id,
            status = ?status,
            approved,
            required = policy.approvals,
            "Access request reviewed"
        );
        Ok(request)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use crate::testing::*;
    use crate::*;
    use coffer_projects::Action;

    fn read_request(range: Option<&str>) -> NewAccessRequest {
        NewAccessRequest {
            environment: "prod".into(),
            secret_path: "/app".into(),
            actions: vec![Action::Read],
            temporary_range: range.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_no_matching_policy() {
        let f = fixture().await;
        assert!(matches!(
            f.engine
                .create_access_request(&f.project_id, "carol", read_request(None))
                .await,
            Err(ApprovalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_privilege_created_at_threshold() {
        let f = fixture().await;
        f.engine
            .create_policy(&f.project_id, policy(PolicyKind::Access, "/**", 2))
            .await
            .unwrap();
        let request = f
            .engine
            .create_access_request(&f.project_id, "carol", read_request(Some("1h")))
            .await
            .unwrap();

        let after_one = f
            .engine
            .review_access_request(&request.id, "alice", false, ReviewStatus::Approved)
            .await
            .unwrap();
        assert_eq!(after_one.status, AccessRequestStatus::Pending);
        assert!(after_one.privilege_id.is_none());

        let after_two = f
            .engine
            .review_access_request(&request.id, "bob", false, ReviewStatus::Approved)
            .await
            .unwrap();
        assert_eq!(after_two.status, AccessRequestStatus::Approved);
        let privilege = f
            .projects
            .get_privilege(&f.project_id, after_two.privilege_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(privilege.actor_id, "carol");
        let end = privilege.temporary_end.unwrap();
        assert!(end + 5 >= privilege.created_at + 3600);

        let count = f.engine.count_access_requests(&f.project_id).await.unwrap();
        assert_eq!(count.pending_count, 0);
        assert_eq!(count.finalized_count, 1);
    }

    #[tokio::test]
    async fn test_review_rules() {
        let f = fixture().await;
        f.engine
            .create_policy(&f.project_id, policy(PolicyKind::Access, "/app", 2))
            .await
            .unwrap();
        let request = f
            .engine
            .create_access_request(&f.project_id, "carol", read_request(None))
            .await
            .unwrap();

        // carol is neither admin nor approver
        assert!(matches!(
            f.engine
                .review_access_request(&request.id, "carol", false, ReviewStatus::Approved)
                .await,
            Err(ApprovalError::Forbidden(_))
        ));

        f.engine
            .review_access_request(&request.id, "alice", false, ReviewStatus::Approved)
            .await
            .unwrap();
        assert!(matches!(
            f.engine
                .review_access_request(&request.id, "alice", false, ReviewStatus::Approved)
                .await,
            Err(ApprovalError::Invalid(_))
        ));

        let rejected = f
            .engine
            .review_access_request(&request.id, "bob", false, ReviewStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(rejected.status, AccessRequestStatus::Rejected);
        assert!(matches!(
            f.engine
                .review_access_request(&request.id, "admin", true, ReviewStatus::Approved)
                .await,
            Err(ApprovalError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_requests() {
        let f = fixture().await;
        f.engine
            .create_policy(&f.project_id, policy(PolicyKind::Access, "/app", 1))
            .await
            .unwrap();
        let request = f
            .engine
            .create_access_request(&f.project_id, "carol", read_request(None))
            .await
            .unwrap();
        assert!(matches!(
            f.engine
                .create_access_request(&f.project_id, "carol", read_request(None))
                .await,
            Err(ApprovalError::AlreadyExists(_))
        ));

        f.engine
            .review_access_request(&request.id, "alice", false, ReviewStatus::Approved)
            .await
            .unwrap();
        // permanent privilege still active
        assert!(matches!(
            f.engine
                .create_access_request(&f.project_id, "carol", read_request(None))
                .await,
            Err(ApprovalError::AlreadyExists(_))
        ));

        // a temporary request is a different request
        f.engine
            .create_access_request(&f.project_id, "carol", read_request(Some("30m")))
            .await
            .unwrap();
        assert_eq!(
            f.engine
                .list_access_requests(&f.project_id, Some("prod"), Some("carol"))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_non_member_and_bad_range() {
        let f = fixture().await;
        f.engine
            .create_policy(&f.project_id, policy(PolicyKind::Access, "/app", 1))
            .await
            .unwrap();
        assert!(matches!(
            f.engine
                .create_access_request(&f.project_id, "mallory", read_request(None))
                .await,
            Err(ApprovalError::Forbidden(_))
        ));
        assert!(matches!(
            f.engine
                .create_access_request(&f.project_id, "carol", read_request(Some("soon")))
                .await,
            Err(ApprovalError::Invalid(_))
        ));
    }
}
