//! # Coffer Projects
//!
//! Organizations, users, projects, environments, folders and memberships,
//! plus the permission model every other engine checks against.
//!
//! ## Defaults
//!
//! - A new project gets the `dev`, `staging` and `prod` environments.
//! - The creator of a project becomes its admin.
//! - The root folder `/` exists implicitly in every environment.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod path;
pub mod permission;

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use coffer_storage::{Collection, StorageBackend};

pub use error::ProjectError;
pub use models::{
    ActorKind, Environment, Folder, Membership, NewUser, OrgRole, OrgUser, Organization,
    Privilege, PrivilegeGrant, Project, ProjectRole, UserUpdate,
};
pub use permission::{Action, ProjectPermission, Subject};

const DEFAULT_ENVIRONMENTS: [(&str, &str); 3] = [
    ("Development", "dev"),
    ("Staging", "staging"),
    ("Production", "prod"),
];

/// Returns the current Unix timestamp.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Derives a slug from a display name: lowercase, `-` separated.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn validate_slug(slug: &str) -> Result<(), ProjectError> {
    let valid = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ProjectError::Invalid(format!(
            "slug '{}' must match [a-z0-9-]{{1,64}}",
            slug
        )))
    }
}

/// Fields for a new project.
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    /// Display name.
    pub name: String,
    /// Slug; derived from the name when absent.
    pub slug: Option<String>,
    /// Description.
    pub description: Option<String>,
}

/// Stores organizations, users, projects and everything scoped to them.
pub struct ProjectsEngine {
    orgs: Collection<Organization>,
    users: Collection<OrgUser>,
    projects: Collection<Project>,
    environments: Collection<Environment>,
    folders: Collection<Folder>,
    memberships: Collection<Membership>,
    privileges: Collection<Privilege>,
}

impl ProjectsEngine {
    /// Creates the engine on top of `storage`.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            orgs: Collection::new(Arc::clone(&storage), "orgs"),
            users: Collection::new(Arc::clone(&storage), "org-users"),
            projects: Collection::new(Arc::clone(&storage), "projects"),
            environments: Collection::new(Arc::clone(&storage), "environments"),
            folders: Collection::new(Arc::clone(&storage), "folders"),
            memberships: Collection::new(Arc::clone(&storage), "memberships"),
            privileges: Collection::new(storage, "privileges"),
        }
    }

    // ---- Organizations -------------------------------------------------

    /// Creates an organization.
    pub async fn create_org(&self, name: &str) -> Result<Organization, ProjectError> {
        let slug = slugify(name);
        validate_slug(&slug)?;
        if self.orgs.find_one(|o| o.slug == slug).await?.is_some() {
            return Err(ProjectError::AlreadyExists(format!("organization '{}'", slug)));
        }

        let org = Organization {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            slug,
            created_at: now(),
        };
        self.orgs.insert(&org.id, &org).await?;

        info!(org_id = %org.id, slug = %org.slug, "Organization created");
        Ok(org)
    }

    /// Loads an organization.
    pub async fn get_org(&self, org_id: &str) -> Result<Organization, ProjectError> {
        self.orgs
            .get(org_id)
            .await?
            .ok_or_else(|| ProjectError::NotFound(format!("organization '{}'", org_id)))
    }

    /// Lists every organization.
    pub async fn list_orgs(&self) -> Result<Vec<Organization>, ProjectError> {
        Ok(self.orgs.all().await?)
    }

    // ---- Users ---------------------------------------------------------

    /// Adds a user to an organization. Emails are unique per organization.
    pub async fn create_user(
        &self,
        org_id: &str,
        new: NewUser,
    ) -> Result<OrgUser, ProjectError> {
        self.get_org(org_id).await?;

        let email = new.email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(ProjectError::Invalid(format!("invalid email '{}'", email)));
        }
        if self.find_user_by_email(org_id, &email).await?.is_some() {
            return Err(ProjectError::AlreadyExists(format!("user '{}'", email)));
        }

        let user = OrgUser {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            username: new.username.unwrap_or_else(|| email.clone()),
            email,
            first_name: new.first_name,
            last_name: new.last_name,
            org_role: new.org_role,
            active: true,
            created_at: now(),
        };
        self.users.insert(&user.id, &user).await?;

        info!(org_id = %org_id, user_id = %user.id, "User added to organization");
        Ok(user)
    }

    /// Loads a user.
    pub async fn get_user(&self, user_id: &str) -> Result<OrgUser, ProjectError> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| ProjectError::NotFound(format!("user '{}'", user_id)))
    }

    /// Looks a user up by email within an organization.
    pub async fn find_user_by_email(
        &self,
        org_id: &str,
        email: &str,
    ) -> Result<Option<OrgUser>, ProjectError> {
        let email = email.trim().to_lowercase();
        Ok(self
            .users
            .find_one(|u| u.org_id == org_id && u.email == email)
            .await?)
    }

    /// Lists the users of an organization.
    pub async fn list_users(&self, org_id: &str) -> Result<Vec<OrgUser>, ProjectError> {
        Ok(self.users.find(|u| u.org_id == org_id).await?)
    }

    /// Applies a partial update to a user.
    pub async fn update_user(
        &self,
        user_id: &str,
        update: UserUpdate,
    ) -> Result<OrgUser, ProjectError> {
        let mut user = self.get_user(user_id).await?;

        if let Some(email) = update.email {
            let email = email.trim().to_lowercase();
            if email != user.email {
                if self.find_user_by_email(&user.org_id, &email).await?.is_some() {
                    return Err(ProjectError::AlreadyExists(format!("user '{}'", email)));
                }
                user.email = email;
            }
        }
        if let Some(first) = update.first_name {
            user.first_name = Some(first);
        }
        if let Some(last) = update.last_name {
            user.last_name = Some(last);
        }
        if let Some(active) = update.active {
            user.active = active;
        }

        self.users.put(&user.id, &user).await?;
        debug!(user_id = %user.id, active = user.active, "User updated");
        Ok(user)
    }

    /// Removes a user from its organization and from every project.
    pub async fn delete_user(&self, user_id: &str) -> Result<OrgUser, ProjectError> {
        let user = self.get_user(user_id).await?;

        for membership in self.memberships.find(|m| m.actor_id == user_id).await? {
            self.memberships
                .remove(&membership_key(&membership.project_id, user_id))
                .await?;
        }
        self.users.remove(user_id).await?;

        info!(org_id = %user.org_id, user_id = %user_id, "User removed from organization");
        Ok(user)
    }

    // ---- Projects ------------------------------------------------------

    /// Creates a project with the default environments and makes `creator`
    /// its admin.
    pub async fn create_project(
        &self,
        org_id: &str,
        creator_id: &str,
        creator_kind: ActorKind,
        new: NewProject,
    ) -> Result<Project, ProjectError> {
        self.get_org(org_id).await?;

        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(ProjectError::Invalid("project name cannot be empty".into()));
        }
        let slug = new.slug.unwrap_or_else(|| slugify(&name));
        validate_slug(&slug)?;
        if self
            .projects
            .find_one(|p| p.org_id == org_id && p.slug == slug)
            .await?
            .is_some()
        {
            return Err(ProjectError::AlreadyExists(format!("project '{}'", slug)));
        }

        let project = Project {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            name,
            slug,
            description: new.description,
            created_at: now(),
        };
        self.projects.insert(&project.id, &project).await?;

        for (name, slug) in DEFAULT_ENVIRONMENTS {
            self.create_environment(&project.id, name, slug).await?;
        }
        self.add_membership(&project.id, creator_id, creator_kind, ProjectRole::Admin)
            .await?;

        info!(project_id = %project.id, org_id = %org_id, "Project created");
        Ok(project)
    }

    /// Loads a project.
    pub async fn get_project(&self, project_id: &str) -> Result<Project, ProjectError> {
        self.projects
            .get(project_id)
            .await?
            .ok_or_else(|| ProjectError::NotFound(format!("project '{}'", project_id)))
    }

    /// Loads a project by organization and slug.
    pub async fn get_project_by_slug(
        &self,
        org_id: &str,
        slug: &str,
    ) -> Result<Project, ProjectError> {
        self.projects
            .find_one(|p| p.org_id == org_id && p.slug == slug)
            .await?
            .ok_or_else(|| ProjectError::NotFound(format!("project '{}'", slug)))
    }

    /// Lists the projects `actor_id` is a member of.
    pub async fn list_projects_for_actor(
        &self,
        actor_id: &str,
    ) -> Result<Vec<Project>, ProjectError> {
        let mut projects = Vec::new();
        for membership in self.memberships.find(|m| m.actor_id == actor_id).await? {
            if let Some(project) = self.projects.get(&membership.project_id).await? {
                projects.push(project);
            }
        }
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    // ---- Environments --------------------------------------------------

    /// Adds an environment to a project.
    pub async fn create_environment(
        &self,
        project_id: &str,
        name: &str,
        slug: &str,
    ) -> Result<Environment, ProjectError> {
        validate_slug(slug)?;
        let existing = self.list_environments(project_id).await?;
        if existing.iter().any(|e| e.slug == slug) {
            return Err(ProjectError::AlreadyExists(format!("environment '{}'", slug)));
        }

        let env = Environment {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name: name.trim().to_string(),
            slug: slug.to_string(),
            position: existing.len() as u32 + 1,
        };
        self.environments
            .insert(&format!("{}/{}", project_id, slug), &env)
            .await?;

        debug!(project_id = %project_id, environment = %slug, "Environment created");
        Ok(env)
    }

    /// Lists the environments of a project in display order.
    pub async fn list_environments(
        &self,
        project_id: &str,
    ) -> Result<Vec<Environment>, ProjectError> {
        let mut envs = self.environments.under(&format!("{}/", project_id)).await?;
        envs.sort_by_key(|e| e.position);
        Ok(envs)
    }

    /// Loads an environment by slug.
    pub async fn get_environment(
        &self,
        project_id: &str,
        slug: &str,
    ) -> Result<Environment, ProjectError> {
        self.environments
            .get(&format!("{}/{}", project_id, slug))
            .await?
            .ok_or_else(|| ProjectError::NotFound(format!("environment '{}'", slug)))
    }

    // ---- Folders -------------------------------------------------------

    /// Creates `name` under `parent_path`. The parent must exist.
    pub async fn create_folder(
        &self,
        project_id: &str,
        environment: &str,
        parent_path: &str,
        name: &str,
    ) -> Result<Folder, ProjectError> {
        self.get_environment(project_id, environment).await?;
        let parent_path = path::normalize(parent_path)?;
        self.require_folder(project_id, environment, &parent_path)
            .await?;

        let child = path::normalize(&format!("/{}", name))?;
        if child == "/" || child[1..].contains('/') {
            return Err(ProjectError::Invalid(format!(
                "invalid folder name '{}'",
                name
            )));
        }
        let full = path::join(&parent_path, &child[1..]);
        if self.find_folder(project_id, environment, &full).await?.is_some() {
            return Err(ProjectError::AlreadyExists(format!("folder '{}'", full)));
        }

        let folder = Folder {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            environment: environment.to_string(),
            parent_path,
            name: child[1..].to_string(),
            path: full,
            created_at: now(),
        };
        self.folders
            .insert(&format!("{}/{}", project_id, folder.id), &folder)
            .await?;

        debug!(project_id = %project_id, environment = %environment, path = %folder.path, "Folder created");
        Ok(folder)
    }

    async fn find_folder(
        &self,
        project_id: &str,
        environment: &str,
        full_path: &str,
    ) -> Result<Option<Folder>, ProjectError> {
        Ok(self
            .folders
            .under(&format!("{}/", project_id))
            .await?
            .into_iter()
            .find(|f| f.environment == environment && f.path == full_path))
    }

    /// Lists the direct children of `parent_path`.
    pub async fn list_folders(
        &self,
        project_id: &str,
        environment: &str,
        parent_path: &str,
    ) -> Result<Vec<Folder>, ProjectError> {
        let parent_path = path::normalize(parent_path)?;
        let mut folders: Vec<Folder> = self
            .folders
            .under(&format!("{}/", project_id))
            .await?
            .into_iter()
            .filter(|f| f.environment == environment && f.parent_path == parent_path)
            .collect();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(folders)
    }

    /// Loads a folder by id.
    pub async fn get_folder(
        &self,
        project_id: &str,
        folder_id: &str,
    ) -> Result<Folder, ProjectError> {
        self.folders
            .get(&format!("{}/{}", project_id, folder_id))
            .await?
            .ok_or_else(|| ProjectError::NotFound(format!("folder '{}'", folder_id)))
    }

    /// Deletes a folder and every folder below it.
    pub async fn delete_folder(
        &self,
        project_id: &str,
        folder_id: &str,
    ) -> Result<Folder, ProjectError> {
        let folder = self.get_folder(project_id, folder_id).await?;

        for child in self.folders.under(&format!("{}/", project_id)).await? {
            if child.environment == folder.environment && path::is_within(&child.path, &folder.path)
            {
                self.folders
                    .remove(&format!("{}/{}", project_id, child.id))
                    .await?;
            }
        }

        info!(project_id = %project_id, path = %folder.path, "Folder deleted");
        Ok(folder)
    }

    /// Whether the folder at `folder_path` exists. `/` always does.
    pub async fn folder_exists(
        &self,
        project_id: &str,
        environment: &str,
        folder_path: &str,
    ) -> Result<bool, ProjectError> {
        let folder_path = path::normalize(folder_path)?;
        if folder_path == "/" {
            return Ok(true);
        }
        Ok(self
            .find_folder(project_id, environment, &folder_path)
            .await?
            .is_some())
    }

    /// Fails with [`ProjectError::NotFound`] unless the folder exists.
    pub async fn require_folder(
        &self,
        project_id: &str,
        environment: &str,
        folder_path: &str,
    ) -> Result<(), ProjectError> {
        if self
            .folder_exists(project_id, environment, folder_path)
            .await?
        {
            Ok(())
        } else {
            Err(ProjectError::NotFound(format!(
                "folder '{}' in environment '{}'",
                folder_path, environment
            )))
        }
    }

    // ---- Memberships ---------------------------------------------------

    /// Adds or replaces the membership of `actor_id` in a project.
    pub async fn add_membership(
        &self,
        project_id: &str,
        actor_id: &str,
        actor_kind: ActorKind,
        role: ProjectRole,
    ) -> Result<Membership, ProjectError> {
        self.get_project(project_id).await?;

        let membership = Membership {
            project_id: project_id.to_string(),
            actor_id: actor_id.to_string(),
            actor_kind,
            role,
            created_at: now(),
        };
        self.memberships
            .put(&membership_key(project_id, actor_id), &membership)
            .await?;

        info!(project_id = %project_id, actor_id = %actor_id, role = ?role, "Project membership set");
        Ok(membership)
    }

    /// Loads the membership of `actor_id`, if any.
    pub async fn get_membership(
        &self,
        project_id: &str,
        actor_id: &str,
    ) -> Result<Option<Membership>, ProjectError> {
        Ok(self
            .memberships
            .get(&membership_key(project_id, actor_id))
            .await?)
    }

    /// Lists the members of a project.
    pub async fn list_memberships(
        &self,
        project_id: &str,
    ) -> Result<Vec<Membership>, ProjectError> {
        Ok(self
            .memberships
            .under(&format!("{}/", project_id))
            .await?)
    }

    /// Removes a member and its privileges.
    pub async fn remove_membership(
        &self,
        project_id: &str,
        actor_id: &str,
    ) -> Result<(), ProjectError> {
        if !self
            .memberships
            .remove(&membership_key(project_id, actor_id))
            .await?
        {
            return Err(ProjectError::NotFound(format!("member '{}'", actor_id)));
        }
        for privilege in self.list_privileges(project_id, actor_id).await? {
            self.privileges
                .remove(&format!("{}/{}", project_id, privilege.id))
                .await?;
        }
        Ok(())
    }

    // ---- Privileges ----------------------------------------------------

    /// Grants an additional privilege to a project member.
    pub async fn create_privilege(
        &self,
        project_id: &str,
        actor_id: &str,
        grant: PrivilegeGrant,
        temporary_end: Option<u64>,
    ) -> Result<Privilege, ProjectError> {
        if self.get_membership(project_id, actor_id).await?.is_none() {
            return Err(ProjectError::NotFound(format!("member '{}'", actor_id)));
        }
        if grant.actions.is_empty() {
            return Err(ProjectError::Invalid("privilege grants no action".into()));
        }
        let grant = PrivilegeGrant {
            secret_path: path::validate_glob(&grant.secret_path)?,
            ..grant
        };

        let privilege = Privilege {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            actor_id: actor_id.to_string(),
            grant,
            temporary_end,
            created_at: now(),
        };
        self.privileges
            .insert(&format!("{}/{}", project_id, privilege.id), &privilege)
            .await?;

        info!(
            project_id = %project_id,
            actor_id = %actor_id,
            privilege_id = %privilege.id,
            temporary_end = ?temporary_end,
            "Privilege granted"
        );
        Ok(privilege)
    }

    /// Loads a privilege.
    pub async fn get_privilege(
        &self,
        project_id: &str,
        privilege_id: &str,
    ) -> Result<Option<Privilege>, ProjectError> {
        Ok(self
            .privileges
            .get(&format!("{}/{}", project_id, privilege_id))
            .await?)
    }

    /// Lists every privilege of `actor_id`, active or not.
    pub async fn list_privileges(
        &self,
        project_id: &str,
        actor_id: &str,
    ) -> Result<Vec<Privilege>, ProjectError> {
        Ok(self
            .privileges
            .under(&format!("{}/", project_id))
            .await?
            .into_iter()
            .filter(|p| p.actor_id == actor_id)
            .collect())
    }

    // ---- Permission ----------------------------------------------------

    /// Resolves the effective permission of `actor_id` in a project.
    ///
    /// Actors outside the project's organization, and non-members, are
    /// rejected with [`ProjectError::Forbidden`].
    pub async fn project_permission(
        &self,
        project_id: &str,
        actor_id: &str,
        actor_org_id: &str,
    ) -> Result<ProjectPermission, ProjectError> {
        let project = self.get_project(project_id).await?;
        if project.org_id != actor_org_id {
            return Err(ProjectError::Forbidden(
                "project belongs to another organization".into(),
            ));
        }

        let membership = self
            .get_membership(project_id, actor_id)
            .await?
            .ok_or_else(|| ProjectError::Forbidden("not a member of this project".into()))?;

        let privileges = self.list_privileges(project_id, actor_id).await?;

        Ok(ProjectPermission::new(
            project.id,
            project.org_id,
            actor_id,
            membership.role,
            privileges,
            now(),
        ))
    }
}

fn membership_key(project_id: &str, actor_id: &str) -> String {
    format!("{}/{}", project_id, actor_id)
}
