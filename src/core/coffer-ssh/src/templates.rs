//! Certificate templates and principal matching.

use tracing::info;
use uuid::Uuid;

use coffer_projects::now;

use crate::{
    NewSshCertTemplate, SshCertTemplate, SshCertTemplateUpdate, SshEngine, SshError, SshStatus,
};

const MAX_PRINCIPAL_LEN: usize = 255;

pub(crate) fn parse_ttl(ttl: &str) -> Result<u64, SshError> {
    let secs = humantime::parse_duration(ttl.trim())
        .map_err(|e| SshError::Invalid(format!("invalid TTL '{}': {}", ttl, e)))?
        .as_secs();
    if secs == 0 {
        return Err(SshError::Invalid("TTL must be positive".into()));
    }
    Ok(secs)
}

pub(crate) fn validate_principals(kind: &str, principals: &[String]) -> Result<Vec<String>, SshError> {
    let mut out: Vec<String> = Vec::with_capacity(principals.len());
    for p in principals {
        let p = p.trim();
        if p.is_empty() || p.len() > MAX_PRINCIPAL_LEN || p.chars().any(char::is_whitespace) {
            return Err(SshError::Invalid(format!("invalid {} principal '{}'", kind, p)));
        }
        if !out.iter().any(|o| o == p) {
            out.push(p.to_string());
        }
    }
    Ok(out)
}

/// Whether `principal` is allowed by `patterns`.
///
/// `*` allows anything; `*.example.com` allows any name ending in
/// `.example.com`; other patterns must match exactly.
pub fn principal_allowed(patterns: &[String], principal: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        match pattern.strip_prefix("*.") {
            Some(domain) => principal
                .strip_suffix(domain)
                .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
            None => pattern == principal,
        }
    })
}

fn check_template(template: &SshCertTemplate) -> Result<(), SshError> {
    if template.ttl > template.max_ttl {
        return Err(SshError::Invalid("TTL cannot be larger than max TTL".into()));
    }
    if !template.allow_user_certificates && !template.allow_host_certificates {
        return Err(SshError::Invalid(
            "at least one of user or host certificates must be allowed".into(),
        ));
    }
    Ok(())
}

impl SshEngine {
    async fn template_name_taken(&self, project_id: &str, name: &str) -> Result<bool, SshError> {
        Ok(self
            .templates
            .find_one(|t| t.project_id == project_id && t.name == name)
            .await?
            .is_some())
    }

    /// Creates a template bound to a CA of the project.
    pub async fn create_template(
        &self,
        project_id: &str,
        new: NewSshCertTemplate,
    ) -> Result<SshCertTemplate, SshError> {
        self.get_ca(project_id, &new.ca_id).await?;

        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(SshError::Invalid("template name cannot be empty".into()));
        }
        if self.template_name_taken(project_id, &name).await? {
            return Err(SshError::AlreadyExists(format!("certificate template '{}'", name)));
        }

        let now = now();
        let template = SshCertTemplate {
            id: Uuid::new_v4().to_string(),
            ca_id: new.ca_id,
            project_id: project_id.to_string(),
            name,
            ttl: parse_ttl(&new.ttl)?,
            max_ttl: parse_ttl(&new.max_ttl)?,
            allowed_users: validate_principals("user", &new.allowed_users)?,
            allowed_hosts: validate_principals("host", &new.allowed_hosts)?,
            allow_user_certificates: new.allow_user_certificates,
            allow_host_certificates: new.allow_host_certificates,
            allow_custom_key_ids: new.allow_custom_key_ids,
            status: SshStatus::Active,
            created_at: now,
            updated_at: now,
        };
        check_template(&template)?;
        self.templates.insert(&template.id, &template).await?;

        info!(
            project_id = %project_id,
            template_id = %template.id,
            ca_id = %template.ca_id,
            "SSH certificate template created"
        );
        Ok(template)
    }

    /// Loads a template of `project_id`.
    pub async fn get_template(
        &self,
        project_id: &str,
        template_id: &str,
    ) -> Result<SshCertTemplate, SshError> {
        self.templates
            .get(template_id)
            .await?
            .filter(|t| t.project_id == project_id)
            .ok_or_else(|| SshError::NotFound(format!("certificate template '{}'", template_id)))
    }

    /// Lists the templates of a project, or of one CA.
    pub async fn list_templates(
        &self,
        project_id: &str,
        ca_id: Option<&str>,
    ) -> Result<Vec<SshCertTemplate>, SshError> {
        let mut templates = self
            .templates
            .find(|t| t.project_id == project_id && ca_id.map_or(true, |id| id == t.ca_id))
            .await?;
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    /// Applies a partial update and rechecks the template rules.
    pub async fn update_template(
        &self,
        project_id: &str,
        template_id: &str,
        update: SshCertTemplateUpdate,
    ) -> Result<SshCertTemplate, SshError> {
        let mut template = self.get_template(project_id, template_id).await?;

        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(SshError::Invalid("template name cannot be empty".into()));
            }
            if name != template.name && self.template_name_taken(project_id, &name).await? {
                return Err(SshError::AlreadyExists(format!("certificate template '{}'", name)));
            }
            template.name = name;
        }
        if let Some(ttl) = update.ttl {
            template.ttl = parse_ttl(&ttl)?;
        }
        if let Some(max_ttl) = update.max_ttl {
            template.max_ttl = parse_ttl(&max_ttl)?;
        }
        if let Some(users) = update.allowed_users {
            template.allowed_users = validate_principals("user", &users)?;
        }
        if let Some(hosts) = update.allowed_hosts {
            template.allowed_hosts = validate_principals("host", &hosts)?;
        }
        if let Some(allow) = update.allow_user_certificates {
            template.allow_user_certificates = allow;
        }
        if let Some(allow) = update.allow_host_certificates {
            template.allow_host_certificates = allow;
        }
        if let Some(allow) = update.allow_custom_key_ids {
            template.allow_custom_key_ids = allow;
        }
        if let Some(status) = update.status {
            template.status = status;
        }
        check_template(&template)?;

        template.updated_at = now();
        self.templates.put(&template.id, &template).await?;

        info!(template_id = %template.id, "SSH certificate template updated");
        Ok(template)
    }

    /// Deletes a template.
    pub async fn delete_template(
        &self,
        project_id: &str,
        template_id: &str,
    ) -> Result<SshCertTemplate, SshError> {
        let template = self.get_template(project_id, template_id).await?;
        self.templates.remove(&template.id).await?;
        info!(template_id = %template.id, "SSH certificate template deleted");
        Ok(template)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
pub(crate) mod tests {
    use super::*;
    use crate::tests::{engine, new_ca};

    pub(crate) fn new_template(ca_id: &str, name: &str) -> NewSshCertTemplate {
        NewSshCertTemplate {
            ca_id: ca_id.into(),
            name: name.into(),
            ttl: "1h".into(),
            max_ttl: "1d".into(),
            allowed_users: vec!["deploy".into(), "ops".into()],
            allowed_hosts: vec!["*.internal.example.com".into()],
            allow_user_certificates: true,
            allow_host_certificates: true,
            allow_custom_key_ids: false,
        }
    }

    #[test]
    fn test_principal_patterns() {
        let patterns = vec!["*.example.com".to_string(), "bastion".to_string()];
        assert!(principal_allowed(&patterns, "web.example.com"));
        assert!(principal_allowed(&patterns, "a.b.example.com"));
        assert!(!principal_allowed(&patterns, "example.com"));
        assert!(!principal_allowed(&patterns, "evilexample.com"));
        assert!(principal_allowed(&patterns, "bastion"));
        assert!(!principal_allowed(&patterns, "bastion2"));
        assert!(principal_allowed(&["*".to_string()], "anything"));
    }

    #[tokio::test]
    async fn test_template_validation() {
        let engine = engine();
        let ca = engine.create_ca("p1", new_ca("ca")).await.unwrap();

        let mut ttl = new_template(&ca.id, "t");
        ttl.ttl = "2d".into();
        assert!(matches!(
            engine.create_template("p1", ttl).await,
            Err(SshError::Invalid(_))
        ));

        let mut none_allowed = new_template(&ca.id, "t");
        none_allowed.allow_user_certificates = false;
        none_allowed.allow_host_certificates = false;
        assert!(engine.create_template("p1", none_allowed).await.is_err());

        // CA from another project
        assert!(matches!(
            engine.create_template("p2", new_template(&ca.id, "t")).await,
            Err(SshError::NotFound(_))
        ));

        engine
            .create_template("p1", new_template(&ca.id, "t"))
            .await
            .unwrap();
        assert!(matches!(
            engine.create_template("p1", new_template(&ca.id, "t")).await,
            Err(SshError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_template_update_and_delete() {
        let engine = engine();
        let ca = engine.create_ca("p1", new_ca("ca")).await.unwrap();
        let template = engine
            .create_template("p1", new_template(&ca.id, "t"))
            .await
            .unwrap();

        assert!(engine
            .update_template(
                "p1",
                &template.id,
                SshCertTemplateUpdate {
                    max_ttl: Some("30m".into()),
                    ..Default::default()
                },
            )
            .await
            .is_err());

        let updated = engine
            .update_template(
                "p1",
                &template.id,
                SshCertTemplateUpdate {
                    allowed_users: Some(vec!["*".into()]),
                    allow_custom_key_ids: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.allowed_users, vec!["*"]);
        assert!(updated.allow_custom_key_ids);

        assert_eq!(
            engine.list_templates("p1", Some(&ca.id)).await.unwrap().len(),
            1
        );
        engine.delete_template("p1", &template.id).await.unwrap();
        assert!(engine.list_templates("p1", None).await.unwrap().is_empty());
    }
}
