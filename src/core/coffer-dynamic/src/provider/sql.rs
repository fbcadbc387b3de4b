//! `sql-database` provider: database users created by SQL statements.
//!
//! Statements may use `{{username}}`, `{{password}}` and `{{expiration}}`
//! (RFC 3339, UTC). Several statements can be separated by `;`.

use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tracing::debug;

use coffer_crypto::random;

use super::{parse_inputs, DynamicProvider, IssuedCredentials, LeaseRequest};
use crate::DynamicError;

const DEFAULT_PASSWORD_LENGTH: usize = 48;

/// Database flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlClient {
    /// PostgreSQL.
    Postgres,
    /// SQLite file; `database` is the file path.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqlInputs {
    client: SqlClient,
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: u16,
    database: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    creation_statement: String,
    revocation_statement: String,
    #[serde(default)]
    renew_statement: Option<String>,
    #[serde(default)]
    password_length: Option<usize>,
}

impl SqlInputs {
    fn connection_url(&self) -> String {
        match self.client {
            SqlClient::Postgres => format!(
                "postgres://{}:{}@{}:{}/{}",
                encode_userinfo(&self.username),
                encode_userinfo(&self.password),
                self.host,
                self.port,
                self.database
            ),
            SqlClient::Sqlite => format!("sqlite://{}?mode=rwc", self.database),
        }
    }
}

fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn render(statement: &str, username: &str, password: &str, expire_at: u64) -> String {
    let expiration =
        humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(expire_at)).to_string();
    statement
        .replace("{{username}}", username)
        .replace("{{password}}", password)
        .replace("{{expiration}}", &expiration)
}

/// Creates database users with configurable SQL.
#[derive(Debug)]
pub struct SqlDatabaseProvider;

impl Default for SqlDatabaseProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlDatabaseProvider {
    /// Creates the provider.
    pub fn new() -> Self {
        sqlx::any::install_default_drivers();
        Self
    }

    async fn connect(&self, inputs: &SqlInputs) -> Result<AnyPool, DynamicError> {
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&inputs.connection_url())
            .await?;
        Ok(pool)
    }

    async fn run(&self, inputs: &SqlInputs, sql: &str) -> Result<(), DynamicError> {
        let pool = self.connect(inputs).await?;
        let result = sqlx::raw_sql(sql).execute(&pool).await;
        pool.close().await;
        result?;
        Ok(())
    }
}

#[async_trait]
impl DynamicProvider for SqlDatabaseProvider {
    fn validate_inputs(&self, inputs: Value) -> Result<Value, DynamicError> {
        let mut parsed: SqlInputs = parse_inputs(&inputs)?;
        parsed.host = parsed.host.trim().to_lowercase();
        parsed.database = parsed.database.trim().to_string();
        parsed.creation_statement = parsed.creation_statement.trim().to_string();
        parsed.revocation_statement = parsed.revocation_statement.trim().to_string();

        if parsed.database.is_empty() {
            return Err(DynamicError::Invalid("database is required".into()));
        }
        if parsed.client == SqlClient::Postgres
            && (parsed.host.is_empty() || parsed.port == 0 || parsed.username.is_empty())
        {
            return Err(DynamicError::Invalid(
                "host, port and username are required".into(),
            ));
        }
        if !parsed.creation_statement.contains("{{username}}") {
            return Err(DynamicError::Invalid(
                "creation statement must use {{username}}".into(),
            ));
        }
        if parsed.revocation_statement.is_empty() {
            return Err(DynamicError::Invalid("revocation statement is required".into()));
        }
        if let Some(len) = parsed.password_length {
            if !(8..=250).contains(&len) {
                return Err(DynamicError::Invalid(
                    "password length must be between 8 and 250".into(),
                ));
            }
        }

        serde_json::to_value(parsed).map_err(|e| DynamicError::Invalid(e.to_string()))
    }

    async fn validate_connection(&self, inputs: &Value) -> Result<(), DynamicError> {
        let inputs: SqlInputs = parse_inputs(inputs)?;
        self.run(&inputs, "SELECT 1").await
    }

    async fn create(
        &self,
        inputs: &Value,
        request: &LeaseRequest,
    ) -> Result<IssuedCredentials, DynamicError> {
        let inputs: SqlInputs = parse_inputs(inputs)?;
        let password =
            random::generate_password(inputs.password_length.unwrap_or(DEFAULT_PASSWORD_LENGTH));

        let sql = render(
            &inputs.creation_statement,
            &request.username,
            &password,
            request.expire_at,
        );
        self.run(&inputs, &sql).await?;

        debug!(username = %request.username, "Database user created");
        Ok(IssuedCredentials {
            entity_id: request.username.clone(),
            data: json!({
                "DB_USERNAME": request.username,
                "DB_PASSWORD": password,
            }),
        })
    }

    async fn renew(
        &self,
        inputs: &Value,
        entity_id: &str,
        expire_at: u64,
    ) -> Result<String, DynamicError> {
        let inputs: SqlInputs = parse_inputs(inputs)?;
        if let Some(statement) = inputs.renew_statement.as_deref().filter(|s| !s.trim().is_empty())
        {
            let sql = render(statement, entity_id, "", expire_at);
            self.run(&inputs, &sql).await?;
        }
        Ok(entity_id.to_string())
    }

    async fn revoke(&self, inputs: &Value, entity_id: &str) -> Result<String, DynamicError> {
        let inputs: SqlInputs = parse_inputs(inputs)?;
        let sql = render(&inputs.revocation_statement, entity_id, "", 0);
        self.run(&inputs, &sql).await?;

        debug!(username = %entity_id, "Database user revoked");
        Ok(entity_id.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn sqlite_inputs(path: &std::path::Path) -> Value {
        json!({
            "client": "sqlite",
            "database": path.to_string_lossy(),
            "creationStatement": "INSERT INTO accounts (name, pass, expires) VALUES ('{{username}}', '{{password}}', '{{expiration}}')",
            "revocationStatement": "DELETE FROM accounts WHERE name = '{{username}}'",
            "renewStatement": "UPDATE accounts SET expires = '{{expiration}}' WHERE name = '{{username}}'",
            "passwordLength": 16
        })
    }

    async fn count(provider: &SqlDatabaseProvider, inputs: &Value) -> i64 {
        let inputs: SqlInputs = parse_inputs(inputs).unwrap();
        let pool = provider.connect(&inputs).await.unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&pool)
            .await
            .unwrap();
        pool.close().await;
        n
    }

    #[test]
    fn test_render_placeholders() {
        let sql = render("CREATE USER {{username}} PASSWORD '{{password}}' VALID UNTIL '{{expiration}}'", "u1", "p1", 0);
        assert_eq!(
            sql,
            "CREATE USER u1 PASSWORD 'p1' VALID UNTIL '1970-01-01T00:00:00Z'"
        );
    }

    #[test]
    fn test_validate_inputs() {
        let provider = SqlDatabaseProvider::new();
        let missing_host = json!({
            "client": "postgres",
            "database": "app",
            "creationStatement": "CREATE ROLE {{username}}",
            "revocationStatement": "DROP ROLE {{username}}"
        });
        assert!(provider.validate_inputs(missing_host).is_err());

        let no_username = json!({
            "client": "sqlite",
            "database": "/tmp/x.db",
            "creationStatement": "SELECT 1",
            "revocationStatement": "SELECT 1"
        });
        assert!(provider.validate_inputs(no_username).is_err());

        let ok = json!({
            "client": "postgres",
            "host": " DB.internal ",
            "port": 5432,
            "database": "app",
            "username": "root",
            "password": "p@ss",
            "creationStatement": "CREATE ROLE {{username}}",
            "revocationStatement": "DROP ROLE {{username}}"
        });
        let normalized = provider.validate_inputs(ok).unwrap();
        assert_eq!(normalized["host"], "db.internal");
    }

    #[test]
    fn test_postgres_url_escapes_credentials() {
        let inputs: SqlInputs = parse_inputs(&json!({
            "client": "postgres",
            "host": "db",
            "port": 5432,
            "database": "app",
            "username": "root",
            "password": "p@ss/word",
            "creationStatement": "x",
            "revocationStatement": "y"
        }))
        .unwrap();
        assert_eq!(
            inputs.connection_url(),
            "postgres://root:p%40ss%2Fword@db:5432/app"
        );
    }

    #[tokio::test]
    async fn test_sqlite_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = sqlite_inputs(&dir.path().join("target.db"));
        let provider = SqlDatabaseProvider::new();
        let inputs = provider.validate_inputs(inputs).unwrap();

        let parsed: SqlInputs = parse_inputs(&inputs).unwrap();
        provider
            .run(
                &parsed,
                "CREATE TABLE accounts (name TEXT PRIMARY KEY, pass TEXT, expires TEXT)",
            )
            .await
            .unwrap();
        provider.validate_connection(&inputs).await.unwrap();

        let issued = provider
            .create(
                &inputs,
                &LeaseRequest {
                    username: "coffer_abc".into(),
                    expire_at: 4_000_000_000,
                },
            )
            .await
            .unwrap();
        assert_eq!(issued.entity_id, "coffer_abc");
        assert_eq!(issued.data["DB_PASSWORD"].as_str().unwrap().len(), 16);
        assert_eq!(count(&provider, &inputs).await, 1);

        provider
            .renew(&inputs, &issued.entity_id, 4_100_000_000)
            .await
            .unwrap();
        provider.revoke(&inputs, &issued.entity_id).await.unwrap();
        assert_eq!(count(&provider, &inputs).await, 0);
    }
}
