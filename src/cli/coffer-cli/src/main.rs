//! Coffer CLI - Command line interface.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "coffer")]
#[command(about = "Coffer CLI - Manage secrets and dynamic secret leases")]
#[command(version)]
struct Cli {
    /// Coffer server address
    #[arg(long, default_value = "http://localhost:8080", env = "COFFER_ADDR")]
    addr: String,

    /// Access token (user JWT or identity access token)
    #[arg(long, env = "COFFER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server status
    Status,
    /// Exchange identity credentials for an access token
    Login {
        /// Universal auth client id
        #[arg(long, env = "COFFER_CLIENT_ID")]
        client_id: String,
        /// Universal auth client secret
        #[arg(long, env = "COFFER_CLIENT_SECRET", hide_env_values = true)]
        client_secret: String,
    },
    /// Secrets management
    Secrets {
        #[command(subcommand)]
        command: SecretsCommands,
    },
    /// Dynamic secret leases
    Leases {
        #[command(subcommand)]
        command: LeaseCommands,
    },
}

/// Where secrets live.
#[derive(Args, Clone)]
struct Scope {
    /// Project id
    #[arg(long, env = "COFFER_PROJECT_ID")]
    project: String,
    /// Environment slug
    #[arg(long, short, default_value = "dev")]
    env: String,
    /// Folder path
    #[arg(long, default_value = "/")]
    path: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Value,
    Dotenv,
}

#[derive(Subcommand)]
enum SecretsCommands {
    /// List secrets of a folder
    List {
        #[command(flatten)]
        scope: Scope,
        /// Include sub-folders
        #[arg(long)]
        recursive: bool,
        #[arg(long, value_enum, default_value = "dotenv")]
        format: OutputFormat,
    },
    /// Get a secret
    Get {
        name: String,
        #[command(flatten)]
        scope: Scope,
        #[arg(long, value_enum, default_value = "value")]
        format: OutputFormat,
    },
    /// Create a secret
    Create {
        name: String,
        value: String,
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Update a secret value
    Update {
        name: String,
        value: String,
        #[command(flatten)]
        scope: Scope,
    },
    /// Delete a secret
    Delete {
        name: String,
        #[command(flatten)]
        scope: Scope,
    },
}

#[derive(Subcommand)]
enum LeaseCommands {
    /// Create a lease and print the generated credentials
    Create {
        /// Dynamic secret name
        dynamic_secret: String,
        #[command(flatten)]
        scope: Scope,
        /// Lease TTL, e.g. 1h
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Extend a lease
    Renew {
        lease_id: String,
        #[arg(long, env = "COFFER_PROJECT_ID")]
        project: String,
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Revoke a lease
    Revoke {
        lease_id: String,
        #[arg(long, env = "COFFER_PROJECT_ID")]
        project: String,
        /// Drop the lease even if the provider fails to revoke it
        #[arg(long)]
        force: bool,
    },
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct StatusResponse {
    message: String,
    version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Secret {
    key: String,
    value: String,
    version: u32,
    secret_path: String,
}

#[derive(Debug, Deserialize)]
struct SecretResponse {
    secret: Secret,
}

#[derive(Debug, Deserialize)]
struct SecretsResponse {
    secrets: Vec<Secret>,
}

/// A write is either applied or held for approval.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum WriteOutcome {
    Secret(Secret),
    Approval(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Lease {
    id: String,
    expire_at: u64,
}

#[derive(Debug, Deserialize)]
struct LeaseResponse {
    lease: Lease,
    data: Option<Value>,
}

// ============================================================================
// HTTP Client
// ============================================================================

struct CofferClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl CofferClient {
    fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self
            .token
            .as_ref()
            .context("Authentication token required. Set COFFER_TOKEN or use --token")?;
        Ok(self.client.request(method, self.url(path)).bearer_auth(token))
    }

    async fn send<T: DeserializeOwned>(req: RequestBuilder, action: &str) -> Result<T> {
        let resp = req.send().await.context("Failed to connect to server")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error: ErrorResponse = resp.json().await.unwrap_or(ErrorResponse {
                message: format!("HTTP {}", status),
            });
            bail!("{} failed: {}", action, error.message);
        }

        resp.json().await.context("Failed to parse response")
    }

    async fn status(&self) -> Result<StatusResponse> {
        Self::send(self.client.get(self.url("/api/status")), "Status").await
    }

    async fn login(&self, client_id: &str, client_secret: &str) -> Result<LoginResponse> {
        let req = self
            .client
            .post(self.url("/api/v1/auth/universal-auth/login"))
            .json(&json!({ "clientId": client_id, "clientSecret": client_secret }));
        Self::send(req, "Login").await
    }

    async fn secrets_list(&self, scope: &Scope, recursive: bool) -> Result<SecretsResponse> {
        let req = self.request(Method::GET, "/api/v4/secrets")?.query(&[
            ("projectId", scope.project.as_str()),
            ("environment", scope.env.as_str()),
            ("secretPath", scope.path.as_str()),
            ("recursive", if recursive { "true" } else { "false" }),
        ]);
        Self::send(req, "List secrets").await
    }

    async fn secret_get(&self, name: &str, scope: &Scope) -> Result<SecretResponse> {
        let req = self
            .request(Method::GET, &format!("/api/v4/secrets/{}", name))?
            .query(&[
                ("projectId", scope.project.as_str()),
                ("environment", scope.env.as_str()),
                ("secretPath", scope.path.as_str()),
            ]);
        Self::send(req, "Get secret").await
    }

    async fn secret_write(&self, method: Method, name: &str, body: Value) -> Result<WriteOutcome> {
        let req = self
            .request(method, &format!("/api/v4/secrets/{}", name))?
            .json(&body);
        Self::send(req, "Write secret").await
    }

    async fn secret_delete(&self, name: &str, scope: &Scope) -> Result<WriteOutcome> {
        let req = self
            .request(Method::DELETE, &format!("/api/v4/secrets/{}", name))?
            .json(&scope_body(scope));
        Self::send(req, "Delete secret").await
    }

    async fn lease_create(
        &self,
        dynamic_secret: &str,
        scope: &Scope,
        ttl: Option<&str>,
    ) -> Result<LeaseResponse> {
        let req = self
            .request(Method::POST, "/api/v1/dynamic-secrets/leases")?
            .json(&json!({
                "projectId": scope.project,
                "environmentSlug": scope.env,
                "path": scope.path,
                "dynamicSecretName": dynamic_secret,
                "ttl": ttl,
            }));
        Self::send(req, "Create lease").await
    }

    async fn lease_renew(&self, lease_id: &str, project: &str, ttl: Option<&str>) -> Result<LeaseResponse> {
        let req = self
            .request(
                Method::POST,
                &format!("/api/v1/dynamic-secrets/leases/{}/renew", lease_id),
            )?
            .json(&json!({ "projectId": project, "ttl": ttl }));
        Self::send(req, "Renew lease").await
    }

    async fn lease_revoke(&self, lease_id: &str, project: &str, force: bool) -> Result<LeaseResponse> {
        let req = self
            .request(
                Method::DELETE,
                &format!("/api/v1/dynamic-secrets/leases/{}", lease_id),
            )?
            .json(&json!({ "projectId": project, "isForced": force }));
        Self::send(req, "Revoke lease").await
    }
}

fn scope_body(scope: &Scope) -> Value {
    json!({
        "projectId": scope.project,
        "environment": scope.env,
        "secretPath": scope.path,
    })
}

/// Quotes a value for a dotenv file when it needs it.
fn dotenv_value(value: &str) -> String {
    if value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '#' | '$' | '\\'))
    {
        format!(
            "\"{}\"",
            value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
        )
    } else {
        value.to_string()
    }
}

fn print_outcome(outcome: WriteOutcome, verb: &str) {
    match outcome {
        WriteOutcome::Secret(secret) => {
            println!("Secret '{}' {} (version {})", secret.key, verb, secret.version)
        },
        WriteOutcome::Approval(request) => println!(
            "Change held for approval (request {})",
            request["id"].as_str().unwrap_or("?")
        ),
    }
}

// ============================================================================
// Command Handlers
// ============================================================================

async fn cmd_status(client: &CofferClient) -> Result<()> {
    let status = client.status().await?;

    println!("Coffer server status:");
    println!("  Status:  {}", status.message);
    println!("  Version: {}", status.version);

    Ok(())
}

async fn cmd_login(client: &CofferClient, client_id: &str, client_secret: &str) -> Result<()> {
    let result = client.login(client_id, client_secret).await?;
    println!("{}", result.access_token);
    eprintln!("Token expires in {}s. Export it as COFFER_TOKEN.", result.expires_in);
    Ok(())
}

async fn cmd_secrets(client: &CofferClient, command: SecretsCommands) -> Result<()> {
    match command {
        SecretsCommands::List {
            scope,
            recursive,
            format,
        } => {
            let result = client.secrets_list(&scope, recursive).await?;
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, Value> = result
                        .secrets
                        .iter()
                        .map(|s| (s.key.clone(), Value::String(s.value.clone())))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                },
                OutputFormat::Dotenv => {
                    for secret in &result.secrets {
                        println!("{}={}", secret.key, dotenv_value(&secret.value));
                    }
                },
                OutputFormat::Value => {
                    for secret in &result.secrets {
                        println!("{}{}", secret.secret_path.trim_end_matches('/'), secret.key);
                    }
                },
            }
        },
        SecretsCommands::Get {
            name,
            scope,
            format,
        } => {
            let secret = client.secret_get(&name, &scope).await?.secret;
            match format {
                OutputFormat::Value => println!("{}", secret.value),
                OutputFormat::Dotenv => println!("{}={}", secret.key, dotenv_value(&secret.value)),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "key": secret.key,
                        "value": secret.value,
                        "version": secret.version,
                    }))?
                ),
            }
        },
        SecretsCommands::Create {
            name,
            value,
            scope,
            comment,
        } => {
            let mut body = scope_body(&scope);
            body["secretValue"] = json!(value);
            body["secretComment"] = json!(comment);
            let outcome = client.secret_write(Method::POST, &name, body).await?;
            print_outcome(outcome, "created");
        },
        SecretsCommands::Update { name, value, scope } => {
            let mut body = scope_body(&scope);
            body["secretValue"] = json!(value);
            let outcome = client.secret_write(Method::PATCH, &name, body).await?;
            print_outcome(outcome, "updated");
        },
        SecretsCommands::Delete { name, scope } => {
            let outcome = client.secret_delete(&name, &scope).await?;
            print_outcome(outcome, "deleted");
        },
    }
    Ok(())
}

async fn cmd_leases(client: &CofferClient, command: LeaseCommands) -> Result<()> {
    match command {
        LeaseCommands::Create {
            dynamic_secret,
            scope,
            ttl,
        } => {
            let result = client
                .lease_create(&dynamic_secret, &scope, ttl.as_deref())
                .await?;
            println!("Lease {} expires at {}", result.lease.id, result.lease.expire_at);
            if let Some(data) = result.data {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
        },
        LeaseCommands::Renew {
            lease_id,
            project,
            ttl,
        } => {
            let result = client.lease_renew(&lease_id, &project, ttl.as_deref()).await?;
            println!("Lease {} now expires at {}", result.lease.id, result.lease.expire_at);
        },
        LeaseCommands::Revoke {
            lease_id,
            project,
            force,
        } => {
            let result = client.lease_revoke(&lease_id, &project, force).await?;
            println!("Lease {} revoked", result.lease.id);
        },
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = CofferClient::new(&cli.addr, cli.token)?;

    match cli.command {
        Commands::Status => cmd_status(&client).await,
        Commands::Login {
            client_id,
            client_secret,
        } => cmd_login(&client, &client_id, &client_secret).await,
        Commands::Secrets { command } => cmd_secrets(&client, command).await,
        Commands::Leases { command } => cmd_leases(&client, command).await,
    }
}
