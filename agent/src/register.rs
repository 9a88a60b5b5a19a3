//! Registration of this host with the manager

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config;
use crate::error::{AgentError, AgentResult, StatusCode};
use crate::token::TokenStore;

const REGISTER_PATH: &str = "/manage/host/add";

/// Registration payload as supplied on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RegisterInfo {
    pub web_username: String,
    pub web_password: String,
    pub host_name: String,
    pub host_group_name: String,
    pub management: bool,
    pub manager_ip: String,
    pub manager_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_port: Option<u16>,
}

impl RegisterInfo {
    pub fn from_json(data: &str) -> AgentResult<Self> {
        serde_json::from_str(data).map_err(|e| AgentError::ParamInvalid(e.to_string()))
    }

    pub fn from_file(path: &Path) -> AgentResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AgentError::ParamInvalid(format!("{}: {e}", path.display())))?;
        Self::from_json(&data)
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    web_username: &'a str,
    web_password: &'a str,
    host_name: &'a str,
    host_group_name: &'a str,
    management: bool,
    os_version: &'a str,
    agent_port: u16,
}

#[derive(Deserialize)]
struct RegisterResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    token: Option<String>,
}

pub struct ManagerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ManagerClient {
    pub fn new(manager_ip: &str, manager_port: u16) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .no_proxy()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: format!("http://{manager_ip}:{manager_port}"),
        }
    }

    /// Submit the registration and return the token the manager issued.
    pub async fn register(&self, info: &RegisterInfo, os_version: &str, agent_port: u16) -> Result<String> {
        let request = RegisterRequest {
            web_username: &info.web_username,
            web_password: &info.web_password,
            host_name: &info.host_name,
            host_group_name: &info.host_group_name,
            management: info.management,
            os_version,
            agent_port,
        };

        let response = self
            .client
            .post(format!("{}{REGISTER_PATH}", self.base_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach manager at {}", self.base_url))?;

        if !response.status().is_success() {
            bail!("Manager returned HTTP {}", response.status());
        }

        let body: RegisterResponse = response
            .json()
            .await
            .context("Manager response is not valid JSON")?;
        if body.code != i64::from(StatusCode::Success.code()) {
            bail!("Manager rejected registration: {} {}", body.code, body.msg);
        }
        match body.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => bail!("Manager response carries no token"),
        }
    }
}

/// Register with the manager and store the issued token.
///
/// When the payload names an agent port, the config file is rewritten
/// first so the token and the port stay consistent.
pub async fn register(info: &RegisterInfo, config_path: &Path, os_version: &str) -> StatusCode {
    match try_register(info, config_path, os_version).await {
        Ok(()) => {
            info!("Registered with manager {}:{}", info.manager_ip, info.manager_port);
            StatusCode::Success
        }
        Err(e) => {
            warn!("Registration failed: {e:#}");
            StatusCode::Fail
        }
    }
}

async fn try_register(info: &RegisterInfo, config_path: &Path, os_version: &str) -> Result<()> {
    if let Some(port) = info.agent_port {
        config::set_port(config_path, port)?;
    }
    let config = config::load_config(config_path)?;

    let client = ManagerClient::new(&info.manager_ip, info.manager_port);
    let token = client.register(info, os_version, config.agent.port).await?;

    TokenStore::load(&config.agent.token_file).store(&token)?;
    Ok(())
}
