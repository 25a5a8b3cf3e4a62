//! REST Gateway
//!
//! Client for the array's REST management gateway. Sessions are opened with
//! basic-auth login, which yields a token used as the password of every
//! later request; a rejected token triggers one re-login.
//!
//! Gateway failures are classified into [`ArrayErrorKind`] here and nowhere
//! else.

use crate::domain::ports::{
    ArrayGateway, CapacityStats, Host, HostMapping, NewVolume, ProvisioningType, SnapshotDef,
    SnapshotGroup, StoragePool, SystemInfo, Volume,
};
use crate::error::{ArrayErrorKind, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings for the array gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestGatewayConfig {
    /// Base URL, e.g. `https://gateway.example:443`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// System name or ID; empty selects the only system
    pub system_name: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    pub timeout_secs: u64,
}

impl Default for RestGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            system_name: String::new(),
            insecure: false,
            timeout_secs: 30,
        }
    }
}

impl RestGatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::Configuration("missing array endpoint".into()));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(Error::Configuration(format!(
                "array endpoint must be an http(s) URL: {}",
                self.endpoint
            )));
        }
        if self.username.is_empty() {
            return Err(Error::Configuration("missing array username".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Configuration("missing array password".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_code: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSystem {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMapping {
    sdc_id: String,
    #[serde(default)]
    sdc_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireVolume {
    id: String,
    #[serde(default)]
    name: Option<String>,
    size_in_kb: u64,
    storage_pool_id: String,
    #[serde(default)]
    ancestor_volume_id: Option<String>,
    #[serde(default)]
    consistency_group_id: Option<String>,
    #[serde(default)]
    mapped_sdc_info: Option<Vec<WireMapping>>,
    #[serde(default)]
    volume_type: Option<String>,
    /// Unix seconds
    #[serde(default)]
    creation_time: Option<i64>,
}

impl From<WireVolume> for Volume {
    fn from(w: WireVolume) -> Self {
        Volume {
            id: w.id,
            name: w.name.unwrap_or_default(),
            size_kb: w.size_in_kb,
            storage_pool_id: w.storage_pool_id,
            ancestor_volume_id: w.ancestor_volume_id.filter(|a| !a.is_empty()),
            consistency_group_id: w.consistency_group_id.filter(|c| !c.is_empty()),
            mappings: w
                .mapped_sdc_info
                .unwrap_or_default()
                .into_iter()
                .map(|m| HostMapping {
                    host_id: m.sdc_id,
                    host_ip: m.sdc_ip,
                })
                .collect(),
            provisioning: match w.volume_type.as_deref() {
                Some("ThickProvisioned") => ProvisioningType::Thick,
                _ => ProvisioningType::Thin,
            },
            creation_time: w
                .creation_time
                .filter(|t| *t > 0)
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePool {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    protection_domain_id: String,
}

impl From<WirePool> for StoragePool {
    fn from(w: WirePool) -> Self {
        StoragePool {
            id: w.id,
            name: w.name,
            protection_domain_id: w.protection_domain_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSdc {
    id: String,
    #[serde(default)]
    sdc_guid: String,
    #[serde(default)]
    sdc_ip: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStatistics {
    #[serde(default)]
    capacity_available_for_volume_allocation_in_kb: u64,
    #[serde(default)]
    max_capacity_in_kb: u64,
}

impl From<WireStatistics> for CapacityStats {
    fn from(w: WireStatistics) -> Self {
        CapacityStats {
            total_kb: w.max_capacity_in_kb,
            available_for_allocation_kb: w.capacity_available_for_volume_allocation_in_kb,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponse {
    volume_id_list: Vec<String>,
    #[serde(default)]
    snapshot_group_id: String,
}

// =============================================================================
// Error Classification
// =============================================================================

/// Classify a failed gateway response
///
/// Apart from the HTTP status, the gateway only signals these conditions in
/// its message text. The substrings below are unversioned signals from an
/// external system; a wording change on the array moves the error to
/// [`ArrayErrorKind::Other`], which callers treat as a hard failure.
pub(crate) fn classify(status: StatusCode, body: &str) -> Error {
    let parsed: ApiError = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        body.trim().to_string()
    } else {
        parsed.message
    };
    let lower = message.to_lowercase();

    let kind = if status == StatusCode::UNAUTHORIZED {
        ArrayErrorKind::Unauthorized
    } else if lower.contains("must be a hexadecimal number") {
        ArrayErrorKind::MalformedId
    } else if lower.contains("already in use") {
        ArrayErrorKind::NameInUse
    } else if lower.contains("removal in progress") || lower.contains("being removed") {
        ArrayErrorKind::RemovalInProgress
    } else if status == StatusCode::NOT_FOUND
        || lower.contains("could not find")
        || lower.contains("not found")
    {
        ArrayErrorKind::NotFound
    } else {
        ArrayErrorKind::Other
    };

    Error::array(
        kind,
        format!(
            "{} (HTTP {}, code {})",
            message,
            status.as_u16(),
            parsed.error_code
        ),
    )
}

fn parse_body<T: DeserializeOwned>(text: &str) -> Result<T> {
    let text = if text.trim().is_empty() { "null" } else { text };
    Ok(serde_json::from_str(text)?)
}

fn instance_path(kind: &str, id: &str) -> String {
    format!("/api/instances/{}::{}", kind, urlencoding::encode(id))
}

// =============================================================================
// REST Gateway
// =============================================================================

/// Array gateway backed by the REST management API
pub struct RestGateway {
    config: RestGatewayConfig,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    system_id: RwLock<Option<String>>,
}

impl RestGateway {
    pub fn new(config: RestGatewayConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        if config.insecure {
            warn!("TLS certificate verification disabled for {}", config.endpoint);
        }
        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
            system_id: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn login(&self) -> Result<String> {
        debug!("Logging in to array gateway {}", self.config.endpoint);
        let resp = self
            .http
            .get(self.url("/api/login"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify(status, &text));
        }

        let token: String = parse_body(&text)?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn session_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// Send one request, re-logging in once if the token was rejected
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String> {
        for attempt in 0..2 {
            let token = self.session_token().await?;
            let mut req = self
                .http
                .request(method.clone(), self.url(path))
                .basic_auth("", Some(token));
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req.send().await?;
            let status = resp.status();
            let text = resp.text().await?;

            if status.is_success() {
                return Ok(text);
            }
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!("Session token rejected, logging in again");
                *self.token.write().await = None;
                continue;
            }
            return Err(classify(status, &text));
        }
        Err(Error::array(
            ArrayErrorKind::Unauthorized,
            "session rejected after re-login",
        ))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let text = self.send(Method::GET, path, None).await?;
        parse_body(&text)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let text = self.send(Method::POST, path, Some(&body)).await?;
        parse_body(&text)
    }

    async fn system_id(&self) -> Result<String> {
        if let Some(id) = self.system_id.read().await.clone() {
            return Ok(id);
        }
        Ok(self.system().await?.id)
    }
}

#[async_trait]
impl ArrayGateway for RestGateway {
    async fn authenticate(&self) -> Result<()> {
        self.login().await.map(|_| ())
    }

    async fn system(&self) -> Result<SystemInfo> {
        let systems: Vec<WireSystem> = self.get("/api/types/System/instances").await?;
        let wanted = self.config.system_name.as_str();

        let found = if wanted.is_empty() && systems.len() == 1 {
            systems.into_iter().next()
        } else {
            systems
                .into_iter()
                .find(|s| s.id == wanted || s.name.as_deref() == Some(wanted))
        };
        let system = found.ok_or_else(|| {
            Error::array(
                ArrayErrorKind::NotFound,
                format!("Could not find the system {}", wanted),
            )
        })?;

        let info = SystemInfo {
            name: system.name.unwrap_or_else(|| system.id.clone()),
            id: system.id,
        };
        *self.system_id.write().await = Some(info.id.clone());
        info!("Array gateway bound to system {}", info.id);
        Ok(info)
    }

    async fn create_volume(&self, spec: &NewVolume) -> Result<String> {
        let resp: IdResponse = self
            .post(
                "/api/types/Volume/instances",
                json!({
                    "volumeSizeInKb": spec.size_kb.to_string(),
                    "storagePoolId": spec.storage_pool_id,
                    "name": spec.name,
                    "volumeType": spec.provisioning.to_string(),
                }),
            )
            .await?;
        Ok(resp.id)
    }

    async fn volume(&self, id: &str) -> Result<Volume> {
        let wire: WireVolume = self.get(&instance_path("Volume", id)).await?;
        Ok(wire.into())
    }

    async fn volume_id_by_name(&self, name: &str) -> Result<String> {
        self.post(
            "/api/types/Volume/instances/action/queryIdByKey",
            json!({ "name": name }),
        )
        .await
    }

    async fn volumes(&self) -> Result<Vec<Volume>> {
        let wire: Vec<WireVolume> = self.get("/api/types/Volume/instances").await?;
        Ok(wire.into_iter().map(Volume::from).collect())
    }

    async fn volumes_by_ancestor(&self, ancestor_id: &str) -> Result<Vec<Volume>> {
        let path = format!("{}/relationships/Volume", instance_path("Volume", ancestor_id));
        let wire: Vec<WireVolume> = self.get(&path).await?;
        Ok(wire
            .into_iter()
            .map(Volume::from)
            .filter(|v| v.ancestor_volume_id.as_deref() == Some(ancestor_id))
            .collect())
    }

    async fn remove_volume(&self, id: &str) -> Result<()> {
        let path = format!("{}/action/removeVolume", instance_path("Volume", id));
        let _: serde_json::Value = self.post(&path, json!({ "removeMode": "ONLY_ME" })).await?;
        Ok(())
    }

    async fn storage_pool_by_id(&self, id: &str) -> Result<StoragePool> {
        let wire: WirePool = self.get(&instance_path("StoragePool", id)).await?;
        Ok(wire.into())
    }

    async fn storage_pool_by_name(&self, name: &str) -> Result<StoragePool> {
        let pools: Vec<WirePool> = self.get("/api/types/StoragePool/instances").await?;
        pools
            .into_iter()
            .find(|p| p.name == name)
            .map(StoragePool::from)
            .ok_or_else(|| {
                Error::array(
                    ArrayErrorKind::NotFound,
                    format!("Could not find the storage pool named {}", name),
                )
            })
    }

    async fn host_by_guid(&self, guid: &str) -> Result<Host> {
        let sdcs: Vec<WireSdc> = self.get("/api/types/Sdc/instances").await?;
        sdcs.into_iter()
            .find(|s| s.sdc_guid.eq_ignore_ascii_case(guid))
            .map(|s| Host {
                id: s.id,
                guid: s.sdc_guid,
                ip: s.sdc_ip,
            })
            .ok_or_else(|| {
                Error::array(
                    ArrayErrorKind::NotFound,
                    format!("Could not find the SDC with guid {}", guid),
                )
            })
    }

    async fn map_volume(&self, volume_id: &str, host_id: &str, allow_multiple: bool) -> Result<()> {
        let path = format!("{}/action/addMappedSdc", instance_path("Volume", volume_id));
        let allow = if allow_multiple { "TRUE" } else { "FALSE" };
        let _: serde_json::Value = self
            .post(
                &path,
                json!({ "sdcId": host_id, "allowMultipleMappings": allow }),
            )
            .await?;
        Ok(())
    }

    async fn unmap_volume(&self, volume_id: &str, host_id: &str) -> Result<()> {
        let path = format!("{}/action/removeMappedSdc", instance_path("Volume", volume_id));
        let _: serde_json::Value = self.post(&path, json!({ "sdcId": host_id })).await?;
        Ok(())
    }

    async fn snapshot_volumes(&self, defs: &[SnapshotDef]) -> Result<SnapshotGroup> {
        let system_id = self.system_id().await?;
        let path = format!("{}/action/snapshotVolumes", instance_path("System", &system_id));
        let snapshot_defs: Vec<serde_json::Value> = defs
            .iter()
            .map(|d| {
                if d.snapshot_name.is_empty() {
                    json!({ "volumeId": d.volume_id })
                } else {
                    json!({ "volumeId": d.volume_id, "snapshotName": d.snapshot_name })
                }
            })
            .collect();

        let resp: SnapshotResponse = self
            .post(&path, json!({ "snapshotDefs": snapshot_defs }))
            .await?;
        Ok(SnapshotGroup {
            group_id: resp.snapshot_group_id,
            volume_ids: resp.volume_id_list,
        })
    }

    async fn pool_capacity(&self, pool_id: &str) -> Result<CapacityStats> {
        let path = format!("{}/relationships/Statistics", instance_path("StoragePool", pool_id));
        let stats: WireStatistics = self.get(&path).await?;
        Ok(stats.into())
    }

    async fn system_capacity(&self) -> Result<CapacityStats> {
        let system_id = self.system_id().await?;
        let path = format!("{}/relationships/Statistics", instance_path("System", &system_id));
        let stats: WireStatistics = self.get(&path).await?;
        Ok(stats.into())
    }
}
