//! JSON/HTTP inventory client.
//!
//! Talks to an inventory service exposing groups and replicas:
//!
//! ```text
//! GET    /api/groups/{group}                 group lookup
//! POST   /api/groups                         group creation
//! DELETE /api/groups/{group}                 group deletion
//! GET    /api/groups/{group}/replicas        replica listing
//! POST   /api/groups/{group}/replicas        clone from template (waits for the task)
//! GET    /api/replicas/{id}/power            power state
//! POST   /api/replicas/{id}/power/on|off     power operations
//! DELETE /api/replicas/{id}                  replica deletion
//! ```
//!
//! A 404 maps to [`InventoryError::NotFound`]. The backend does not type its
//! "object was already removed" answer, so [`is_already_absent`] recognizes
//! it from the status code and message text. That check lives only here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CloneRequest, GroupHandle, Inventory, InventoryError, PowerState, ReplicaHandle};

/// Message the backend returns when destroying an object that is gone.
const ALREADY_DELETED: &str = "has already been deleted or has not been completely created";

/// Connection settings for [`RestInventory`].
#[derive(Debug, Clone)]
pub struct RestInventoryConfig {
    /// Service root, e.g. `https://vcenter.example.com`.
    pub base_url: String,

    pub username: String,

    pub password: String,

    /// Skip TLS certificate validation.
    pub insecure: bool,

    /// Per-request timeout. Clone requests wait for the backend task, so
    /// this bounds a single clone as well.
    pub timeout: Duration,
}

/// Inventory service client.
pub struct RestInventory {
    client: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct CreateGroupBody<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloneBody<'a> {
    template: &'a str,
    name: &'a str,
    num_cpus: u32,
    memory_mb: u64,
    power_on: bool,
}

#[derive(Debug, Deserialize)]
struct GroupBody {
    name: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct ReplicaBody {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum WirePowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Deserialize)]
struct PowerBody {
    state: WirePowerState,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// True when a failed delete means the object no longer exists.
pub fn is_already_absent(status: StatusCode, message: &str) -> bool {
    status == StatusCode::GONE || message.contains(ALREADY_DELETED)
}

impl RestInventory {
    pub fn new(config: RestInventoryConfig) -> Result<Self, InventoryError> {
        if config.insecure {
            warn!("TLS certificate validation disabled for inventory connection");
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| InventoryError::Unavailable(format!("could not build HTTP client: {e}")))?;

        let base_url = Url::parse(&config.base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                InventoryError::Unavailable(format!("invalid inventory URL {:?}", config.base_url))
            })?;

        Ok(Self {
            client,
            base_url,
            username: config.username,
            password: config.password,
        })
    }

    /// API endpoint for `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Result<Url, InventoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                InventoryError::Unavailable(format!("invalid inventory URL {}", self.base_url))
            })?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> Result<Response, InventoryError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| InventoryError::Unavailable(format!("{operation}: {e}")))?;
        check(response, operation).await
    }

    async fn decode<T>(response: Response, operation: &str) -> Result<T, InventoryError>
    where
        T: serde::de::DeserializeOwned,
    {
        response
            .json::<T>()
            .await
            .map_err(|e| InventoryError::task_failed(operation, format!("invalid response: {e}")))
    }
}

/// Map a non-success response onto the inventory error taxonomy.
async fn check(response: Response, operation: &str) -> Result<Response, InventoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    debug!(operation, status = %status, message = %message, "Inventory request failed");

    if status == StatusCode::NOT_FOUND {
        return Err(InventoryError::NotFound(format!("{operation}: {message}")));
    }
    if is_already_absent(status, &message) {
        return Err(InventoryError::AlreadyAbsent(format!("{operation}: {message}")));
    }
    Err(InventoryError::task_failed(
        operation,
        format!("{status}: {message}"),
    ))
}

/// Deletes treat "not there" as done.
fn absorb_absent(result: Result<Response, InventoryError>) -> Result<(), InventoryError> {
    match result {
        Ok(_) => Ok(()),
        Err(InventoryError::NotFound(what)) | Err(InventoryError::AlreadyAbsent(what)) => {
            debug!(what = %what, "Object already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Inventory for RestInventory {
    async fn find_group(&self, group: &str) -> Result<GroupHandle, InventoryError> {
        let operation = format!("get group {group:?}");
        let request = self.client.get(self.url(&["groups", group])?);
        let response = self.send(request, &operation).await?;
        let body: GroupBody = Self::decode(response, &operation).await?;
        Ok(GroupHandle {
            name: body.name,
            path: body.path,
        })
    }

    async fn create_group(&self, group: &str) -> Result<GroupHandle, InventoryError> {
        let operation = format!("create group {group:?}");
        let request = self
            .client
            .post(self.url(&["groups"])?)
            .json(&CreateGroupBody { name: group });
        let response = self.send(request, &operation).await?;
        let body: GroupBody = Self::decode(response, &operation).await?;
        Ok(GroupHandle {
            name: body.name,
            path: body.path,
        })
    }

    async fn list_replicas(&self, group: &str) -> Result<Vec<ReplicaHandle>, InventoryError> {
        let operation = format!("list replicas of {group:?}");
        let request = self
            .client
            .get(self.url(&["groups", group, "replicas"])?);
        let response = self.send(request, &operation).await?;
        let body: Vec<ReplicaBody> = Self::decode(response, &operation).await?;
        Ok(body
            .into_iter()
            .map(|r| ReplicaHandle {
                id: r.id,
                name: r.name,
            })
            .collect())
    }

    async fn clone_replica(&self, request: &CloneRequest) -> Result<ReplicaHandle, InventoryError> {
        let operation = format!("clone {:?}", request.name);
        let http = self
            .client
            .post(self.url(&["groups", request.group.name.as_str(), "replicas"])?)
            .json(&CloneBody {
                template: &request.template,
                name: &request.name,
                num_cpus: request.cpu,
                memory_mb: request.memory_mb(),
                power_on: true,
            });
        let response = self.send(http, &operation).await?;
        let body: ReplicaBody = Self::decode(response, &operation).await?;
        Ok(ReplicaHandle {
            id: body.id,
            name: body.name,
        })
    }

    async fn power_state(&self, replica: &ReplicaHandle) -> Result<PowerState, InventoryError> {
        let operation = format!("get power state of {:?}", replica.name);
        let request = self
            .client
            .get(self.url(&["replicas", replica.id.as_str(), "power"])?);
        let response = self.send(request, &operation).await?;
        let body: PowerBody = Self::decode(response, &operation).await?;
        Ok(match body.state {
            WirePowerState::PoweredOn => PowerState::On,
            WirePowerState::PoweredOff | WirePowerState::Suspended => PowerState::Off,
        })
    }

    async fn power_on(&self, replica: &ReplicaHandle) -> Result<(), InventoryError> {
        let operation = format!("power on {:?}", replica.name);
        let request = self
            .client
            .post(self.url(&["replicas", replica.id.as_str(), "power", "on"])?);
        self.send(request, &operation).await.map(|_| ())
    }

    async fn power_off(&self, replica: &ReplicaHandle) -> Result<(), InventoryError> {
        let operation = format!("power off {:?}", replica.name);
        let request = self
            .client
            .post(self.url(&["replicas", replica.id.as_str(), "power", "off"])?);
        self.send(request, &operation).await.map(|_| ())
    }

    async fn delete_replica(&self, replica: &ReplicaHandle) -> Result<(), InventoryError> {
        let operation = format!("delete vm {:?}", replica.name);
        let request = self
            .client
            .delete(self.url(&["replicas", replica.id.as_str()])?);
        absorb_absent(self.send(request, &operation).await)
    }

    async fn delete_group(&self, group: &GroupHandle) -> Result<(), InventoryError> {
        let operation = format!("delete folder {:?}", group.path);
        let request = self
            .client
            .delete(self.url(&["groups", group.name.as_str()])?);
        absorb_absent(self.send(request, &operation).await)
    }
}
