//! Proxmox VE control-plane client.
//!
//! Talks JSON over HTTPS to the `/api2/json` REST surface of a single node.
//!
//! # API Reference
//! `https://pve.proxmox.com/pve-docs/api-viewer/`

use std::net::Ipv4Addr;

use async_trait::async_trait;
use breakfix_core::{TaskId, Vmid};
use hyper::Method;
use serde_json::Value;

use crate::api_client::{ApiClient, AuthHeaders};
use crate::auth::{strategy_for, CredentialStrategy};
use crate::config::HypervisorConfig;
use crate::hypervisor::{CloneOutcome, Hypervisor, VmStatus};
use crate::task::{Clock, TaskStatus, TaskWaiter, TokioClock};
use crate::HypervisorError;

/// Proxmox VE implementation of [`Hypervisor`].
#[derive(Debug)]
pub struct ProxmoxClient<C: Clock = TokioClock> {
    api: ApiClient,
    credential: Box<dyn CredentialStrategy>,
    node: String,
    template: Vmid,
    waiter: TaskWaiter<C>,
}

impl ProxmoxClient<TokioClock> {
    /// Build a client from configuration. The credential strategy is chosen
    /// here, once.
    ///
    /// # Errors
    /// Returns [`HypervisorError::Authentication`] if no credentials are
    /// configured, or [`HypervisorError::Api`] if TLS setup fails.
    pub fn new(config: &HypervisorConfig) -> Result<Self, HypervisorError> {
        Self::with_clock(config, TokioClock)
    }
}

impl<C: Clock> ProxmoxClient<C> {
    /// Build a client whose task polling runs on `clock`.
    ///
    /// # Errors
    /// See [`ProxmoxClient::new`].
    pub fn with_clock(config: &HypervisorConfig, clock: C) -> Result<Self, HypervisorError> {
        let credential = strategy_for(config.credentials.as_ref())?;
        let api = ApiClient::new(&config.base_url, config.insecure_tls)?;
        tracing::info!(
            base_url = %api.base_url(),
            node = %config.node,
            template = %config.template,
            credential = ?credential,
            "hypervisor client ready"
        );
        Ok(Self {
            api,
            credential,
            node: config.node.clone(),
            template: config.template,
            waiter: TaskWaiter::new(clock, config.poll_interval, config.task_timeout),
        })
    }

    fn vm_path(&self, vmid: Vmid, suffix: &str) -> String {
        format!("/nodes/{}/qemu/{vmid}{suffix}", self.node)
    }

    fn task_path(&self, task: &TaskId) -> String {
        format!("/nodes/{}/tasks/{task}/status", self.node)
    }

    /// Credentials for one logical call.
    async fn auth(&self) -> Result<AuthHeaders, HypervisorError> {
        self.credential.resolve(&self.api).await
    }

    async fn task_request(
        &self,
        auth: &AuthHeaders,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<TaskId, HypervisorError> {
        let data = self.api.request(method, path, auth, body).await?;
        task_id_from(data, path)
    }

    async fn fetch_task_status(
        &self,
        auth: &AuthHeaders,
        task: &TaskId,
    ) -> Result<TaskStatus, HypervisorError> {
        let path = self.task_path(task);
        let data = self.api.request(Method::GET, &path, auth, None).await?;
        serde_json::from_value(data)
            .map_err(|e| HypervisorError::InvalidResponse(format!("{path}: {e}")))
    }

    async fn wait_with(&self, auth: &AuthHeaders, task: &TaskId) -> Result<(), HypervisorError> {
        self.waiter
            .wait_for_status(task, || self.fetch_task_status(auth, task))
            .await
    }

    async fn next_free_id_with(&self, auth: &AuthHeaders) -> Result<Vmid, HypervisorError> {
        let data = self
            .api
            .request(Method::GET, "/cluster/nextid", auth, None)
            .await?;
        parse_vmid(&data)
    }
}

#[async_trait]
impl<C: Clock> Hypervisor for ProxmoxClient<C> {
    async fn next_free_id(&self) -> Result<Vmid, HypervisorError> {
        let auth = self.auth().await?;
        self.next_free_id_with(&auth).await
    }

    async fn clone_from_template(
        &self,
        target: Option<Vmid>,
        name: &str,
    ) -> Result<CloneOutcome, HypervisorError> {
        let vmid = match target {
            Some(vmid) => vmid,
            None => self.next_free_id().await?,
        };

        let auth = self.auth().await?;
        let body = serde_json::json!({
            "newid": vmid.get(),
            "name": name,
            "full": 1,
        });
        let path = self.vm_path(self.template, "/clone");

        tracing::info!(template = %self.template, %vmid, name, "cloning template");
        let task = self
            .task_request(&auth, Method::POST, &path, Some(&body))
            .await?;
        Ok(CloneOutcome { vmid, task })
    }

    async fn create_snapshot(&self, vmid: Vmid, name: &str) -> Result<TaskId, HypervisorError> {
        let auth = self.auth().await?;
        let body = serde_json::json!({ "snapname": name });
        tracing::info!(%vmid, snapshot = name, "creating snapshot");
        self.task_request(&auth, Method::POST, &self.vm_path(vmid, "/snapshot"), Some(&body))
            .await
    }

    async fn rollback_to_snapshot(
        &self,
        vmid: Vmid,
        name: &str,
    ) -> Result<TaskId, HypervisorError> {
        let auth = self.auth().await?;
        let path = self.vm_path(vmid, &format!("/snapshot/{name}/rollback"));
        tracing::info!(%vmid, snapshot = name, "rolling back to snapshot");
        self.task_request(&auth, Method::POST, &path, None).await
    }

    async fn start(&self, vmid: Vmid) -> Result<TaskId, HypervisorError> {
        let auth = self.auth().await?;
        tracing::info!(%vmid, "starting VM");
        self.task_request(&auth, Method::POST, &self.vm_path(vmid, "/status/start"), None)
            .await
    }

    async fn stop(&self, vmid: Vmid) -> Result<TaskId, HypervisorError> {
        let auth = self.auth().await?;
        tracing::info!(%vmid, "stopping VM");
        self.task_request(&auth, Method::POST, &self.vm_path(vmid, "/status/stop"), None)
            .await
    }

    async fn destroy(&self, vmid: Vmid) -> Result<TaskId, HypervisorError> {
        let auth = self.auth().await?;

        match self
            .task_request(&auth, Method::POST, &self.vm_path(vmid, "/status/stop"), None)
            .await
        {
            Ok(task) => {
                if let Err(e) = self.wait_with(&auth, &task).await {
                    tracing::debug!(%vmid, error = %e, "stop before destroy did not finish cleanly");
                }
            }
            Err(e) => {
                tracing::debug!(%vmid, error = %e, "stop before destroy rejected; assuming already stopped");
            }
        }

        tracing::info!(%vmid, "destroying VM");
        self.task_request(&auth, Method::DELETE, &self.vm_path(vmid, ""), None)
            .await
    }

    async fn status(&self, vmid: Vmid) -> Result<VmStatus, HypervisorError> {
        let auth = self.auth().await?;
        let path = self.vm_path(vmid, "/status/current");
        let data = self.api.request(Method::GET, &path, &auth, None).await?;
        serde_json::from_value(data)
            .map_err(|e| HypervisorError::InvalidResponse(format!("{path}: {e}")))
    }

    async fn ip_address(&self, vmid: Vmid) -> Option<Ipv4Addr> {
        let auth = match self.auth().await {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(%vmid, error = %e, "cannot authenticate for guest IP lookup");
                return None;
            }
        };
        let path = self.vm_path(vmid, "/agent/network-get-interfaces");
        match self.api.request(Method::GET, &path, &auth, None).await {
            Ok(data) => {
                let ip = first_ipv4(&data);
                tracing::debug!(%vmid, ip = ?ip, "guest agent interfaces read");
                ip
            }
            Err(e) => {
                tracing::debug!(%vmid, error = %e, "guest agent unavailable");
                None
            }
        }
    }

    async fn wait_for_task(&self, task: &TaskId) -> Result<(), HypervisorError> {
        let auth = self.auth().await?;
        self.wait_with(&auth, task).await
    }
}

/// Extract a UPID from a mutating call's `data` member.
fn task_id_from(data: Value, path: &str) -> Result<TaskId, HypervisorError> {
    match data {
        Value::String(upid) if !upid.is_empty() => Ok(TaskId::new(upid)),
        other => Err(HypervisorError::InvalidResponse(format!(
            "{path}: expected task id, got {other}"
        ))),
    }
}

/// `/cluster/nextid` answers with a string on current releases and a number
/// on some older ones.
fn parse_vmid(data: &Value) -> Result<Vmid, HypervisorError> {
    let parsed = match data {
        Value::String(s) => s.parse::<u32>().ok(),
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    };
    parsed
        .map(Vmid::new)
        .ok_or_else(|| HypervisorError::InvalidResponse(format!("invalid next id: {data}")))
}

/// First routable IPv4 address (not loopback, unspecified or link-local) in a guest-agent
/// `network-get-interfaces` payload.
///
/// Accepts both the `{ "result": [...] }` wrapper and a bare interface list.
#[must_use]
pub fn first_ipv4(data: &Value) -> Option<Ipv4Addr> {
    let interfaces = data
        .get("result")
        .unwrap_or(data)
        .as_array()?;

    interfaces
        .iter()
        .filter(|iface| iface.get("name").and_then(Value::as_str) != Some("lo"))
        .filter_map(|iface| iface.get("ip-addresses").and_then(Value::as_array))
        .flatten()
        .filter(|addr| addr.get("ip-address-type").and_then(Value::as_str) == Some("ipv4"))
        .filter_map(|addr| addr.get("ip-address").and_then(Value::as_str))
        .filter_map(|raw| raw.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::Credentials;

    fn agent_payload() -> Value {
        json!({
            "result": [
                {
                    "name": "lo",
                    "ip-addresses": [
                        {"ip-address-type": "ipv4", "ip-address": "127.0.0.1", "prefix": 8},
                        {"ip-address-type": "ipv6", "ip-address": "::1", "prefix": 128}
                    ]
                },
                {
                    "name": "eth0",
                    "hardware-address": "bc:24:11:aa:bb:cc",
                    "ip-addresses": [
                        {"ip-address-type": "ipv6", "ip-address": "fe80::be24:11ff:feaa:bbcc", "prefix": 64},
                        {"ip-address-type": "ipv4", "ip-address": "10.20.0.105", "prefix": 24}
                    ]
                }
            ]
        })
    }

    #[test]
    fn first_ipv4_skips_loopback_and_ipv6() {
        assert_eq!(first_ipv4(&agent_payload()), Some(Ipv4Addr::new(10, 20, 0, 105)));
    }

    #[test]
    fn first_ipv4_accepts_bare_interface_list() {
        let bare = agent_payload()["result"].clone();
        assert_eq!(first_ipv4(&bare), Some(Ipv4Addr::new(10, 20, 0, 105)));
    }

    #[test]
    fn first_ipv4_returns_none_for_loopback_only() {
        let data = json!({"result": [{"name": "ens18", "ip-addresses": [
            {"ip-address-type": "ipv4", "ip-address": "127.0.1.1"}
        ]}]});
        assert_eq!(first_ipv4(&data), None);
    }

    #[test]
    fn first_ipv4_skips_link_local_before_dhcp_lease() {
        let data = json!({"result": [{"name": "eth0", "ip-addresses": [
            {"ip-address-type": "ipv4", "ip-address": "169.254.10.3"},
            {"ip-address-type": "ipv4", "ip-address": "0.0.0.0"}
        ]}]});
        assert_eq!(first_ipv4(&data), None);
    }

    #[test]
    fn first_ipv4_tolerates_garbage() {
        assert_eq!(first_ipv4(&Value::Null), None);
        assert_eq!(first_ipv4(&json!({"result": "QEMU guest agent is not running"})), None);
        assert_eq!(
            first_ipv4(&json!([{"name": "eth0", "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "not-an-ip"}]}])),
            None
        );
    }

    #[test]
    fn parse_vmid_accepts_string_and_number() {
        assert_eq!(parse_vmid(&json!("104")).ok(), Some(Vmid::new(104)));
        assert_eq!(parse_vmid(&json!(105)).ok(), Some(Vmid::new(105)));
        assert!(parse_vmid(&json!(-1)).is_err());
        assert!(parse_vmid(&json!(null)).is_err());
    }

    #[test]
    fn task_id_from_requires_non_empty_string() {
        let upid = "UPID:pve1:000A1B2C:0F00BAA1:65F0A1B2:qmstart:105:root@pam:";
        assert_eq!(task_id_from(json!(upid), "/x").ok(), Some(TaskId::new(upid)));
        assert!(task_id_from(json!(""), "/x").is_err());
        assert!(task_id_from(Value::Null, "/x").is_err());
    }

    #[tokio::test]
    async fn new_without_credentials_is_authentication_error() {
        let config = HypervisorConfig::new("https://pve.lab:8006", "pve1", Vmid::new(9000));
        let result = ProxmoxClient::new(&config);
        assert!(matches!(result, Err(HypervisorError::Authentication(_))));
    }

    #[tokio::test]
    async fn paths_are_scoped_to_the_configured_node() {
        let config = HypervisorConfig::new("https://pve.lab:8006", "pve1", Vmid::new(9000))
            .with_credentials(Credentials::ApiToken {
                token_id: "root@pam!breakfix".to_owned(),
                secret: "x".to_owned(),
            });
        let client = match ProxmoxClient::new(&config) {
            Ok(c) => c,
            Err(e) => panic!("client should build: {e}"),
        };
        assert_eq!(
            client.vm_path(Vmid::new(105), "/snapshot/clean-start/rollback"),
            "/nodes/pve1/qemu/105/snapshot/clean-start/rollback"
        );
        assert_eq!(
            client.task_path(&TaskId::new("UPID:pve1:1:2:3:qmclone:9000:root@pam:")),
            "/nodes/pve1/tasks/UPID:pve1:1:2:3:qmclone:9000:root@pam:/status"
        );
    }
}
