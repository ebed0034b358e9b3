//! Transactional provisioning of site connections on the appliance
//!
//! The appliance has no multi-resource transaction, so each creation is
//! journaled: every resource that comes back `201 Created` is appended to a
//! rollback log, and the first failure unwinds the log in reverse with
//! compensating deletes. A connection ends up either fully provisioned
//! (log persisted under its id) or absent (no log).

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::appliance::{make_route_id, ApplianceApi, ApplianceResource};
use crate::dialect::{translate, validate_lifetime, PolicyKind};
use crate::error::{VpnError, VpnResult};

const HTTP_CREATED: u16 = 201;
const HTTP_NO_CONTENT: u16 = 204;
const HTTP_NOT_FOUND: u16 = 404;

/// One compensable unit: a resource that was successfully created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackStep {
    pub resource: ApplianceResource,
    pub resource_id: String,
    pub title: String,
}

/// Resource payloads for one connection, in creation order
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub conn_id: String,
    pub operations: Vec<(ApplianceResource, String, Value)>,
}

const SITE_CONN: &str = "IPSec Site Connection";

fn section<'a>(info: &'a Value, name: &str) -> VpnResult<&'a Map<String, Value>> {
    info.get(name)
        .and_then(Value::as_object)
        .ok_or_else(|| VpnError::implementation("Connection info", name))
}

fn required<'a>(obj: &'a Map<String, Value>, resource: &str, attr: &str) -> VpnResult<&'a Value> {
    obj.get(attr).ok_or_else(|| VpnError::implementation(resource, attr))
}

/// Identifier as the appliance sees it in URLs (`8`, `Tunnel0`)
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn create_psk_info(psk_id: &str, info: &Value) -> VpnResult<Value> {
    let conn = section(info, "site_conn")?;
    Ok(json!({
        "keyring-name": psk_id,
        "pre-shared-key-list": [{
            "key": required(conn, SITE_CONN, "psk")?,
            "encrypted": false,
            "peer-address": required(conn, SITE_CONN, "peer_address")?,
        }],
    }))
}

pub fn create_ike_policy_info(ike_policy_id: &Value, info: &Value) -> VpnResult<Value> {
    let kind = PolicyKind::IkePolicy;
    let policy = section(info, "ike_policy")?;
    Ok(json!({
        "priority-id": ike_policy_id,
        "version": translate(kind, "ike_version", policy)?,
        "encryption": translate(kind, "encryption_algorithm", policy)?,
        "hash": translate(kind, "auth_algorithm", policy)?,
        "dhGroup": translate(kind, "pfs", policy)?,
        "lifetime": validate_lifetime(kind, policy)?,
    }))
}

pub fn create_ipsec_policy_info(ipsec_policy_id: &Value, info: &Value) -> VpnResult<Value> {
    let kind = PolicyKind::IpsecPolicy;
    let policy = section(info, "ipsec_policy")?;
    let transform_protocol = translate(kind, "transform_protocol", policy)?;
    let auth_algorithm = translate(kind, "auth_algorithm", policy)?;
    let encryption = translate(kind, "encryption_algorithm", policy)?;
    Ok(json!({
        "policy-id": ipsec_policy_id,
        "protection-suite": {
            "esp-encryption": encryption,
            "esp-authentication": auth_algorithm,
            "ah": transform_protocol,
        },
        "lifetime-sec": validate_lifetime(kind, policy)?,
        "pfs": translate(kind, "pfs", policy)?,
        "anti-replay-window-size": "128",
    }))
}

pub fn create_site_connection_info(
    site_conn_id: &str,
    ipsec_policy_id: &Value,
    info: &Value,
    local_interface: &str,
) -> VpnResult<Value> {
    let appliance = section(info, "appliance")?;
    let public_ip = appliance
        .get("router_public_ip")
        .and_then(Value::as_str)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| VpnError::validation("Router", "router-gateway", "undefined"))?;

    let conn = section(info, "site_conn")?;
    Ok(json!({
        "vpn-interface-name": site_conn_id,
        "ipsec-policy-id": ipsec_policy_id,
        "local-device": {
            "ip-address": local_interface,
            "tunnel-ip-address": public_ip,
        },
        "remote-device": {
            "tunnel-ip-address": required(conn, SITE_CONN, "peer_address")?,
        },
        "mtu": required(conn, SITE_CONN, "mtu")?,
    }))
}

/// One `(route id, payload)` per peer CIDR
pub fn create_routes_info(site_conn_id: &str, info: &Value) -> VpnResult<Vec<(String, Value)>> {
    let conn = section(info, "site_conn")?;
    let peer_cidrs: Vec<&str> = conn
        .get("peer_cidrs")
        .and_then(Value::as_array)
        .map(|cidrs| cidrs.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if peer_cidrs.is_empty() {
        return Err(VpnError::validation(SITE_CONN, "peer-cidrs", "undefined"));
    }

    Ok(peer_cidrs
        .into_iter()
        .map(|cidr| {
            let route = json!({
                "destination-network": cidr,
                "outgoing-interface": site_conn_id,
            });
            (make_route_id(cidr, site_conn_id), route)
        })
        .collect())
}

/// Build every payload up front; any error means nothing may be created
pub fn build_plan(info: &Value, local_interface: &str) -> VpnResult<ProvisionPlan> {
    let conn = section(info, "site_conn")?;
    let conn_id = required(conn, SITE_CONN, "id")?
        .as_str()
        .ok_or_else(|| VpnError::implementation(SITE_CONN, "id"))?
        .to_string();

    let appliance = section(info, "appliance")?;
    let site_conn_id = id_string(required(appliance, "Appliance", "site_conn_id")?);
    let ike_policy_id = required(appliance, "Appliance", "ike_policy_id")?;
    let ipsec_policy_id = required(appliance, "Appliance", "ipsec_policy_id")?;

    let mut operations = vec![
        (ApplianceResource::PreSharedKey, conn_id.clone(), create_psk_info(&conn_id, info)?),
        (
            ApplianceResource::IkePolicy,
            id_string(ike_policy_id),
            create_ike_policy_info(ike_policy_id, info)?,
        ),
        (
            ApplianceResource::IpsecPolicy,
            id_string(ipsec_policy_id),
            create_ipsec_policy_info(ipsec_policy_id, info)?,
        ),
        (
            ApplianceResource::IpsecConnection,
            site_conn_id.clone(),
            create_site_connection_info(&site_conn_id, ipsec_policy_id, info, local_interface)?,
        ),
    ];
    for (route_id, route) in create_routes_info(&site_conn_id, info)? {
        operations.push((ApplianceResource::StaticRoute, route_id, route));
    }

    Ok(ProvisionPlan { conn_id, operations })
}

/// Drives the appliance through create/rollback/delete sequences
pub struct Provisioner {
    api: Arc<dyn ApplianceApi>,
    local_interface: String,
    connections: RwLock<HashMap<String, Vec<RollbackStep>>>,
}

impl Provisioner {
    pub fn new(api: Arc<dyn ApplianceApi>, local_interface: &str) -> Self {
        Self {
            api,
            local_interface: local_interface.to_string(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Provision every resource of a connection, or none of them
    pub async fn create_site_connection(&self, conn_info: &Value) -> VpnResult<()> {
        let plan = match build_plan(conn_info, &self.local_interface) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Rejected site connection request: {}", e);
                return Err(e);
            }
        };
        info!("Creating IPSec site-to-site connection {}", plan.conn_id);

        let mut steps: Vec<RollbackStep> = Vec::new();
        for (resource, resource_id, payload) in &plan.operations {
            match self.do_create_action(*resource, resource_id, payload).await {
                Ok(step) => steps.push(step),
                Err(e) => {
                    self.do_rollback(&steps).await;
                    info!("FAILED: Create of IPSec site-to-site connection {}", plan.conn_id);
                    return Err(e);
                }
            }
        }

        self.connections.write().await.insert(plan.conn_id.clone(), steps);
        info!("SUCCESS: Created IPSec site-to-site connection {}", plan.conn_id);
        Ok(())
    }

    /// Best-effort removal of everything provisioned for a connection
    pub async fn delete_site_connection(&self, conn_info: &Value) -> VpnResult<()> {
        let conn_id = section(conn_info, "site_conn")?
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| VpnError::implementation(SITE_CONN, "id"))?;
        info!("Deleting IPSec site-to-site connection {}", conn_id);

        let steps = self.connections.write().await.remove(conn_id);
        match steps {
            Some(steps) if !steps.is_empty() => {
                self.do_rollback(&steps).await;
                info!("COMPLETED: Deleted IPSec site-to-site connection {}", conn_id);
            }
            _ => warn!("Unable to find connection {}", conn_id),
        }
        Ok(())
    }

    /// Persisted rollback log for a connection
    pub async fn steps_for(&self, conn_id: &str) -> Option<Vec<RollbackStep>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    async fn do_create_action(
        &self,
        resource: ApplianceResource,
        resource_id: &str,
        payload: &Value,
    ) -> VpnResult<RollbackStep> {
        let failure = || VpnError::ResourceCreate {
            resource: resource.title().to_string(),
            which: resource_id.to_string(),
        };

        match self.api.create(resource, payload).await {
            Ok(HTTP_CREATED) => {
                debug!("{} {} is configured", resource, resource_id);
                Ok(RollbackStep {
                    resource,
                    resource_id: resource_id.to_string(),
                    title: resource.title().to_string(),
                })
            }
            Ok(status) => {
                error!("Unable to create {} {}: {}", resource, resource_id, status);
                Err(failure())
            }
            Err(e) => {
                error!("Unable to create {} {}: {}", resource, resource_id, e);
                Err(failure())
            }
        }
    }

    async fn do_rollback(&self, steps: &[RollbackStep]) {
        for step in steps.iter().rev() {
            match self.api.delete(step.resource, &step.resource_id).await {
                Ok(HTTP_NO_CONTENT) | Ok(HTTP_NOT_FOUND) => {
                    debug!("{} configuration {} is removed", step.title, step.resource_id)
                }
                Ok(status) => {
                    warn!("Unable to delete {} {}: {}", step.title, step.resource_id, status)
                }
                Err(e) => warn!("Unable to delete {} {}: {}", step.title, step.resource_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::MockApplianceApi;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn conn_info() -> Value {
        json!({
            "site_conn": {
                "id": "conn-1",
                "psk": "secret",
                "peer_address": "192.168.1.2",
                "peer_cidrs": ["10.1.0.0/24", "10.2.0.0/24"],
                "mtu": 1500
            },
            "ike_policy": {
                "ike_version": "v1",
                "encryption_algorithm": "AES-128",
                "auth_algorithm": "sha1",
                "pfs": "group5",
                "lifetime": {"units": "seconds", "value": 3600}
            },
            "ipsec_policy": {
                "transform_protocol": "esp",
                "encryption_algorithm": "3des",
                "auth_algorithm": "sha1",
                "pfs": "group14",
                "lifetime": {"units": "seconds", "value": 7200}
            },
            "appliance": {
                "site_conn_id": "Tunnel0",
                "ike_policy_id": 2,
                "ipsec_policy_id": 8,
                "router_public_ip": "172.24.4.23"
            }
        })
    }

    fn provisioner(mock: MockApplianceApi) -> Provisioner {
        Provisioner::new(Arc::new(mock), "GigabitEthernet3")
    }

    #[test]
    fn test_plan_order_and_payloads() {
        let plan = build_plan(&conn_info(), "GigabitEthernet3").unwrap();
        let order: Vec<_> = plan.operations.iter().map(|(r, id, _)| (*r, id.as_str())).collect();
        assert_eq!(
            order,
            vec![
                (ApplianceResource::PreSharedKey, "conn-1"),
                (ApplianceResource::IkePolicy, "2"),
                (ApplianceResource::IpsecPolicy, "8"),
                (ApplianceResource::IpsecConnection, "Tunnel0"),
                (ApplianceResource::StaticRoute, "10.1.0.0_24_Tunnel0"),
                (ApplianceResource::StaticRoute, "10.2.0.0_24_Tunnel0"),
            ]
        );

        assert_eq!(
            plan.operations[1].2,
            json!({"priority-id": 2, "version": "v1", "encryption": "aes", "hash": "sha",
                   "dhGroup": 5, "lifetime": 3600})
        );
        assert_eq!(plan.operations[2].2["protection-suite"]["ah"], "ah-sha-hmac");
        assert_eq!(plan.operations[2].2["pfs"], "group14");
        assert_eq!(plan.operations[3].2["local-device"]["tunnel-ip-address"], "172.24.4.23");
        assert_eq!(plan.operations[3].2["local-device"]["ip-address"], "GigabitEthernet3");
        assert_eq!(
            plan.operations[4].2,
            json!({"destination-network": "10.1.0.0/24", "outgoing-interface": "Tunnel0"})
        );
    }

    #[test]
    fn test_missing_public_ip_is_validation_failure() {
        let mut info = conn_info();
        info["appliance"]["router_public_ip"] = json!("");
        assert!(build_plan(&info, "Gi3").unwrap_err().is_validation());

        info["appliance"].as_object_mut().unwrap().remove("router_public_ip");
        assert!(build_plan(&info, "Gi3").unwrap_err().is_validation());
    }

    #[test]
    fn test_empty_peer_cidrs_is_validation_failure() {
        let mut info = conn_info();
        info["site_conn"]["peer_cidrs"] = json!([]);
        assert!(create_routes_info("Tunnel0", &info).unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_invalid_request_makes_no_calls() {
        // No expectations: any call panics
        let provisioner = provisioner(MockApplianceApi::new());

        let mut info = conn_info();
        info["ike_policy"]["encryption_algorithm"] = json!("des");
        assert!(provisioner.create_site_connection(&info).await.unwrap_err().is_validation());

        let mut info = conn_info();
        info["ipsec_policy"].as_object_mut().unwrap().remove("pfs");
        assert!(provisioner.create_site_connection(&info).await.unwrap_err().is_implementation());

        assert!(provisioner.steps_for("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn test_create_success_persists_steps() {
        let mut mock = MockApplianceApi::new();
        mock.expect_create().times(6).returning(|_, _| Ok(201));
        let provisioner = provisioner(mock);

        provisioner.create_site_connection(&conn_info()).await.unwrap();

        let steps = provisioner.steps_for("conn-1").await.unwrap();
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[0].title, "Pre-Shared Key");
        assert_eq!(steps[5].resource_id, "10.2.0.0_24_Tunnel0");
    }

    #[tokio::test]
    async fn test_mid_sequence_failure_rolls_back_in_reverse() {
        let mut mock = MockApplianceApi::new();
        let mut seq = Sequence::new();
        for resource in [
            ApplianceResource::PreSharedKey,
            ApplianceResource::IkePolicy,
            ApplianceResource::IpsecPolicy,
        ] {
            mock.expect_create()
                .with(eq(resource), mockall::predicate::always())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(201));
        }
        mock.expect_create()
            .with(eq(ApplianceResource::IpsecConnection), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(400));
        for (resource, id) in [
            (ApplianceResource::IpsecPolicy, "8"),
            (ApplianceResource::IkePolicy, "2"),
            (ApplianceResource::PreSharedKey, "conn-1"),
        ] {
            mock.expect_delete()
                .with(eq(resource), eq(id))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(204));
        }
        let provisioner = provisioner(mock);

        let err = provisioner.create_site_connection(&conn_info()).await.unwrap_err();
        assert!(matches!(err, VpnError::ResourceCreate { .. }));
        assert!(provisioner.steps_for("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_triggers_rollback() {
        let mut mock = MockApplianceApi::new();
        mock.expect_create()
            .with(eq(ApplianceResource::PreSharedKey), mockall::predicate::always())
            .returning(|_, _| Ok(201));
        mock.expect_create()
            .with(eq(ApplianceResource::IkePolicy), mockall::predicate::always())
            .returning(|_, _| Err(VpnError::ServiceError("timed out".to_string())));
        mock.expect_delete()
            .with(eq(ApplianceResource::PreSharedKey), eq("conn-1"))
            .times(1)
            .returning(|_, _| Ok(404));
        let provisioner = provisioner(mock);

        assert!(provisioner.create_site_connection(&conn_info()).await.is_err());
        assert!(provisioner.steps_for("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_best_effort() {
        let mut mock = MockApplianceApi::new();
        mock.expect_create().times(6).returning(|_, _| Ok(201));
        // Every delete is attempted even when some fail
        mock.expect_delete().times(6).returning(|resource, _| match resource {
            ApplianceResource::IkePolicy => Ok(500),
            ApplianceResource::StaticRoute => Err(VpnError::ServiceError("refused".to_string())),
            _ => Ok(204),
        });
        let provisioner = provisioner(mock);

        provisioner.create_site_connection(&conn_info()).await.unwrap();
        provisioner.delete_site_connection(&conn_info()).await.unwrap();
        assert!(provisioner.steps_for("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_connection_is_noop() {
        let provisioner = provisioner(MockApplianceApi::new());
        provisioner.delete_site_connection(&conn_info()).await.unwrap();
        // Twice is still harmless
        provisioner.delete_site_connection(&conn_info()).await.unwrap();
    }
}
