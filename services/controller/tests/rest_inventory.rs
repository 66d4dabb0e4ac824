//! REST inventory adapter against a mock inventory service.

use std::time::Duration;

use serde_json::json;
use vmop_controller::inventory::{
    CloneRequest, GroupHandle, Inventory, InventoryError, PowerState, ReplicaHandle,
    RestInventory, RestInventoryConfig,
};
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> RestInventory {
    RestInventory::new(RestInventoryConfig {
        base_url: server.uri(),
        username: "administrator@vsphere.local".to_string(),
        password: "secret".to_string(),
        insecure: false,
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn group() -> GroupHandle {
    GroupHandle {
        name: "default-web".to_string(),
        path: "/vcqaDC/vm/vm-operator/default-web".to_string(),
    }
}

fn replica() -> ReplicaHandle {
    ReplicaHandle {
        id: "vm-42".to_string(),
        name: "web-replica-abcdefgh".to_string(),
    }
}

#[tokio::test]
async fn test_find_group_with_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/groups/default-web"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "default-web",
            "path": "/vcqaDC/vm/vm-operator/default-web",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let found = client(&server).find_group("default-web").await.unwrap();
    assert_eq!(found, group());
}

#[tokio::test]
async fn test_missing_group_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/groups/default-web"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "message": "folder not found" })),
        )
        .mount(&server)
        .await;

    let err = client(&server).find_group("default-web").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn test_reserved_characters_stay_in_one_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/groups/team%2Fweb%20a/replicas"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let replicas = client(&server).list_replicas("team/web a").await.unwrap();
    assert!(replicas.is_empty());
}

#[tokio::test]
async fn test_list_preserves_backend_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/groups/default-web/replicas"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "vm-9", "name": "web-replica-zzzzzzzz" },
            { "id": "vm-3", "name": "web-replica-aaaaaaaa" },
        ])))
        .mount(&server)
        .await;

    let replicas = client(&server).list_replicas("default-web").await.unwrap();
    let names: Vec<&str> = replicas.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["web-replica-zzzzzzzz", "web-replica-aaaaaaaa"]);
}

#[tokio::test]
async fn test_clone_sends_sizing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/groups/default-web/replicas"))
        .and(body_partial_json(json!({
            "template": "ubuntu-22.04",
            "name": "web-replica-abcdefgh",
            "numCpus": 2,
            "memoryMb": 4096,
            "powerOn": true,
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "vm-42",
            "name": "web-replica-abcdefgh",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = client(&server)
        .clone_replica(&CloneRequest {
            template: "ubuntu-22.04".to_string(),
            name: "web-replica-abcdefgh".to_string(),
            group: group(),
            cpu: 2,
            memory_gb: 4,
        })
        .await
        .unwrap();
    assert_eq!(created, replica());
}

#[tokio::test]
async fn test_clone_of_missing_template_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/groups/default-web/replicas"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({ "message": "vm 'ubuntu-22.04' not found" })),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .clone_replica(&CloneRequest {
            template: "ubuntu-22.04".to_string(),
            name: "web-replica-abcdefgh".to_string(),
            group: group(),
            cpu: 1,
            memory_gb: 1,
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_power_state_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/replicas/vm-42/power"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": "poweredOff" })))
        .mount(&server)
        .await;

    let state = client(&server).power_state(&replica()).await.unwrap();
    assert_eq!(state, PowerState::Off);
}

#[tokio::test]
async fn test_delete_absorbs_already_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/replicas/vm-42"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "message": "The object 'vim.VirtualMachine:vm-42' has already been deleted or has not been completely created",
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/groups/default-web"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let inventory = client(&server);
    inventory.delete_replica(&replica()).await.unwrap();
    inventory.delete_group(&group()).await.unwrap();
}

#[tokio::test]
async fn test_backend_failure_carries_message() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/replicas/vm-42"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "message": "The operation is not allowed in the current state.",
        })))
        .mount(&server)
        .await;

    let err = client(&server).delete_replica(&replica()).await.unwrap_err();
    match err {
        InventoryError::TaskFailed { message, .. } => {
            assert!(message.contains("not allowed in the current state"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_backend_is_unavailable() {
    let inventory = RestInventory::new(RestInventoryConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        username: "user".to_string(),
        password: "pass".to_string(),
        insecure: true,
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let err = inventory.find_group("default-web").await.unwrap_err();
    assert!(matches!(err, InventoryError::Unavailable(_)), "{err}");
}
