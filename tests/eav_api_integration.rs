use eav_db_rust::registry::{EavRegistry, EntityDescriptor, FieldDescriptor, RegisterOptions};
use eav_db_rust::{build_router, EavService, MemoryStore};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

// Test client wrapper for making API calls
struct TestClient {
    client: Client,
    base_url: String,
}

impl TestClient {
    fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn post(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(&format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }

    async fn put(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .put(&format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }

    async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .get(&format!("{}{}", self.base_url, path))
            .send()
            .await
    }

    async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .delete(&format!("{}{}", self.base_url, path))
            .send()
            .await
    }

    async fn patch(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .patch(&format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }
}

/// Serve the router on an ephemeral port backed by a fresh in-memory store.
async fn spawn_server() -> TestClient {
    let mut builder = EavRegistry::builder();
    builder
        .enable(
            EntityDescriptor::new("example_model").with_field(FieldDescriptor::required("name")),
            RegisterOptions::default(),
        )
        .unwrap()
        .enable(
            EntityDescriptor::new("patient"),
            RegisterOptions {
                accessor: "attributes".to_string(),
                content_type: Some("clinic.patient".to_string()),
            },
        )
        .unwrap();
    let service = EavService::new(Arc::new(MemoryStore::new()), Arc::new(builder.build()), 3);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(service)).await.unwrap();
    });

    TestClient::new(format!("http://{}", address))
}

#[tokio::test]
async fn test_entity_fact_lifecycle() {
    let client = spawn_server().await;

    let response = client
        .post(
            "/entities/example_model",
            json!({"name": "E1", "eav": [{"attribute": "color", "value": "red"}]}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Value = response.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();

    let read: Value = client
        .get(&format!("/entities/example_model/{}", id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read, json!({"id": id, "name": "E1", "eav": {"color": "red"}}));

    let response = client
        .patch(
            &format!("/entities/example_model/{}", id),
            json!({"eav": [{"attribute": "color", "value": "blue"}]}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated: Value = response.json().await.unwrap();
    assert_eq!(updated["eav"], json!({"color": "blue"}));

    // The color attribute was created on first use, as an enum with its own group.
    let attributes: Value = client.get("/attribute").await.unwrap().json().await.unwrap();
    assert_eq!(attributes["total"], json!(1));
    assert_eq!(attributes["items"][0]["slug"], json!("color"));
    assert_eq!(attributes["items"][0]["datatype"], json!("enum"));
    assert_eq!(attributes["items"][0]["choices"], json!(["red", "blue"]));

    let response = client
        .delete(&format!("/entities/example_model/{}", id))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = client
        .get(&format!("/entities/example_model/{}", id))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_typed_attributes_and_validation() {
    let client = spawn_server().await;

    let response = client
        .post("/attribute", json!({"name": "Age", "datatype": "int"}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let age: Value = response.json().await.unwrap();
    assert_eq!(age["slug"], json!("age"));

    let response = client
        .post("/attribute", json!({"name": "Age", "datatype": "int"}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .post("/attribute", json!({"name": "Age", "datatype": "text"}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = client
        .post(
            "/entities/example_model",
            json!({"name": "E1", "eav": [
                {"attribute": "color", "value": "red"},
                {"attribute": "age", "value": "forty"}
            ]}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["details"][0]["field"], json!("eav[1]"));

    // Nothing from the failed batch was kept.
    let listed: Value = client
        .get("/entities/example_model")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["total"], json!(0));
    let attributes: Value = client.get("/attribute").await.unwrap().json().await.unwrap();
    assert_eq!(attributes["total"], json!(1));

    let response = client
        .post(
            "/entities/example_model",
            json!({"eav": [{"attribute": "age", "value": 40}]}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["details"][0]["field"], json!("name"));

    let response = client
        .put(
            "/entities/example_model/999",
            json!({"name": "ghost", "eav": []}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_custom_accessor_and_orphaned_facts() {
    let client = spawn_server().await;

    let response = client
        .post(
            "/entities/patient",
            json!({"ward": "B", "attributes": [
                {"attribute": "blood_type", "value": "A"},
                {"attribute": "allergy", "value": "pollen"}
            ]}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let patient: Value = response.json().await.unwrap();
    let id = patient["id"].as_i64().unwrap();
    assert_eq!(
        patient["attributes"],
        json!({"allergy": "pollen", "blood_type": "A"})
    );

    let values: Value = client.get("/enum_value").await.unwrap().json().await.unwrap();
    let pollen = values["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["value"] == json!("pollen"))
        .unwrap()["id"]
        .as_i64()
        .unwrap();
    let response = client
        .delete(&format!("/enum_value/{}", pollen))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let read: Value = client
        .get(&format!("/entities/patient/{}", id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["attributes"], json!({"blood_type": "A"}));

    // The allergy attribute still has a (now empty) value row, so it stays.
    let attributes: Value = client.get("/attribute").await.unwrap().json().await.unwrap();
    let allergy = attributes["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["slug"] == json!("allergy"))
        .unwrap()["id"]
        .as_i64()
        .unwrap();
    let response = client
        .delete(&format!("/attribute/{}", allergy))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_enum_group_endpoints() {
    let client = spawn_server().await;

    let response = client
        .post(
            "/enum_group",
            json!({"name": "sizes", "values": [{"value": "s"}, {"value": "m"}]}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let group: Value = response.json().await.unwrap();
    let id = group["id"].as_i64().unwrap();

    let response = client
        .patch(
            &format!("/enum_group/{}", id),
            json!({"values": [{"value": "l"}, {"value": "s"}]}),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let group: Value = response.json().await.unwrap();
    let literals: Vec<&str> = group["values"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["value"].as_str().unwrap())
        .collect();
    assert_eq!(literals, vec!["s", "m", "l"]);

    let response = client
        .delete(&format!("/enum_group/{}", id))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = client
        .get(&format!("/enum_group/{}", id))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
