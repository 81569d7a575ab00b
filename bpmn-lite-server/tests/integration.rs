//! Integration tests driving the full HTTP surface against an in-memory
//! engine: compile -> start -> advance -> inspect, matching §8's named
//! scenarios (sequential, exclusive routing, user task, search).

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use bpmn_lite_core::config::Datasource;
use bpmn_lite_core::engine::Engine;
use bpmn_lite_core::SystemConfig;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const SEQUENTIAL_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="sequential" isExecutable="true">
    <bpmn:startEvent id="start"/>
    <bpmn:task id="greet" name="Greet"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="greet"/>
    <bpmn:sequenceFlow id="f2" sourceRef="greet" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

const EXCLUSIVE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="exclusive" isExecutable="true">
    <bpmn:startEvent id="start"/>
    <bpmn:exclusiveGateway id="gw" default="to_low"/>
    <bpmn:task id="high_path" name="High"/>
    <bpmn:task id="low_path" name="Low"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="gw"/>
    <bpmn:sequenceFlow id="to_high" sourceRef="gw" targetRef="high_path">
      <bpmn:conditionExpression>${amount} &gt; 100</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
    <bpmn:sequenceFlow id="to_low" sourceRef="gw" targetRef="low_path"/>
    <bpmn:sequenceFlow id="f3" sourceRef="high_path" targetRef="end"/>
    <bpmn:sequenceFlow id="f4" sourceRef="low_path" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

const USER_TASK_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="approval" isExecutable="true">
    <bpmn:startEvent id="start"/>
    <bpmn:userTask id="approve" name="Approve">
      <bpmn:extensionElements>
        <camunda:formData>
          <camunda:formField id="decision" type="string"/>
        </camunda:formData>
      </bpmn:extensionElements>
    </bpmn:userTask>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="approve"/>
    <bpmn:sequenceFlow id="f2" sourceRef="approve" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

const PARALLEL_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="parallel" isExecutable="true">
    <bpmn:startEvent id="start"/>
    <bpmn:parallelGateway id="fork"/>
    <bpmn:task id="a" name="A"/>
    <bpmn:task id="b" name="B"/>
    <bpmn:parallelGateway id="join"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="fork"/>
    <bpmn:sequenceFlow id="f2" sourceRef="fork" targetRef="a"/>
    <bpmn:sequenceFlow id="f3" sourceRef="fork" targetRef="b"/>
    <bpmn:sequenceFlow id="f4" sourceRef="a" targetRef="join"/>
    <bpmn:sequenceFlow id="f5" sourceRef="b" targetRef="join"/>
    <bpmn:sequenceFlow id="f6" sourceRef="join" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

const SERVICE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="service" isExecutable="true">
    <bpmn:startEvent id="start"/>
    <bpmn:serviceTask id="create_ticket" name="Create ticket">
      <bpmn:extensionElements>
        <camunda:connector>
          <camunda:connectorId>tickets</camunda:connectorId>
          <camunda:inputOutput>
            <camunda:inputParameter name="method">POST</camunda:inputParameter>
            <camunda:inputParameter name="url">/tickets</camunda:inputParameter>
          </camunda:inputOutput>
        </camunda:connector>
        <camunda:inputOutput>
          <camunda:outputParameter name="ticket_id"></camunda:outputParameter>
        </camunda:inputOutput>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="create_ticket"/>
    <bpmn:sequenceFlow id="f2" sourceRef="create_ticket" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

const CALL_PARENT_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="caller" isExecutable="true">
    <bpmn:startEvent id="start"/>
    <bpmn:callActivity id="call_child" name="Call child" calledElement="child_process">
      <bpmn:extensionElements>
        <camunda:in source="amount" target="child_amount"/>
        <camunda:inputOutput>
          <camunda:inputParameter name="child_amount"></camunda:inputParameter>
          <camunda:outputParameter name="outcome"></camunda:outputParameter>
        </camunda:inputOutput>
        <camunda:out source="child_amount" target="outcome"/>
      </bpmn:extensionElements>
    </bpmn:callActivity>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="call_child"/>
    <bpmn:sequenceFlow id="f2" sourceRef="call_child" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;

const CALL_CHILD_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="child_process" isExecutable="true">
    <bpmn:startEvent id="cstart"/>
    <bpmn:task id="cwork" name="Work"/>
    <bpmn:endEvent id="cend"/>
    <bpmn:sequenceFlow id="cf1" sourceRef="cstart" targetRef="cwork"/>
    <bpmn:sequenceFlow id="cf2" sourceRef="cwork" targetRef="cend"/>
  </bpmn:process>
</bpmn:definitions>"#;

async fn engine_with_models(models: &[(&str, &str)]) -> Arc<Engine> {
    engine_with_models_and_datasources(models, BTreeMap::new()).await
}

async fn engine_with_models_and_datasources(
    models: &[(&str, &str)],
    datasources: BTreeMap<String, Datasource>,
) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("bpmn-lite-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    for (name, xml) in models {
        std::fs::write(dir.join(format!("{name}.bpmn")), xml).unwrap();
    }
    let config = SystemConfig {
        port: 0,
        system_vars: json!({}),
        datasources,
        models_dir: dir.to_string_lossy().to_string(),
    };
    let engine = Arc::new(Engine::with_memory_store(config).unwrap());
    engine.load_models().await.unwrap();
    engine
}

/// Spins up a tiny in-process HTTP server answering `POST /tickets` with a
/// canned body, standing in for the external system a connector calls.
async fn spawn_ticket_server() -> String {
    let app = axum::Router::new().route(
        "/tickets",
        axum::routing::post(|| async { axum::Json(json!({ "ticket_id": "T-9" })) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

async fn wait_for_state(app: &axum::Router, instance_id: &str, expected: &str) -> Value {
    for _ in 0..20 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/instance/{instance_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let snapshot = body_json(response).await;
        if snapshot["state"] == expected {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("instance {instance_id} never reached state '{expected}'");
}

#[tokio::test]
async fn sequential_process_runs_to_completion() {
    let engine = engine_with_models(&[("sequential", SEQUENTIAL_BPMN)]).await;
    let app = bpmn_lite_server::http::router(engine);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/model/sequential/instance")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "variables": {} }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let instance_id = created["id"].as_str().unwrap().to_string();

    let snapshot = wait_for_state(&app, &instance_id, "finished").await;
    assert!(snapshot["pending"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn exclusive_gateway_takes_the_default_edge_when_condition_is_false() {
    let engine = engine_with_models(&[("exclusive", EXCLUSIVE_BPMN)]).await;
    let app = bpmn_lite_server::http::router(engine);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/model/exclusive/instance")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "variables": { "amount": 10 } }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(response).await;
    let instance_id = created["id"].as_str().unwrap().to_string();

    wait_for_state(&app, &instance_id, "finished").await;

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/instance/{instance_id}/task/low_path"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let task_info = body_json(response).await;
    // The low path was taken and already completed, so it is no longer pending.
    assert_eq!(task_info["pending"], json!(false));
}

#[tokio::test]
async fn user_task_blocks_until_form_submission() {
    let engine = engine_with_models(&[("approval", USER_TASK_BPMN)]).await;
    let app = bpmn_lite_server::http::router(engine);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/model/approval/instance")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "variables": {} }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(response).await;
    let instance_id = created["id"].as_str().unwrap().to_string();

    let snapshot = wait_for_state(&app, &instance_id, "waiting").await;
    assert_eq!(snapshot["pending"], json!(["approve"]));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/instance/{instance_id}/task/approve/form"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "decision": "approved" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let snapshot = wait_for_state(&app, &instance_id, "finished").await;
    assert_eq!(snapshot["variables"]["decision"], json!("approved"));
}

#[tokio::test]
async fn search_filters_by_variable_substring() {
    let engine = engine_with_models(&[("sequential", SEQUENTIAL_BPMN)]).await;
    let app = bpmn_lite_server::http::router(engine);

    for name in ["Ada", "Bob"] {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/model/sequential/instance")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "variables": { "name": name } }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/instance?q=name:Ada")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let results = body_json(response).await;
    let matches = results.as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["variables"]["name"], json!("Ada"));
}

#[tokio::test]
async fn unknown_model_returns_404() {
    let engine = engine_with_models(&[]).await;
    let app = bpmn_lite_server::http::router(engine);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/model/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn parallel_fork_and_join_synchronizes_both_branches() {
    let engine = engine_with_models(&[("parallel", PARALLEL_BPMN)]).await;
    let app = bpmn_lite_server::http::router(engine);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/model/parallel/instance")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "variables": {} }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(response).await;
    let instance_id = created["id"].as_str().unwrap().to_string();

    // Both "a" and "b" complete in the same sweep and each pushes a token
    // onto the join; it must only fire once both have arrived.
    let snapshot = wait_for_state(&app, &instance_id, "finished").await;
    assert!(snapshot["pending"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn service_task_binds_connector_response_to_output_variable() {
    let base_url = spawn_ticket_server().await;
    let mut datasources = BTreeMap::new();
    datasources.insert(
        "tickets".to_string(),
        Datasource {
            kind: "http".to_string(),
            url: base_url,
        },
    );
    let engine = engine_with_models_and_datasources(&[("service", SERVICE_BPMN)], datasources).await;
    let app = bpmn_lite_server::http::router(engine);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/model/service/instance")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "variables": {} }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(response).await;
    let instance_id = created["id"].as_str().unwrap().to_string();

    let snapshot = wait_for_state(&app, &instance_id, "finished").await;
    assert_eq!(snapshot["variables"]["ticket_id"], json!("T-9"));
}

#[tokio::test]
async fn call_activity_maps_variables_into_and_out_of_child_instance() {
    let engine = engine_with_models(&[
        ("caller", CALL_PARENT_BPMN),
        ("child", CALL_CHILD_BPMN),
    ])
    .await;
    let app = bpmn_lite_server::http::router(engine);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/model/caller/instance")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "variables": { "amount": 42 } }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(response).await;
    let instance_id = created["id"].as_str().unwrap().to_string();

    let snapshot = wait_for_state(&app, &instance_id, "finished").await;
    assert_eq!(snapshot["variables"]["outcome"], json!(42));
}
