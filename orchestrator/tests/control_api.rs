//! Control API tests over a real listener

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use dockhand::server::serve::router;
use dockhand::server::state::ServerState;

use common::{Harness, ScriptedShell, COMMIT};

struct Api {
    base: String,
    client: reqwest::Client,
    _shutdown: broadcast::Sender<()>,
}

impl Api {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client.post(self.url(path)).json(&body).send().await.unwrap()
    }
}

async fn spawn_api(harness: &Harness) -> Api {
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = ServerState::new(
        harness.events.clone(),
        Arc::new(harness.provisioning()),
        Arc::new(harness.deployer()),
        Arc::new(harness.databases()),
        Arc::new(harness.backups()),
        shutdown_tx.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Api {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        _shutdown: shutdown_tx,
    }
}

fn deploy_shell() -> Arc<ScriptedShell> {
    let shell = ScriptedShell::local();
    shell.on("rev-parse HEAD", &format!("{}\n", COMMIT));
    shell.on("ls -A", "Dockerfile\n");
    shell.on("State.Status", "running\n");
    shell
}

fn app_body() -> Value {
    json!({
        "name": "api",
        "repo_url": "https://github.com/acme/api.git",
        "port": 3000,
        "env_vars": {"NODE_ENV": "production"}
    })
}

async fn wait_for_status(api: &Api, app_id: &str, wanted: &str) -> Value {
    for _ in 0..100 {
        let status: Value = api
            .get(&format!("/apps/{}/status", app_id))
            .await
            .json()
            .await
            .unwrap();
        if status["status"] == wanted {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("app {} never reached {}", app_id, wanted);
}

#[tokio::test]
async fn test_health() {
    let harness = Harness::new(ScriptedShell::local());
    let api = spawn_api(&harness).await;

    let response = api.get("/health").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "dockhand");
}

#[tokio::test]
async fn test_deploy_is_accepted_and_runs_in_background() {
    let harness = Harness::new(deploy_shell());
    let api = spawn_api(&harness).await;

    let response = api.post("/apps", app_body()).await;
    assert_eq!(response.status(), 201);
    let app: Value = response.json().await.unwrap();
    let app_id = app["id"].as_str().unwrap().to_string();
    assert_eq!(app["status"], "inactive");

    let response = api
        .post(&format!("/apps/{}/deploy", app_id), json!({"operator": "alice"}))
        .await;
    assert_eq!(response.status(), 202);
    let accepted: Value = response.json().await.unwrap();
    assert_eq!(accepted["operation"], "deploy");
    assert_eq!(accepted["events_url"], format!("/events/app/{}", app_id));

    let status = wait_for_status(&api, &app_id, "active").await;
    assert_eq!(status["instance_state"], "running");
    assert_eq!(status["can_fast_rollback"], false);

    let apps: Value = api.get("/apps").await.json().await.unwrap();
    let deployments = apps[0]["deployments"].as_array().unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0]["operator"], "alice");
    assert_eq!(deployments[0]["commit"], COMMIT);
}

#[tokio::test]
async fn test_fast_rollback_answers_inline() {
    let harness = Harness::new(deploy_shell());
    let api = spawn_api(&harness).await;
    let app: Value = api.post("/apps", app_body()).await.json().await.unwrap();
    let app_id = app["id"].as_str().unwrap().to_string();

    let response = api.post(&format!("/apps/{}/rollback", app_id), json!({})).await;
    assert_eq!(response.status(), 400);
    let error: Value = response.json().await.unwrap();
    assert!(error["error"].as_str().unwrap().contains("previous instance"));

    let response = api
        .post(&format!("/apps/{}/rollback", app_id), json!({"deployment_index": 3}))
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let harness = Harness::new(ScriptedShell::local());
    let api = spawn_api(&harness).await;

    let response = api.get("/hosts/nope").await;
    assert_eq!(response.status(), 404);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["kind"], "not_found");

    let response = api
        .post(
            "/databases",
            json!({"name": "shop", "engine": "cassandra"}),
        )
        .await;
    assert_eq!(response.status(), 400);

    let response = api
        .post("/backups", json!({"kind": "snapshot", "subject_id": "x"}))
        .await;
    assert_eq!(response.status(), 400);

    let response = api
        .post("/apps/nope/exec", json!({"command": "ls"}))
        .await;
    assert_eq!(response.status(), 404);

    let response = api.get("/events/widgets/x").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_second_deploy_while_deploying_conflicts() {
    let harness = Harness::new(deploy_shell());
    let api = spawn_api(&harness).await;
    let app: Value = api.post("/apps", app_body()).await.json().await.unwrap();
    let app_id = app["id"].as_str().unwrap().to_string();

    harness
        .repo::<dockhand::models::app::App>()
        .update(&app_id, |a| {
            a.status = dockhand::models::app::AppStatus::Deploying;
            Ok(())
        })
        .await
        .unwrap();

    let response = api.post(&format!("/apps/{}/deploy", app_id), json!({})).await;
    assert_eq!(response.status(), 409);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["kind"], "invalid_transition");
}
