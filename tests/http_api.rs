//! HTTP API tests: a local page server stands in for the web, and the
//! refindex router is served on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;

use refindex::config::parse_config;
use refindex::db;
use refindex::migrate::run_migrations;
use refindex::server::router;
use refindex::sqlite_store::SqliteStore;
use refindex::{ReferenceStore, ReferenceStoreConfig};

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Api {
    _tmp: TempDir,
    base: String,
    pages: String,
    refs: Arc<ReferenceStore>,
    client: reqwest::Client,
}

impl Api {
    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = self.client.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    async fn add(&self, page: &str) -> (StatusCode, Value) {
        self.post(
            "/api/references/add",
            Some(json!({ "type": "url", "contents": format!("{}{}", self.pages, page) })),
        )
        .await
    }
}

async fn setup() -> Api {
    let pages = Router::new()
        .route(
            "/cats",
            get(|| async {
                Html("<!DOCTYPE html><html><head><title>t</title></head><body><h1>Cats</h1><p>Cats and dogs play together.</p></body></html>")
            }),
        )
        .route("/plain", get(|| async { "Parrots talk. Parrots mimic sounds." }))
        .route("/huge", get(|| async { "Too many words here. ".repeat(1000) }));
    let pages_addr = spawn(pages).await;

    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        "[db]\npath = \"{}\"\n[fetch]\nmax_bytes = 4096\n",
        tmp.path().join("api.sqlite").display()
    ))
    .unwrap();
    let pool = db::connect(&config).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let parts = ReferenceStoreConfig::from_config(&config, SqliteStore::new(pool)).unwrap();
    let refs = Arc::new(ReferenceStore::new(parts));

    let api_addr = spawn(router(refs.clone())).await;

    Api {
        _tmp: tmp,
        base: format!("http://{}", api_addr),
        pages: format!("http://{}", pages_addr),
        refs,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn test_health() {
    let api = setup().await;
    let (status, body) = api.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_add_index_and_query() {
    let api = setup().await;

    let (status, added) = api.add("/cats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(added["type"], "url");
    assert_eq!(added["indexed"], false);
    assert!(added["contents"].as_str().unwrap().contains("Cats and dogs"));
    let id = added["id"].as_str().unwrap().to_string();

    api.refs.wait_idle().await;

    let (status, got) = api.get(&format!("/api/references/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(got["indexed"], true);
    assert_eq!(got["status"], "indexed");
    assert_eq!(got["title"], "Cats");
    assert!(got.get("contents").is_none());
    let keywords: Vec<String> = serde_json::from_value(got["keywords"].clone()).unwrap();
    assert!(keywords.contains(&"cats".to_string()));
    assert!(keywords.contains(&"dogs".to_string()));

    let (_, with_contents) = api
        .get(&format!("/api/references/{}?contents=true", id))
        .await;
    assert!(with_contents["contents"].as_str().is_some());

    let (_, contents) = api.get(&format!("/api/references/{}/contents", id)).await;
    assert!(contents.as_str().unwrap().contains("play together"));

    let (_, kws) = api.get(&format!("/api/references/{}/keywords", id)).await;
    assert_eq!(kws, json!(keywords));

    let (_, list) = api.get("/api/references?keywords=cats,dogs").await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    let (_, list) = api.get("/api/references?keywords=cats,zebras").await;
    assert!(list.as_array().unwrap().is_empty());

    let (_, counts) = api.get("/api/keywords/counts?tags=cats").await;
    assert_eq!(counts["cats"], 1);
    let (_, counts) = api.get("/api/keywords/counts?tags=cats,zebras").await;
    assert_eq!(counts, json!({}));

    let (_, all) = api.get("/api/keywords").await;
    assert!(all.as_array().unwrap().contains(&json!("cats")));
}

#[tokio::test]
async fn test_plain_text_page_and_reindex() {
    let api = setup().await;
    let (_, added) = api.add("/plain").await;
    let id = added["id"].as_str().unwrap().to_string();

    let (status, pending) = api
        .post(&format!("/api/references/{}/reindex", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["indexed"], false);

    api.refs.wait_idle().await;
    let (_, kws) = api.get(&format!("/api/references/{}/keywords", id)).await;
    assert!(kws.as_array().unwrap().contains(&json!("parrots")));
}

#[tokio::test]
async fn test_error_contract() {
    let api = setup().await;

    let (status, body) = api
        .post(
            "/api/references/add",
            Some(json!({ "type": "pdf", "contents": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_type");

    let (status, body) = api.add("/nope").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "fetch_failed");
    let (_, list) = api.get("/api/references").await;
    assert!(list.as_array().unwrap().is_empty());

    let (status, body) = api.get("/api/references/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = api.post("/api/references/unknown/reindex", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oversized_page_is_rejected() {
    let api = setup().await;

    let (status, body) = api.add("/huge").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "fetch_failed");
    assert!(body["error"]["message"].as_str().unwrap().contains("/huge"));

    let (_, list) = api.get("/api/references").await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete() {
    let api = setup().await;
    let (_, added) = api.add("/cats").await;
    let id = added["id"].as_str().unwrap().to_string();
    api.refs.wait_idle().await;

    let resp = api
        .client
        .delete(format!("{}/api/references/{}", api.base, id))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "success");

    let (status, _) = api.get(&format!("/api/references/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, kws) = api.get(&format!("/api/references/{}/keywords", id)).await;
    assert_eq!(kws, json!([]));
}
