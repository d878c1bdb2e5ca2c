use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, StatusCode, Uri, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use omnihistory::{config::Config, server::ServerHandle};
use rusqlite::Connection;
use serde_json::{Value, json};
use tempfile::TempDir;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

struct TestServer {
    _dir: TempDir,
    db_path: std::path::PathBuf,
    handle: ServerHandle,
    client: HttpClient,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("history.db");
        let config = Config::from_toml_str(&format!(
            r#"
[server]
listen = "127.0.0.1:0"

[storage]
path = "{}"
"#,
            db_path.display()
        ))
        .unwrap();
        let handle = omnihistory::server::serve(&config).await.unwrap();

        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        let client: HttpClient = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            _dir: dir,
            db_path,
            handle,
            client,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.handle.listen_addr
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let uri: Uri = format!("http://{}{path}", self.addr()).parse().unwrap();
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(serde_json::to_vec(&body).unwrap()))
            }
            None => Full::new(Bytes::new()),
        };
        let res = self.client.request(builder.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let body_bytes = res.into_body().collect().await.unwrap().to_bytes();
        let value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap()
        };
        (status, value)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        self.send(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

fn get_request_content(path_and_query: &str, user_agent: &str) -> String {
    format!("GET {path_and_query} HTTP/1.1\r\nHost: x.test\r\nUser-Agent: {user_agent}\r\n\r\n")
}

#[tokio::test]
async fn capture_then_fetch_returns_derived_fields_and_parameters() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/api/capture",
            json!({
                "app_code": "shop",
                "session_key": "sess-1",
                "client_username": "ada",
                "remote_addr": "203.0.113.9",
                "full_url": "http://x.test/a/b?x=1&y=2&x=3",
                "content": get_request_content("/a/b?x=1&y=2&x=3", "test-agent"),
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let id = body["id"].as_i64().unwrap();

    let (status, detail) = server.get(&format!("/api/requests/{id}")).await;
    assert_eq!(status, StatusCode::OK, "body: {detail}");
    let request = &detail["request"];
    assert_eq!(request["protocol"], "http");
    assert_eq!(request["host"], "x.test");
    assert_eq!(request["path"], "/a/b");
    assert_eq!(request["method"], "GET");
    assert_eq!(request["user_agent"], "test-agent");
    assert_eq!(request["remote_addr"], "203.0.113.9");
    assert_eq!(detail["query_string"], "x=1&y=2&x=3");
    assert_eq!(detail["form_body"], "");

    let positions: Vec<(String, String, u64)> = detail["query_params"]
        .as_array()
        .unwrap()
        .iter()
        .map(|param| {
            (
                param["key"].as_str().unwrap().to_owned(),
                param["value"].as_str().unwrap().to_owned(),
                param["position"].as_u64().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        positions,
        vec![
            ("x".to_owned(), "1".to_owned(), 0),
            ("y".to_owned(), "2".to_owned(), 1),
            ("x".to_owned(), "3".to_owned(), 2),
        ]
    );

    let (status, latest) = server.get("/api/requests/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["request"]["id"], id);

    let (status, app) = server.get("/api/apps/shop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app["name"], "shop");

    server.shutdown().await;
}

#[tokio::test]
async fn capture_without_remote_addr_uses_connection_peer() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/api/capture",
            json!({
                "app_code": "shop",
                "session_key": "sess-1",
                "full_url": "https://x.test/",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");

    let (_, detail) = server.get(&format!("/api/requests/{}", body["id"])).await;
    assert_eq!(detail["request"]["remote_addr"], "127.0.0.1");
    assert_eq!(detail["request"]["method"], "");
    assert_eq!(detail["request"]["protocol"], "https");
    assert!(detail["query_params"].as_array().unwrap().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn editing_a_request_recomputes_fields_and_replaces_parameters() {
    let server = TestServer::start().await;

    let (_, body) = server
        .post(
            "/api/capture",
            json!({
                "app_code": "shop",
                "session_key": "sess-1",
                "full_url": "http://x.test/old?a=1&b=2&c=3",
                "content": get_request_content("/old?a=1&b=2&c=3", "before"),
            }),
        )
        .await;
    let id = body["id"].as_i64().unwrap();

    let (status, detail) = server
        .send(
            Method::PUT,
            &format!("/api/requests/{id}"),
            Some(json!({
                "full_url": "https://y.test/new?only=1",
                "content": "POST /new HTTP/1.1\r\nUser-Agent: after\r\n\r\nfield=value\r\n",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {detail}");
    assert_eq!(detail["request"]["host"], "y.test");
    assert_eq!(detail["request"]["path"], "/new");
    assert_eq!(detail["request"]["method"], "POST");
    assert_eq!(detail["request"]["user_agent"], "after");
    assert_eq!(detail["query_string"], "only=1");
    assert_eq!(detail["form_body"], "field=value");

    let (status, _) = server
        .send(Method::PUT, "/api/requests/999", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn partial_population_returns_multi_status_and_populate_recovers() {
    let server = TestServer::start().await;

    let conn = Connection::open(&server.db_path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TRIGGER reject_query_parameters BEFORE INSERT ON query_parameters
        BEGIN
          SELECT RAISE(ABORT, 'query parameters unavailable');
        END;
        "#,
    )
    .unwrap();

    let (status, body) = server
        .post(
            "/api/capture",
            json!({
                "app_code": "shop",
                "session_key": "sess-1",
                "full_url": "http://x.test/?q=1",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::MULTI_STATUS, "body: {body}");
    let id = body["id"].as_i64().unwrap();
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .contains("query parameters unavailable"),
        "body: {body}"
    );

    let (status, detail) = server.get(&format!("/api/requests/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["query_string"], "");

    conn.execute_batch("DROP TRIGGER reject_query_parameters;")
        .unwrap();
    let (status, detail) = server
        .post(&format!("/api/requests/{id}/populate"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "body: {detail}");
    assert_eq!(detail["query_string"], "q=1");

    server.shutdown().await;
}

#[tokio::test]
async fn responses_are_write_once() {
    let server = TestServer::start().await;

    let (_, body) = server
        .post(
            "/api/capture",
            json!({
                "app_code": "shop",
                "session_key": "sess-1",
                "full_url": "http://x.test/",
            }),
        )
        .await;
    let id = body["id"].as_i64().unwrap();
    let path = format!("/api/requests/{id}/response");

    let (status, _) = server.get(&path).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, created) = server
        .post(&path, json!({"status_code": 200, "content": "HTTP/1.1 200 OK\r\n\r\nok"}))
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {created}");

    let (status, conflict) = server
        .post(&path, json!({"status_code": 500, "content": "nope"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(
        conflict["error"]
            .as_str()
            .unwrap()
            .contains("already has a response"),
        "body: {conflict}"
    );

    let (status, stored) = server.get(&path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored, created);
    assert_eq!(stored["status_code"], 200);

    let (status, _) = server
        .post("/api/requests/999/response", json!({"status_code": 200}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn apps_sessions_and_links_enforce_uniqueness() {
    let server = TestServer::start().await;

    let (status, _) = server
        .post("/api/apps", json!({"code": "shop", "name": "Shop"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = server
        .post("/api/apps", json!({"code": "shop", "name": "Again"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "body: {body}");
    let (status, _) = server
        .post("/api/apps", json!({"code": "bad code", "name": "Bad"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = server.get("/api/apps/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, first) = server
        .post("/api/sessions", json!({"app_code": "shop", "key": "a"}))
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {first}");
    let (status, second) = server
        .post("/api/sessions", json!({"app_code": "shop", "key": "b"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = server
        .post("/api/sessions", json!({"app_code": "shop", "key": "a"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let first_id = first["id"].as_i64().unwrap();
    let second_id = second["id"].as_i64().unwrap();
    let (status, linked) = server
        .post(
            &format!("/api/sessions/{first_id}/links"),
            json!({"session_id": second_id}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {linked}");
    assert_eq!(linked[0]["id"], second_id);

    let (status, linked) = server
        .get(&format!("/api/sessions/{second_id}/links"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(linked[0]["id"], first_id);

    let (status, _) = server
        .post(
            &format!("/api/sessions/{first_id}/links"),
            json!({"session_id": first_id}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = server.get("/api/sessions/999/links").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn session_request_listing_is_newest_first_and_paginated() {
    let server = TestServer::start().await;

    let mut ids = Vec::new();
    for path in ["/1", "/2", "/3"] {
        let (_, body) = server
            .post(
                "/api/capture",
                json!({
                    "app_code": "shop",
                    "session_key": "sess-1",
                    "full_url": format!("http://x.test{path}"),
                }),
            )
            .await;
        ids.push(body["id"].as_i64().unwrap());
    }
    let (_, detail) = server.get(&format!("/api/requests/{}", ids[0])).await;
    let session_id = detail["request"]["session_id"].as_i64().unwrap();

    let (status, page) = server
        .get(&format!("/api/sessions/{session_id}/requests?limit=2"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<i64> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|summary| summary["id"].as_i64().unwrap())
        .collect();
    assert_eq!(listed, vec![ids[2], ids[1]]);

    let (status, page) = server
        .get(&format!("/api/sessions/{session_id}/requests?offset=2"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page[0]["id"], ids[0]);

    let (status, body) = server
        .get(&format!("/api/sessions/{session_id}/requests?limit=abc"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");

    let (status, body) = server
        .get(&format!(
            "/api/sessions/{session_id}/requests?session_id={}",
            session_id + 1
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert!(
        body["error"].as_str().unwrap().contains("`session_id`"),
        "body: {body}"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_routes_and_methods_are_rejected() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = server.get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not found");

    let (status, _) = server.send(Method::DELETE, "/api/capture", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = server
        .send(Method::POST, "/api/capture", Some(json!({"unexpected": true})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"].as_str().unwrap().starts_with("invalid JSON body"),
        "body: {body}"
    );

    let (status, _) = server.get("/api/requests/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.shutdown().await;
}
