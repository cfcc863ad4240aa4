//! HTTP-level tests for the backend router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;
use sockerless_backend::{create_router, create_router_with, AppState, BackendDescriptor, Route, RouteOverrides};
use sockerless_core::config::DescriptorConfig;
use sockerless_core::exec::ExecConfig;
use sockerless_core::frame::demux;
use sockerless_core::process::ProcessFactory;
use sockerless_core::state::{Container, ContainerConfig};
use sockerless_core::{LifecycleConfig, Runtime, SystemProcessFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn state() -> AppState {
    let factory = Arc::new(SystemProcessFactory::new()) as Arc<dyn ProcessFactory>;
    let runtime = Arc::new(Runtime::new(Some(factory), LifecycleConfig::default()));
    let descriptor = BackendDescriptor::from_host(&DescriptorConfig::default(), "system", "test-instance");
    AppState::new(runtime, descriptor)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes)
}

fn json(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

async fn create(app: &Router, body: &str) -> String {
    let (status, bytes) = send(app, "POST", "/containers/create", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&bytes));
    json(&bytes)["Id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn ping_is_served_at_every_version() {
    let app = create_router(state());
    for uri in ["/_ping", "/v1.24/_ping", "/v1.43/_ping"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["api-version"], "1.43");
        assert!(response.headers().contains_key("x-request-id"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }
}

#[tokio::test]
async fn create_start_wait_logs_remove() {
    let app = create_router(state());
    let id = create(&app, r#"{"Image":"alpine","Cmd":["echo","hi"]}"#).await;
    assert_eq!(id.len(), 64);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

    let (status, _) = send(&app, "POST", &format!("/containers/{id}/start"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "POST", &format!("/containers/{id}/wait"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), serde_json::json!({"StatusCode": 0}));

    let (status, body) = send(&app, "GET", &format!("/containers/{id}/logs?stdout=1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"\x01\x00\x00\x00\x00\x00\x00\x03hi\n");

    let (status, body) = send(&app, "GET", &format!("/v1.41/containers/{id}/json"), None).await;
    assert_eq!(status, StatusCode::OK);
    let inspect = json(&body);
    assert_eq!(inspect["State"]["Status"], "exited");
    assert_eq!(inspect["State"]["ExitCode"], 0);
    assert_eq!(inspect["Path"], "echo");

    let (status, _) = send(&app, "DELETE", &format!("/containers/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", &format!("/containers/{id}/json"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json(&body)["message"].as_str().unwrap().starts_with("No such container"));
}

#[tokio::test]
async fn duplicate_name_is_a_conflict() {
    let app = create_router(state());
    let body = r#"{"Image":"alpine","Cmd":["true"],"name":"x"}"#;
    let first = create(&app, body).await;

    let (status, bytes) = send(&app, "POST", "/containers/create", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let message = json(&bytes)["message"].as_str().unwrap().to_string();
    assert!(
        message.starts_with(r#"Conflict. The container name "/x" is already in use"#),
        "{message}"
    );
    assert!(message.contains(&first));

    let (status, _) = send(&app, "POST", "/containers/create?name=x", Some(r#"{"Image":"alpine","Cmd":["true"]}"#)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn create_validates_the_body() {
    let app = create_router(state());

    let (status, bytes) = send(&app, "POST", "/containers/create", Some(r#"{"Cmd":["true"]}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&bytes)["message"].as_str().unwrap().contains("Image"));

    let (status, _) = send(&app, "POST", "/containers/create", Some(r#"{"Image":"alpine"}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/containers/create", Some("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exec_on_exited_container_is_a_conflict() {
    let app = create_router(state());
    let id = create(&app, r#"{"Image":"alpine","Cmd":["true"]}"#).await;
    send(&app, "POST", &format!("/containers/{id}/start"), None).await;
    send(&app, "POST", &format!("/containers/{id}/wait"), None).await;

    let (status, bytes) = send(
        &app,
        "POST",
        &format!("/containers/{id}/exec"),
        Some(r#"{"Cmd":["echo","x"],"AttachStdout":true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let message = json(&bytes)["message"].as_str().unwrap().to_string();
    assert!(message.starts_with("Container "), "{message}");
    assert!(message.ends_with("is not running"), "{message}");
}

#[tokio::test]
async fn stop_escalates_when_term_is_ignored() {
    let app = create_router(state());
    let id = create(
        &app,
        r#"{"Image":"alpine","Cmd":["sh","-c","trap '' TERM; sleep 30"]}"#,
    )
    .await;
    let (status, _) = send(&app, "POST", &format!("/containers/{id}/start"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let (status, _) = send(&app, "POST", &format!("/containers/{id}/stop?t=1"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());

    let (_, body) = send(&app, "GET", &format!("/containers/{id}/json"), None).await;
    let inspect = json(&body);
    assert_eq!(inspect["State"]["Status"], "exited");
    assert_ne!(inspect["State"]["ExitCode"], 0);

    let (status, _) = send(&app, "POST", &format!("/containers/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn ambiguous_short_id_is_not_found() {
    let state = state();
    let prefix = "abcdefabcdef";
    for (suffix, name) in [("0", "/one"), ("1", "/two")] {
        let id = format!("{prefix}{}", suffix.repeat(52));
        let config = ContainerConfig {
            image: "alpine".into(),
            cmd: vec!["true".into()],
            ..ContainerConfig::default()
        };
        let container = Container::new(id, name.into(), "sha256:0".into(), config);
        state.runtime.store().put_container(container).unwrap();
    }
    let app = create_router(state);

    let (status, bytes) = send(&app, "GET", &format!("/containers/{prefix}/json"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&bytes)["message"], format!("No such container: {prefix}"));

    let (status, _) = send(&app, "GET", &format!("/containers/{prefix}0/json"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn start_is_idempotent_and_list_hides_stopped() {
    let app = create_router(state());
    let running = create(&app, r#"{"Image":"alpine","Cmd":["sleep","30"],"Labels":{"role":"web"}}"#).await;
    let idle = create(&app, r#"{"Image":"alpine","Cmd":["true"]}"#).await;

    let (status, _) = send(&app, "POST", &format!("/containers/{running}/start"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "POST", &format!("/containers/{running}/start"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/containers/json", None).await;
    let list = json(&body);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["Id"], running.as_str());
    assert_eq!(list[0]["State"], "running");

    let (_, body) = send(&app, "GET", "/containers/json?all=1", None).await;
    assert_eq!(json(&body).as_array().unwrap().len(), 2);

    let filters = r#"{"label":["role=web"]}"#;
    let uri = format!("/containers/json?all=1&filters={}", urlencode(filters));
    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let list = json(&body);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_ne!(list[0]["Id"], idle.as_str());

    let (_, body) = send(&app, "GET", "/info", None).await;
    let info = json(&body);
    assert_eq!(info["Containers"], 2);
    assert_eq!(info["ContainersRunning"], 1);
    assert_eq!(info["Driver"], "system");

    let (status, _) = send(&app, "DELETE", &format!("/containers/{running}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(&app, "DELETE", &format!("/containers/{running}?force=1"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

fn urlencode(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => (b as char).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[tokio::test]
async fn kill_rejects_unknown_signals() {
    let app = create_router(state());
    let id = create(&app, r#"{"Image":"alpine","Cmd":["sleep","30"]}"#).await;
    send(&app, "POST", &format!("/containers/{id}/start"), None).await;

    let (status, _) = send(&app, "POST", &format!("/containers/{id}/kill?signal=SIGBOGUS"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", &format!("/containers/{id}/kill"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send(&app, "POST", &format!("/containers/{id}/wait"), None).await;
    assert_eq!(json(&body)["StatusCode"], 137);
}

#[tokio::test]
async fn logs_require_a_stream() {
    let app = create_router(state());
    let id = create(&app, r#"{"Image":"alpine","Cmd":["true"]}"#).await;
    let (status, _) = send(&app, "GET", &format!("/containers/{id}/logs"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", &format!("/containers/{id}/logs?stdout=1&stderr=1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn images_pull_tag_and_remove() {
    let app = create_router(state());
    let (status, body) = send(&app, "POST", "/images/create?fromImage=alpine&tag=3.19", None).await;
    assert_eq!(status, StatusCode::OK);
    let lines: Vec<Value> = body
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_slice(l).unwrap())
        .collect();
    assert!(lines.last().unwrap()["status"].as_str().unwrap().contains("Downloaded newer image"));

    let (status, _) = send(&app, "POST", "/images/create", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", "/images/alpine:3.19/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json(&body)["Id"].as_str().unwrap().starts_with("sha256:"));

    let (status, _) = send(&app, "POST", "/images/alpine:3.19/tag?repo=mirror/alpine&tag=1", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, body) = send(&app, "GET", "/images/json", None).await;
    assert_eq!(json(&body)[0]["RepoTags"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, "DELETE", "/images/alpine:3.19", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)[0]["Untagged"], "alpine:3.19");
}

#[tokio::test]
async fn overrides_replace_single_routes() {
    async fn teapot(_: AppState, _: Request<Body>) -> Response {
        (StatusCode::IM_A_TEAPOT, "cloud create").into_response()
    }

    let overrides = RouteOverrides::new().with(Route::CreateContainer, teapot);
    assert!(overrides.contains(Route::CreateContainer));
    let app = create_router_with(state(), &overrides);

    for uri in ["/containers/create", "/v1.43/containers/create"] {
        let (status, body) = send(&app, "POST", uri, Some(r#"{"Image":"alpine","Cmd":["true"]}"#)).await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert_eq!(&body[..], b"cloud create");
    }

    let (status, body) = send(&app, "GET", "/containers/json?all=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), serde_json::json!([]));
}

#[tokio::test]
async fn handler_panics_become_internal_errors() {
    async fn exploding(_: AppState, _: Request<Body>) -> Response {
        panic!("process factory exploded")
    }

    let app = create_router_with(state(), &RouteOverrides::new().with(Route::Info, exploding));
    let (status, body) = send(&app, "GET", "/info", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(&body), serde_json::json!({"message": "internal server error"}));
}

/// The exit code is recorded just after the output streams close.
async fn settled_exec(runtime: &Runtime, id: &str) -> sockerless_core::ExecInstance {
    for _ in 0..50 {
        let inspect = runtime.execs().inspect(id).unwrap();
        if inspect.started && !inspect.running {
            return inspect;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("exec {id} did not finish");
}

#[tokio::test]
async fn exec_start_hijacks_the_connection() {
    let state = state();
    let runtime = Arc::clone(&state.runtime);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(sockerless_backend::server::serve_tcp(
        listener,
        create_router(state),
        shutdown.clone(),
    ));

    let config = ContainerConfig {
        image: "alpine".into(),
        cmd: vec!["sleep".into(), "30".into()],
        ..ContainerConfig::default()
    };
    let container = runtime.containers().create(config, None).unwrap();
    runtime.containers().start(&container.id).await.unwrap();
    let exec = runtime
        .execs()
        .create(
            &container.id,
            ExecConfig {
                cmd: vec!["sh".into(), "-c".into(), "echo out; echo err >&2".into()],
                attach_stdout: true,
                attach_stderr: true,
                ..ExecConfig::default()
            },
        )
        .unwrap();

    let body = r#"{"Detach":false,"Tty":false}"#;
    let request = format!(
        "POST /v1.43/exec/{}/start HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        exec.id,
        body.len()
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.to_ascii_lowercase().contains("application/vnd.docker.multiplexed-stream"));

    let (mut out, mut err) = (Vec::new(), Vec::new());
    demux(&raw[split..], &mut out, &mut err).await.unwrap();
    assert_eq!(out, b"out\n");
    assert_eq!(err, b"err\n");

    let inspect = settled_exec(&runtime, &exec.id).await;
    assert_eq!(inspect.exit_code, Some(0));

    runtime.containers().remove(&container.id, true).await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn attach_keeps_streaming_after_stdin_closes() {
    let state = state();
    let runtime = Arc::clone(&state.runtime);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(sockerless_backend::server::serve_tcp(
        listener,
        create_router(state),
        shutdown.clone(),
    ));

    let config = ContainerConfig {
        image: "alpine".into(),
        cmd: vec!["sh".into(), "-c".into(), "read line; sleep 0.3; echo got:$line".into()],
        open_stdin: true,
        ..ContainerConfig::default()
    };
    let container = runtime.containers().create(config, None).unwrap();
    runtime.containers().start(&container.id).await.unwrap();

    let request = format!(
        "POST /v1.43/containers/{}/attach?stream=1&stdin=1&stdout=1&stderr=1 HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nContent-Length: 0\r\n\r\n",
        container.id
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let split = loop {
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed before the upgrade");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    stream.write_all(b"hello\n").await.unwrap();
    stream.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let (mut out, mut err) = (Vec::new(), Vec::new());
    demux(&raw[split..], &mut out, &mut err).await.unwrap();
    assert_eq!(out, b"got:hello\n");

    let code = runtime
        .containers()
        .wait(&container.id, sockerless_core::WaitCondition::NotRunning)
        .await
        .unwrap();
    assert_eq!(code, 0);
    runtime.containers().remove(&container.id, true).await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn stopped_container_keeps_its_name() {
    let app = create_router(state());
    let body = r#"{"Image":"alpine","Cmd":["sleep","30"],"name":"kept"}"#;
    let id = create(&app, body).await;
    let (status, _) = send(&app, "POST", &format!("/containers/{id}/start"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "POST", &format!("/containers/{id}/stop?t=1"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "POST", "/containers/create", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "DELETE", &format!("/containers/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    create(&app, body).await;
}

#[tokio::test]
async fn exec_start_streams_without_upgrade() {
    let app = create_router(state());
    let id = create(&app, r#"{"Image":"alpine","Cmd":["sleep","30"]}"#).await;
    send(&app, "POST", &format!("/containers/{id}/start"), None).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/containers/{id}/exec"),
        Some(r#"{"Cmd":["sh","-c","exit 3"],"AttachStdout":true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let exec_id = json(&body)["Id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "POST", &format!("/exec/{exec_id}/start"), Some("{}")).await;
    assert_eq!(status, StatusCode::OK);

    let mut inspect = Value::Null;
    for _ in 0..50 {
        let (_, body) = send(&app, "GET", &format!("/exec/{exec_id}/json"), None).await;
        inspect = json(&body);
        if inspect["Running"] == false && !inspect["ExitCode"].is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(inspect["ExitCode"], 3);
    assert_eq!(inspect["ContainerID"], id.as_str());
    assert_eq!(inspect["ProcessConfig"]["entrypoint"], "sh");

    let (status, _) = send(&app, "POST", &format!("/exec/{exec_id}/start"), Some("{}")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    send(&app, "DELETE", &format!("/containers/{id}?force=1"), None).await;
    let (status, _) = send(&app, "GET", &format!("/exec/{exec_id}/json"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rename_moves_the_name() {
    let app = create_router(state());
    let id = create(&app, r#"{"Image":"alpine","Cmd":["true"],"name":"old"}"#).await;
    create(&app, r#"{"Image":"alpine","Cmd":["true"],"name":"taken"}"#).await;

    let (status, _) = send(&app, "POST", &format!("/containers/{id}/rename"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, "POST", "/containers/old/rename?name=taken", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(&app, "POST", "/containers/old/rename?name=bad%2Fname", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/v1.43/containers/old/rename?name=new", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, "GET", "/containers/new/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["Id"], id.as_str());
    assert_eq!(json(&body)["Name"], "/new");
    let (status, _) = send(&app, "GET", "/containers/old/json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    create(&app, r#"{"Image":"alpine","Cmd":["true"],"name":"old"}"#).await;
}

#[tokio::test]
async fn container_prune_spares_running_containers() {
    let app = create_router(state());
    let done = create(&app, r#"{"Image":"alpine","Cmd":["true"]}"#).await;
    send(&app, "POST", &format!("/containers/{done}/start"), None).await;
    send(&app, "POST", &format!("/containers/{done}/wait"), None).await;
    let fresh = create(&app, r#"{"Image":"alpine","Cmd":["true"]}"#).await;
    let running = create(&app, r#"{"Image":"alpine","Cmd":["sleep","30"]}"#).await;
    send(&app, "POST", &format!("/containers/{running}/start"), None).await;

    let (status, body) = send(&app, "POST", "/containers/prune", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["ContainersDeleted"], serde_json::json!([done]));
    assert_eq!(json(&body)["SpaceReclaimed"], 0);

    for id in [&fresh, &running] {
        let (status, _) = send(&app, "GET", &format!("/containers/{id}/json"), None).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send(&app, "POST", "/containers/prune?filters=%7Bbad", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    send(&app, "DELETE", &format!("/containers/{running}?force=1"), None).await;
}

#[tokio::test]
async fn image_prune_keeps_images_in_use() {
    let app = create_router(state());
    send(&app, "POST", "/images/create?fromImage=busybox", None).await;
    create(&app, r#"{"Image":"alpine","Cmd":["true"]}"#).await;

    let (status, body) = send(&app, "POST", "/images/prune", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["ImagesDeleted"], serde_json::json!([]));

    let filters = urlencode(r#"{"dangling":["false"]}"#);
    let (status, body) = send(&app, "POST", &format!("/images/prune?filters={filters}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let deleted = json(&body)["ImagesDeleted"].clone();
    assert_eq!(deleted[0]["Untagged"], "busybox:latest");
    assert!(deleted[1]["Deleted"].as_str().unwrap().starts_with("sha256:"));
    assert_eq!(deleted.as_array().unwrap().len(), 2);

    let (_, body) = send(&app, "GET", "/images/json", None).await;
    assert_eq!(json(&body)[0]["RepoTags"], serde_json::json!(["alpine:latest"]));
}

#[tokio::test]
async fn events_stream_filtered_lifecycle() {
    let app = create_router(state());
    let filters = urlencode(r#"{"type":["container"],"event":["create","start","die"]}"#);
    let request = Request::builder()
        .uri(format!("/events?filters={filters}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");
    let mut body = response.into_body();

    send(&app, "POST", "/images/create?fromImage=alpine", None).await;
    let id = create(&app, r#"{"Image":"alpine","Cmd":["true"],"name":"ev"}"#).await;
    send(&app, "POST", &format!("/containers/{id}/start"), None).await;

    let mut buffer = Vec::new();
    let mut lines: Vec<Value> = Vec::new();
    while lines.len() < 3 {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("event did not arrive")
            .unwrap()
            .unwrap();
        buffer.extend_from_slice(&frame.into_data().unwrap());
        while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=end).collect();
            lines.push(serde_json::from_slice(&line).unwrap());
        }
    }

    let actions: Vec<&str> = lines.iter().map(|l| l["Action"].as_str().unwrap()).collect();
    assert_eq!(actions, ["create", "start", "die"]);
    for line in &lines {
        assert_eq!(line["Type"], "container");
        assert_eq!(line["Actor"]["ID"], id.as_str());
        assert_eq!(line["Actor"]["Attributes"]["name"], "ev");
        assert_eq!(line["id"], id.as_str());
    }
    assert_eq!(lines[0]["from"], "alpine");
    assert_eq!(lines[2]["Actor"]["Attributes"]["exitCode"], "0");
}

#[tokio::test]
async fn events_reject_bad_filters_and_end_for_past_until() {
    let app = create_router(state());
    let (status, _) = send(&app, "GET", "/events?filters=%5B1%5D", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .uri("/events?until=1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .unwrap()
        .unwrap()
        .to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn restart_policy_is_validated_and_reported() {
    let app = create_router(state());
    let (status, body) = send(
        &app,
        "POST",
        "/containers/create",
        Some(r#"{"Image":"alpine","Cmd":["true"],"HostConfig":{"RestartPolicy":{"Name":"sometimes"}}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&body)["message"].as_str().unwrap().contains("unknown policy 'sometimes'"));

    let (status, _) = send(
        &app,
        "POST",
        "/containers/create",
        Some(r#"{"Image":"alpine","Cmd":["true"],"HostConfig":{"RestartPolicy":{"Name":"always","MaximumRetryCount":2}}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let id = create(
        &app,
        r#"{"Image":"alpine","Cmd":["sh","-c","exit 3"],"HostConfig":{"RestartPolicy":{"Name":"on-failure","MaximumRetryCount":1}}}"#,
    )
    .await;
    let (_, body) = send(&app, "GET", &format!("/containers/{id}/json"), None).await;
    assert_eq!(
        json(&body)["HostConfig"]["RestartPolicy"],
        serde_json::json!({"Name": "on-failure", "MaximumRetryCount": 1})
    );

    send(&app, "POST", &format!("/containers/{id}/start"), None).await;
    let mut inspect = Value::Null;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (_, body) = send(&app, "GET", &format!("/containers/{id}/json"), None).await;
        inspect = json(&body);
        if inspect["RestartCount"] == 1 && inspect["State"]["Status"] == "exited" {
            break;
        }
    }
    assert_eq!(inspect["RestartCount"], 1);
    assert_eq!(inspect["State"]["ExitCode"], 3);
}

#[tokio::test]
async fn management_endpoints_report_the_backend() {
    let app = create_router(state());
    let id = create(&app, r#"{"Image":"alpine","Cmd":["true"],"name":"mgmt"}"#).await;
    send(&app, "GET", &format!("/containers/{id}/json"), None).await;
    send(&app, "GET", "/v1.41/containers/mgmt/json", None).await;

    let (status, body) = send(&app, "GET", "/internal/v1/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    let health = json(&body);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["component"], "backend");
    assert!(health["uptime_seconds"].is_u64());

    let (_, body) = send(&app, "GET", "/internal/v1/status", None).await;
    let status_body = json(&body);
    assert_eq!(status_body["backend_type"], "system");
    assert_eq!(status_body["instance_id"], "test-instance");
    assert_eq!(status_body["containers"], 1);
    assert_eq!(status_body["active_resources"], 0);

    let (_, body) = send(&app, "GET", "/internal/v1/containers/summary", None).await;
    let summary = json(&body);
    assert_eq!(summary[0]["id"], id.as_str());
    assert_eq!(summary[0]["name"], "/mgmt");
    assert_eq!(summary[0]["state"], "created");

    let (_, body) = send(&app, "GET", "/internal/v1/metrics", None).await;
    let metrics = json(&body);
    assert_eq!(metrics["requests"]["GET /containers/{id}/json"], 2);
    assert_eq!(metrics["requests"]["POST /containers/create"], 1);
    assert!(metrics["latency_ms"]["GET /containers/{id}/json"]["p99"].is_u64());
    assert_eq!(metrics["containers"], 1);

    let (_, body) = send(&app, "GET", "/internal/v1/check", None).await;
    let checks = json(&body)["checks"].clone();
    let names: Vec<&str> = checks
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["store", "registry", "process_factory"]);
    assert_eq!(checks[2]["detail"], "system");

    let (status, _) = send(&app, "GET", "/v1.43/internal/v1/healthz", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
