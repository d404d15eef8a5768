// tests/integration/router_test.rs

use super::test_helpers::*;
use std::net::SocketAddr;
use stride::server::router::{self, HEALTH_PATH};
use tokio::net::TcpListener;

const TWO_ORIGINS: &str = r#"
[[origins]]
name = "prom"
origin_url = "http://prom.test:9090/base"
fast_forward_disable = true

[[origins]]
name = "web"
origin_type = "reverseproxycache"
origin_url = "http://web.test"
"#;

/// Serves the proxy's router on an ephemeral local port.
async fn spawn_server(proxy: &TestProxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router::build(proxy.state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[tokio::test]
async fn test_route_selects_named_origin_then_default() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);

    let (origin, path) = proxy.state.route("/prom/api/v1/query").unwrap();
    assert_eq!(origin.config.name, "prom");
    assert_eq!(path, "/api/v1/query");

    let (origin, path) = proxy.state.route("/api/v1/query").unwrap();
    assert_eq!(origin.config.name, "prom");
    assert_eq!(path, "/api/v1/query");

    let (_, path) = proxy.state.route("/prom").unwrap();
    assert_eq!(path, "/");
}

#[tokio::test]
async fn test_route_without_default_origin() {
    let proxy = TestProxy::new(TWO_ORIGINS);
    assert!(proxy.state.route("/web/app.js").is_some());
    assert!(proxy.state.route("/app.js").is_none());
}

#[tokio::test]
async fn test_upstream_url_keeps_origin_base_path() {
    let proxy = TestProxy::new(TWO_ORIGINS);
    let (origin, path) = proxy.state.route("/prom/api/v1/labels").unwrap();
    let url = origin.upstream_url(&path, Some("match[]=up"));
    assert_eq!(
        url.as_str(),
        "http://prom.test:9090/base/api/v1/labels?match[]=up"
    );
}

#[tokio::test]
async fn test_http_front_end() {
    let proxy = TestProxy::new(TWO_ORIGINS);
    proxy.origin.set_object(
        "/static/app.js",
        MockObject::ok("js").header("cache-control", "max-age=60"),
    );
    proxy
        .origin
        .set_object("/base/api/v1/labels", MockObject::ok("labels"));
    let addr = spawn_server(&proxy).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health = client
        .get(format!("{base}{HEALTH_PATH}"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let labels = client
        .get(format!("{base}/prom/api/v1/labels"))
        .send()
        .await
        .unwrap();
    assert_eq!(labels.status(), 200);
    assert!(
        labels
            .headers()
            .get(RESULT_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("engine=HTTPProxy")
    );
    assert_eq!(labels.text().await.unwrap(), "labels");

    for expected in ["status=kmiss", "status=hit"] {
        let response = client
            .get(format!("{base}/web/static/app.js"))
            .send()
            .await
            .unwrap();
        let result = response.headers()[RESULT_HEADER].to_str().unwrap().to_string();
        assert!(result.contains(expected), "{result}");
        assert_eq!(response.text().await.unwrap(), "js");
    }

    let missing = client
        .get(format!("{base}/nowhere"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    // The client address is forwarded.
    let forwarded = proxy
        .origin
        .requests()
        .iter()
        .find(|r| r.url.path() == "/base/api/v1/labels")
        .and_then(|r| r.headers.get("x-forwarded-for").cloned())
        .unwrap();
    assert_eq!(forwarded, "127.0.0.1");
}
