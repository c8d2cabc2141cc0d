use std::time::Duration;

use probe_engine::{Engine, EngineConfig, RequestOptions};
use wiremock::matchers::{basic_auth, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> EngineConfig {
    EngineConfig {
        url: Some(format!("{}/", server.uri())),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn sends_default_headers_cookies_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "1"))
        .and(query_param("page", "2"))
        .and(header("cookie", "session=abc"))
        .and(header("from", "audit@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.cookies.insert("session".into(), "abc".into());
    config.authed_by = Some("audit@example.com".into());
    let engine = Engine::with_config(config).unwrap();

    let mut handle = engine
        .get(
            format!("{}/search?q=1", server.uri()).as_str(),
            RequestOptions::new().param("page", "2"),
        )
        .await
        .unwrap();
    assert!(engine.run().await);

    let response = handle.next_response().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body().as_ref(), b"hello");

    let received = server.received_requests().await.unwrap();
    let agent = received[0].headers.get("user-agent").unwrap().to_str().unwrap();
    assert!(agent.starts_with("probe-engine/"));
}

#[tokio::test]
async fn post_params_are_form_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("user=admin&pass=a+b"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    let engine = Engine::with_config(config_for(&server)).unwrap();

    let mut handle = engine
        .post(
            format!("{}/login", server.uri()).as_str(),
            RequestOptions::new().param("user", "admin").param("pass", "a b"),
        )
        .await
        .unwrap();
    engine.run().await;

    assert_eq!(handle.next_response().await.unwrap().status(), 201);
}

#[tokio::test]
async fn redirects_are_only_followed_on_request() {
    let server = MockServer::start().await;
    Mock::given(path("/start"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/final"))
        .mount(&server)
        .await;
    Mock::given(path("/final"))
        .respond_with(ResponseTemplate::new(200).set_body_string("final"))
        .expect(1)
        .mount(&server)
        .await;
    let engine = Engine::with_config(config_for(&server)).unwrap();
    let start = format!("{}/start", server.uri());

    let mut direct = engine
        .get(start.as_str(), RequestOptions::new())
        .await
        .unwrap();
    let mut followed = engine
        .get(start.as_str(), RequestOptions::new().follow_redirects(true))
        .await
        .unwrap();
    engine.run().await;

    let direct = direct.next_response().await.unwrap();
    assert_eq!(direct.status(), 302);
    assert_eq!(direct.url().path(), "/start");

    let followed = followed.next_response().await.unwrap();
    assert_eq!(followed.status(), 200);
    assert_eq!(followed.url().path(), "/final");
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    let mut config = config_for(&server);
    config.request_timeout_ms = 200;
    let engine = Engine::with_config(config).unwrap();

    let mut handle = engine.get(None, RequestOptions::new()).await.unwrap();
    engine.run().await;

    let response = handle.next_response().await.unwrap();
    assert!(response.timed_out());
    assert_eq!(engine.time_out_count(), 1);
}

#[tokio::test]
async fn seed_credentials_become_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(basic_auth("user", "pass"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let config = EngineConfig {
        url: Some(format!("http://user:pass@{}/", server.address())),
        ..EngineConfig::default()
    };
    let engine = Engine::with_config(config).unwrap();

    let mut handle = engine
        .get(None, RequestOptions::new().synchronous())
        .await
        .unwrap();

    assert_eq!(handle.try_next_response().unwrap().status(), 204);
}
