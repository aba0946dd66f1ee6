use std::net::TcpListener;
use std::sync::Arc;

use reqwest::cookie::Jar;
use resilient_scraper::{
    BrowserFingerprint,
    CaptchaPlacement,
    ExecutorError,
    FailureKind,
    Identity,
    IdentitySettings,
    PacingSettings,
    RequestExecutor,
    RequestSpec,
    ReqwestTransportFactory,
    ResilienceConfig,
    TransportError,
    TransportFactory,
    TransportSettings,
};
use url::Url;
use wiremock::matchers::{body_string_contains, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.6422.113 Safari/537.36";

fn chrome_identity() -> Identity {
    Identity::direct("direct-0", BrowserFingerprint::for_user_agent(CHROME_UA).unwrap())
}

fn url(server: &MockServer, path: &str) -> Url {
    Url::parse(&format!("{}{path}", server.uri())).unwrap()
}

#[tokio::test]
async fn sends_fingerprint_headers_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cars"))
        .and(query_param("page", "2"))
        .and(header("user-agent", CHROME_UA))
        .and(header_exists("sec-ch-ua"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let factory = ReqwestTransportFactory::default();
    let transport = factory.create(&chrome_identity(), Arc::new(Jar::default())).unwrap();

    let request = RequestSpec::get(url(&server, "/cars")).with_query("page", "2");
    let response = transport.send(&request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "[]");
}

#[tokio::test]
async fn session_cookies_are_replayed() {
    let server = MockServer::start().await;
    Mock::given(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=abc123; Path=/"))
        .mount(&server)
        .await;
    Mock::given(path("/cars"))
        .and(header("cookie", "sid=abc123"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let factory = ReqwestTransportFactory::default();
    let transport = factory.create(&chrome_identity(), Arc::new(Jar::default())).unwrap();

    transport.send(&RequestSpec::get(url(&server, "/login"))).await.unwrap();
    let response = transport.send(&RequestSpec::get(url(&server, "/cars"))).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn captcha_token_goes_into_form_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/calc"))
        .and(body_string_contains("g-recaptcha-response=tok-1"))
        .and(body_string_contains("price=15000000"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let factory = ReqwestTransportFactory::default();
    let transport = factory.create(&chrome_identity(), Arc::new(Jar::default())).unwrap();

    let request = RequestSpec::post_form(url(&server, "/calc"), [("price", "15000000")])
        .with_captcha_field("g-recaptcha-response", CaptchaPlacement::Form)
        .with_captcha_token("tok-1");
    assert_eq!(transport.send(&request).await.unwrap().status, 200);
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let factory = ReqwestTransportFactory::new(TransportSettings {
        connect_retries: 0,
        ..TransportSettings::default()
    });
    let transport = factory.create(&chrome_identity(), Arc::new(Jar::default())).unwrap();

    let request = RequestSpec::get(Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap());
    let err = transport.send(&request).await.unwrap_err();
    assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn executor_rotates_past_a_block_over_real_http() {
    let server = MockServer::start().await;
    Mock::given(path("/cars"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(path("/cars"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let mut config = ResilienceConfig::default();
    config.pacing = PacingSettings::unpaced();
    config.retry.block_cooloff_min_ms = 0;
    config.retry.block_cooloff_max_ms = 0;
    config.identities = vec![
        IdentitySettings {
            label: Some("kr-1".into()),
            ..IdentitySettings::default()
        },
        IdentitySettings {
            label: Some("kr-2".into()),
            ..IdentitySettings::default()
        },
    ];
    let executor = RequestExecutor::new(config).unwrap();

    let response = executor
        .execute("encar", RequestSpec::get(url(&server, "/cars")), None)
        .await
        .unwrap();
    assert_eq!(response.text(), "ok");

    let status = executor.status("encar");
    assert_eq!(status.rotation_count, 1);
    assert_eq!(status.current_identity_tag.as_deref(), Some("kr-2"));
}

#[tokio::test]
async fn not_found_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(path("/car/404"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = ResilienceConfig::default();
    config.pacing = PacingSettings::unpaced();
    config.rotation.allow_direct = true;
    let executor = RequestExecutor::new(config).unwrap();

    for cached in [false, true] {
        let err = executor
            .execute("encar", RequestSpec::get(url(&server, "/car/404")), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::PermanentlyRejected);
        assert!(matches!(err, ExecutorError::Rejected { cached: c, .. } if c == cached));
    }
}
