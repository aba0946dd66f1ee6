use std::time::Duration;

use resilient_scraper::{CapSolverProvider, CaptchaConfig, CaptchaError, CaptchaSolver, CaptchaTask};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer, timeout: Duration) -> CapSolverProvider {
    let config = CaptchaConfig {
        timeout,
        poll_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
    };
    CapSolverProvider::with_config("CAP-test-key", config)
        .unwrap()
        .with_base_url(Url::parse(&format!("{}/", server.uri())).unwrap())
}

fn task() -> CaptchaTask {
    CaptchaTask::new(
        "6LcfNxMqAAAAAHb8",
        Url::parse("https://www.tks.ru/auto/calc/").unwrap(),
    )
}

#[tokio::test]
async fn solves_after_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/createTask"))
        .and(body_partial_json(json!({
            "clientKey": "CAP-test-key",
            "task": {
                "type": "ReCaptchaV2TaskProxyLess",
                "websiteURL": "https://www.tks.ru/auto/calc/",
                "websiteKey": "6LcfNxMqAAAAAHb8"
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "taskId": "task-77"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/getTaskResult"))
        .and(body_partial_json(json!({ "taskId": "task-77" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "status": "processing"
        })))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "status": "ready",
            "solution": { "gRecaptchaResponse": "03AFcWeA-solved" }
        })))
        .mount(&server)
        .await;

    let solution = provider(&server, Duration::from_secs(5)).solve(&task()).await.unwrap();
    assert_eq!(solution.token, "03AFcWeA-solved");
    assert_eq!(solution.metadata.get("task_id").map(String::as_str), Some("task-77"));
}

#[tokio::test]
async fn create_task_error_is_a_rejection() {
    let server = MockServer::start().await;
    Mock::given(path("/createTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 1,
            "errorCode": "ERROR_KEY_DENIED_ACCESS",
            "errorDescription": "Account authorization key not found in the system"
        })))
        .mount(&server)
        .await;

    let err = provider(&server, Duration::from_secs(5)).solve(&task()).await.unwrap_err();
    assert!(matches!(err, CaptchaError::Rejected(ref msg) if msg.contains("authorization key")));
}

#[tokio::test]
async fn slow_task_times_out() {
    let server = MockServer::start().await;
    Mock::given(path("/createTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "taskId": "task-slow"
        })))
        .mount(&server)
        .await;
    Mock::given(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "status": "processing"
        })))
        .mount(&server)
        .await;

    let err = provider(&server, Duration::from_millis(200))
        .solve(&task())
        .await
        .unwrap_err();
    assert!(matches!(err, CaptchaError::Timeout(timeout) if timeout == Duration::from_millis(200)));
}

#[tokio::test]
async fn polling_survives_server_hiccups() {
    let server = MockServer::start().await;
    Mock::given(path("/createTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "taskId": "task-9"
        })))
        .mount(&server)
        .await;
    Mock::given(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(path("/getTaskResult"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "status": "ready",
            "solution": { "gRecaptchaResponse": "tok-after-502" }
        })))
        .mount(&server)
        .await;

    let solution = provider(&server, Duration::from_secs(5)).solve(&task()).await.unwrap();
    assert_eq!(solution.token, "tok-after-502");
}

#[tokio::test]
async fn reports_balance() {
    let server = MockServer::start().await;
    Mock::given(path("/getBalance"))
        .and(body_partial_json(json!({ "clientKey": "CAP-test-key" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorId": 0,
            "balance": 12.5
        })))
        .mount(&server)
        .await;

    let balance = provider(&server, Duration::from_secs(5)).balance().await.unwrap();
    assert!((balance - 12.5).abs() < f64::EPSILON);
}
