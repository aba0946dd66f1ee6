use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{CaptchaConfig, CaptchaError, CaptchaResult, CaptchaSolution, CaptchaSolver, CaptchaTask};

const DEFAULT_BASE_URL: &str = "https://api.capsolver.com";

/// CapSolver adapter: `createTask` for a proxyless reCAPTCHA v2 task, then
/// `getTaskResult` polling until the task is ready.
#[derive(Clone)]
pub struct CapSolverProvider {
    api_key: String,
    base_url: Url,
    config: CaptchaConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    error_id: i64,
    error_description: Option<String>,
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    error_id: i64,
    error_description: Option<String>,
    status: Option<String>,
    solution: Option<TaskSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSolution {
    g_recaptcha_response: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    error_id: i64,
    error_description: Option<String>,
    balance: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultRequest<'a> {
    client_key: &'a str,
    task_id: &'a str,
}

impl CapSolverProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CaptchaError> {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Result<Self, CaptchaError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("CapSolver api key is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| CaptchaError::Configuration(err.to_string()))?;
        let base_url =
            Url::parse(DEFAULT_BASE_URL).map_err(|err| CaptchaError::Configuration(err.to_string()))?;
        Ok(Self {
            api_key,
            base_url,
            config,
            client,
        })
    }

    /// Point the adapter at a different API host (used against mock servers).
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    fn endpoint(&self, method: &str) -> Result<Url, CaptchaError> {
        self.base_url
            .join(method)
            .map_err(|err| CaptchaError::Configuration(err.to_string()))
    }

    async fn create_task(&self, task: &CaptchaTask) -> Result<String, CaptchaError> {
        let body = json!({
            "clientKey": self.api_key,
            "task": {
                "type": "ReCaptchaV2TaskProxyLess",
                "websiteURL": task.page_url.as_str(),
                "websiteKey": task.site_key,
            }
        });

        let response = self
            .client
            .post(self.endpoint("createTask")?)
            .json(&body)
            .send()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CaptchaError::Provider(format!(
                "createTask returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let created: CreateTaskResponse = response
            .json()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;

        if created.error_id != 0 {
            return Err(CaptchaError::Rejected(
                created
                    .error_description
                    .unwrap_or_else(|| format!("errorId {}", created.error_id)),
            ));
        }

        created
            .task_id
            .ok_or_else(|| CaptchaError::Provider("createTask returned no task id".into()))
    }

    async fn poll(&self, task_id: &str) -> CaptchaResult {
        let request = TaskResultRequest {
            client_key: &self.api_key,
            task_id,
        };
        let url = self.endpoint("getTaskResult")?;

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let response = match self.client.post(url.clone()).json(&request).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    log::debug!(
                        "getTaskResult for {task_id} returned HTTP {}",
                        response.status().as_u16()
                    );
                    continue;
                }
                Err(err) => {
                    log::debug!("getTaskResult for {task_id} failed: {err}");
                    continue;
                }
            };

            let result: TaskResultResponse = response
                .json()
                .await
                .map_err(|err| CaptchaError::Provider(err.to_string()))?;

            if result.error_id != 0 {
                return Err(CaptchaError::Rejected(
                    result
                        .error_description
                        .unwrap_or_else(|| format!("errorId {}", result.error_id)),
                ));
            }

            match result.status.as_deref() {
                Some("ready") => {
                    let token = result
                        .solution
                        .and_then(|solution| solution.g_recaptcha_response)
                        .ok_or_else(|| CaptchaError::Provider("ready task without a token".into()))?;
                    return Ok(CaptchaSolution::new(token).insert_metadata("task_id", task_id));
                }
                Some("processing") | Some("idle") => continue,
                other => {
                    return Err(CaptchaError::Rejected(format!(
                        "unexpected task status {}",
                        other.unwrap_or("<none>")
                    )));
                }
            }
        }
    }

    /// Remaining account balance in USD.
    pub async fn balance(&self) -> Result<f64, CaptchaError> {
        let response = self
            .client
            .post(self.endpoint("getBalance")?)
            .json(&json!({ "clientKey": self.api_key }))
            .send()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CaptchaError::Provider(format!(
                "getBalance returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let balance: BalanceResponse = response
            .json()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;
        if balance.error_id != 0 {
            return Err(CaptchaError::Rejected(
                balance.error_description.unwrap_or_default(),
            ));
        }
        Ok(balance.balance.unwrap_or(0.0))
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

impl fmt::Debug for CapSolverProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapSolverProvider")
            .field("base_url", &self.base_url.as_str())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl CaptchaSolver for CapSolverProvider {
    fn name(&self) -> &'static str {
        "capsolver"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        let started = tokio::time::Instant::now();
        let solve = async {
            let task_id = self.create_task(task).await?;
            log::info!("capsolver task {task_id} created");
            self.poll(&task_id).await
        };

        let solution = tokio::time::timeout(self.config.timeout, solve)
            .await
            .map_err(|_| CaptchaError::Timeout(self.config.timeout))??;
        log::info!("capsolver solved captcha in {:.1}s", started.elapsed().as_secs_f64());
        Ok(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_api_key() {
        assert!(matches!(
            CapSolverProvider::new("  "),
            Err(CaptchaError::Configuration(_))
        ));
    }

    #[test]
    fn debug_hides_api_key() {
        let provider = CapSolverProvider::new("CAP-SECRET").unwrap();
        assert!(!format!("{provider:?}").contains("CAP-SECRET"));
    }

    #[test]
    fn endpoints_join_base_url() {
        let provider = CapSolverProvider::new("key")
            .unwrap()
            .with_base_url(Url::parse("http://127.0.0.1:9000/").unwrap());
        assert_eq!(
            provider.endpoint("createTask").unwrap().as_str(),
            "http://127.0.0.1:9000/createTask"
        );
    }
}
