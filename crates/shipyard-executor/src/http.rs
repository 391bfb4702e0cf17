//! Remote build executor reached over HTTP.

use async_trait::async_trait;
use reqwest::StatusCode;
use shipyard_core::executor::{BuildExecutor, StageKind, StageOutput, StageRequest};
use shipyard_core::{Error, Result};
use tracing::{debug, info};
use url::Url;

/// Posts each [`StageRequest`] to `{base}/execute` and expects a
/// [`StageOutput`] back.
///
/// Client errors (4xx) are final: the request or the repository is wrong and
/// resending it cannot help. Everything else is reported as retryable.
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpExecutor {
    pub fn new(base_url: &Url) -> Result<Self> {
        Ok(Self::with_client(reqwest::Client::new(), execute_url(base_url)?))
    }

    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl BuildExecutor for HttpExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, request: StageRequest) -> Result<StageOutput> {
        let kind = request.kind.name();
        info!(pipeline_id = %request.pipeline_id, kind, endpoint = %self.endpoint, "Dispatching to executor");

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("User-Agent", "Shipyard")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("executor unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(&request.kind, status, &text));
        }

        let output: StageOutput = response
            .json()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("invalid executor response: {}", e)))?;

        debug!(pipeline_id = %request.pipeline_id, kind, artifact = %output.artifact.location, "Executor finished");
        Ok(output)
    }
}

fn execute_url(base: &Url) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join("execute")
        .map_err(|e| Error::InvalidInput(format!("invalid executor url: {}", e)))
}

fn classify_failure(kind: &StageKind, status: StatusCode, body: &str) -> Error {
    let message = format!("executor returned {} for {}: {}", status, kind.name(), body.trim());
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        s if s.is_client_error()
            && s != StatusCode::REQUEST_TIMEOUT
            && s != StatusCode::TOO_MANY_REQUESTS =>
        {
            Error::InvalidInput(message)
        }
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => Error::Timeout(message),
        _ => match kind {
            StageKind::Deploy { .. } => Error::DeploymentFailed(message),
            _ => Error::ExecutionFailed(message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use shipyard_core::executor::ArtifactRef;

    fn deploy_kind() -> StageKind {
        StageKind::Deploy {
            artifact: ArtifactRef {
                name: "dist".to_string(),
                location: "s3://artifacts/dist".to_string(),
                size: Some(42),
                created_at: Utc::now(),
            },
        }
    }

    #[rstest]
    #[case("http://executor:8080", "http://executor:8080/execute")]
    #[case("http://executor:8080/", "http://executor:8080/execute")]
    #[case("http://gateway/exec/v1", "http://gateway/exec/v1/execute")]
    fn test_execute_url(#[case] base: &str, #[case] expected: &str) {
        let url = execute_url(&base.parse().unwrap()).unwrap();
        assert_eq!(url.as_str(), expected);
    }

    #[rstest]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, true)]
    #[case(StatusCode::BAD_REQUEST, true)]
    #[case(StatusCode::NOT_FOUND, true)]
    #[case(StatusCode::TOO_MANY_REQUESTS, false)]
    #[case(StatusCode::REQUEST_TIMEOUT, false)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, false)]
    #[case(StatusCode::BAD_GATEWAY, false)]
    #[case(StatusCode::GATEWAY_TIMEOUT, false)]
    fn test_client_errors_are_permanent(#[case] status: StatusCode, #[case] permanent: bool) {
        let kind = StageKind::Validate {
            required_files: vec!["package.json".to_string()],
        };
        let err = classify_failure(&kind, status, "missing package.json\n");
        assert_eq!(err.is_permanent(), permanent);
    }

    #[test]
    fn test_deploy_server_error_is_deployment_failure() {
        let err = classify_failure(&deploy_kind(), StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert!(matches!(err, Error::DeploymentFailed(_)));
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("deploy"));
    }
}
