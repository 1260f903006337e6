//! Flowise adapter: the HTTP classification backend.
//!
//! `POST {base}/api/v1/prediction/{chatflow_id}` with the payload from
//! [`adg_core::classify::build_payload`]. One attempt, no retry; every
//! failure becomes a [`ClassifyError`] so the guard can persist a reason.

use std::time::Duration;

use adg_core::{
    classify::{build_payload, parse_response, Classifier, ClassifyError, ClassifyRequest, Verdict},
    config::Config,
    errors::Error,
    Result,
};
use async_trait::async_trait;

/// Response bodies are logged up to this many bytes on non-2xx.
const ERROR_BODY_LOG_BYTES: usize = 800;

#[derive(Clone, Debug)]
pub struct FlowiseClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl FlowiseClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|e| Error::Config(format!("flowise http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            http,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            cfg.flowise_base_url.clone(),
            cfg.flowise_api_key.clone(),
            cfg.flowise_connect_timeout,
            cfg.flowise_read_timeout,
        )
    }

    pub fn endpoint(&self, chatflow_id: &str) -> String {
        format!("{}/api/v1/prediction/{}", self.base_url, chatflow_id.trim())
    }
}

#[async_trait]
impl Classifier for FlowiseClient {
    async fn classify(&self, req: &ClassifyRequest) -> std::result::Result<Verdict, ClassifyError> {
        if self.base_url.is_empty() || req.chatflow_id.trim().is_empty() {
            return Err(ClassifyError::MissingConfig);
        }

        let mut call = self
            .http
            .post(self.endpoint(&req.chatflow_id))
            .json(&build_payload(req));
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let resp = call.send().await.map_err(|e| {
            tracing::warn!(chat_id = req.chat_id.0, error = %e, "flowise request failed");
            ClassifyError::Transport(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(
                chat_id = req.chat_id.0,
                %status,
                body = %clip_bytes(&body, ERROR_BODY_LOG_BYTES),
                "flowise returned an error"
            );
            return Err(ClassifyError::Transport(format!("http status {}", status.as_u16())));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ClassifyError::Transport(format!("invalid json body: {e}")))?;
        parse_response(&data)
    }
}

/// Longest prefix of `s` within `max` bytes, on a char boundary.
fn clip_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use adg_core::domain::{ChatId, Label};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(base: &str, key: Option<&str>) -> FlowiseClient {
        FlowiseClient::new(
            base,
            key.map(str::to_string),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn request(chatflow: &str) -> ClassifyRequest {
        ClassifyRequest {
            chat_id: ChatId(-100),
            chatflow_id: chatflow.into(),
            text: "cheap phones, dm me".into(),
            examples: String::new(),
            is_reply: false,
            has_contact: false,
        }
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let c = client("http://flowise.local/", None);
        assert_eq!(
            c.endpoint("abc"),
            "http://flowise.local/api/v1/prediction/abc"
        );
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip_bytes("héllo", 2), "h");
        assert_eq!(clip_bytes("abc", 10), "abc");
    }

    #[tokio::test]
    async fn missing_chatflow_is_reported_without_a_call() {
        let c = client("http://127.0.0.1:9", None);
        assert_eq!(
            c.classify(&request("")).await,
            Err(ClassifyError::MissingConfig)
        );
    }

    #[tokio::test]
    async fn posts_payload_with_bearer_and_parses_fenced_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/prediction/flow-1"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "question": "",
                "overrideConfig": {"sessionId": "ads_-100"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "```json\n{\"label\":\"AD\",\"score\":0.9}\n```"
            })))
            .mount(&server)
            .await;

        let c = client(&server.uri(), Some("secret"));
        let verdict = c.classify(&request("flow-1")).await.unwrap();
        assert_eq!(verdict.label, Some(Label::Ad));
        assert_eq!(verdict.score, Some(0.9));
    }

    #[tokio::test]
    async fn non_success_status_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let c = client(&server.uri(), None);
        assert_eq!(
            c.classify(&request("flow-1")).await,
            Err(ClassifyError::Transport("http status 502".into()))
        );
    }
}
