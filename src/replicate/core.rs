use std::time::Duration;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::ai::chat::Credential;

pub const DEFAULT_API_HOSTNAME: &str = "https://api.replicate.com";
pub const DEFAULT_MODEL: &str = "meta/meta-llama-3-8b-instruct";

#[derive(Debug, Error)]
pub enum ReplicateError {
    /// The service rejected the request or reported a failure while
    /// running the prediction.
    #[error("{0}")]
    Api(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("{0}")]
    Unexpected(String),
}

impl ReplicateError {
    /// The text shown to the user (and stored in the transcript) in
    /// place of a response.
    pub fn user_message(&self) -> String {
        match self {
            ReplicateError::Api(detail) => format!("Replicate API Error: {}", detail),
            other => format!(
                "Unexpected error: {}. Please check your connection and API token.",
                other
            ),
        }
    }
}

/// Text fragments in arrival order. The stream ends right after the
/// first `Err`.
pub type FragmentStream = BoxStream<'static, Result<String, ReplicateError>>;

/// Anything that can turn a prompt into a stream of completion
/// fragments. Every call issues a new request.
pub trait ResponseStreamer: Send + Sync {
    fn stream(&self, prompt: &str, credential: &Credential) -> FragmentStream;
}

// {
//   "detail": "You have exceeded your rate limit",
//   "status": 429,
//   "title": "Too Many Requests"
// }
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    detail: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    urls: PredictionUrls,
}

/// A single server-sent event. Only the fields Replicate uses are kept.
#[derive(Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Parse one event block (the text between blank lines). Returns
/// `None` for blocks without data or an event name, like comments
/// and keep-alives.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseEvent {
        // Unnamed events default to "message"
        event: event.unwrap_or("message").to_string(),
        data: data.join("\n"),
    })
}

// Position and length of the first blank line separating two events.
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn error_detail(data: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(data) {
        Ok(ApiErrorBody {
            detail: Some(detail),
            ..
        }) => detail,
        _ => data.to_string(),
    }
}

/// Streams completions from a model hosted on Replicate.
#[derive(Clone)]
pub struct ReplicateClient {
    client: reqwest::Client,
    api_hostname: String,
    model: String,
}

impl ReplicateClient {
    pub fn new(api_hostname: &str, model: &str) -> Result<Self, ReplicateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_hostname: api_hostname.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn predictions_url(&self) -> String {
        format!("{}/v1/models/{}/predictions", self.api_hostname, self.model)
    }

    async fn create_prediction(
        client: &reqwest::Client,
        url: &str,
        token: &str,
        prompt: &str,
    ) -> Result<Prediction, ReplicateError> {
        let payload = json!({
            "input": {"prompt": prompt},
            "stream": true,
        });
        let response = client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::warn!("Replicate returned {} creating prediction: {}", status, body);
            let parsed = serde_json::from_str::<ApiErrorBody>(&body).unwrap_or_default();
            let detail = parsed
                .detail
                .or(parsed.title)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| {
                    if body.trim().is_empty() {
                        status.to_string()
                    } else {
                        body.clone()
                    }
                });
            return Err(ReplicateError::Api(detail));
        }

        serde_json::from_str::<Prediction>(&body)
            .map_err(|e| ReplicateError::Decode(format!("{} in prediction {}", e, body)))
    }
}

impl ResponseStreamer for ReplicateClient {
    fn stream(&self, prompt: &str, credential: &Credential) -> FragmentStream {
        let client = self.client.clone();
        let url = self.predictions_url();
        let token = credential.token().to_string();
        let prompt = prompt.to_string();

        Box::pin(try_stream! {
            let prediction = Self::create_prediction(&client, &url, &token, &prompt).await?;
            tracing::debug!("Created prediction {}", prediction.id);

            let stream_url = prediction.urls.stream.ok_or_else(|| {
                ReplicateError::Api(format!(
                    "Prediction {} does not support streaming",
                    prediction.id
                ))
            })?;

            let response = client
                .get(&stream_url)
                .bearer_auth(&token)
                .header("Accept", "text/event-stream")
                .header("Cache-Control", "no-store")
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!("Replicate returned {} opening stream: {}", status, body);
                Err::<(), _>(ReplicateError::Api(error_detail(&body)))?;
                return;
            }

            let mut bytes = response.bytes_stream();
            // Buffer raw bytes since events (and UTF-8 sequences) can be
            // split across network chunks
            let mut buffer: Vec<u8> = Vec::new();

            'outer: loop {
                while let Some((end, sep)) = find_event_boundary(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..end + sep).collect();
                    let block = std::str::from_utf8(&raw[..end])
                        .map_err(|e| ReplicateError::Decode(e.to_string()))?;

                    let Some(event) = parse_event(block) else {
                        continue;
                    };
                    tracing::trace!("Stream event {}: {:?}", event.event, event.data);

                    match event.event.as_str() {
                        "output" => {
                            yield event.data;
                        }
                        "error" => {
                            Err::<(), _>(ReplicateError::Api(error_detail(&event.data)))?;
                        }
                        "done" => break 'outer,
                        other => tracing::debug!("Ignoring stream event {}", other),
                    }
                }

                match bytes.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    // A clean finish always ends with a done event
                    None => {
                        tracing::warn!(
                            "Stream closed before completion, {} bytes left unparsed",
                            buffer.len()
                        );
                        Err::<(), _>(ReplicateError::Unexpected(
                            "stream ended before completion".to_string(),
                        ))?;
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const TOKEN: &str = "r8_0123456789abcdefghijklmnopqrstuvwxyzA";

    fn prediction_body(server_url: &str) -> String {
        json!({
            "id": "abc123",
            "model": DEFAULT_MODEL,
            "status": "starting",
            "urls": {
                "stream": format!("{}/v1/streams/abc123", server_url),
                "get": format!("{}/v1/predictions/abc123", server_url),
                "cancel": format!("{}/v1/predictions/abc123/cancel", server_url),
            }
        })
        .to_string()
    }

    async fn collect(stream: FragmentStream) -> Vec<Result<String, ReplicateError>> {
        stream.collect().await
    }

    #[test]
    fn test_parse_event_output() {
        let event = parse_event("event: output\nid: 1\ndata: Hello").unwrap();
        assert_eq!(event.event, "output");
        assert_eq!(event.data, "Hello");
    }

    #[test]
    fn test_parse_event_keeps_leading_whitespace_after_first_space() {
        let event = parse_event("event: output\ndata:  world").unwrap();
        assert_eq!(event.data, " world");
    }

    #[test]
    fn test_parse_event_joins_multiline_data() {
        let event = parse_event("event: output\ndata: line one\ndata: line two").unwrap();
        assert_eq!(event.data, "line one\nline two");
    }

    #[test]
    fn test_parse_event_empty_data_line_is_a_newline() {
        let event = parse_event("event: output\ndata: \ndata: ").unwrap();
        assert_eq!(event.data, "\n");
    }

    #[test]
    fn test_parse_event_crlf() {
        let event = parse_event("event: done\r\ndata: {}\r").unwrap();
        assert_eq!(event.event, "done");
        assert_eq!(event.data, "{}");
    }

    #[test]
    fn test_parse_event_comment_only() {
        assert_eq!(parse_event(": keep-alive"), None);
        assert_eq!(parse_event(""), None);
    }

    #[test]
    fn test_parse_event_defaults_to_message() {
        let event = parse_event("data: x").unwrap();
        assert_eq!(event.event, "message");
    }

    #[test]
    fn test_find_event_boundary() {
        assert_eq!(find_event_boundary(b"a\n\nb"), Some((1, 2)));
        assert_eq!(find_event_boundary(b"a\r\n\r\nb"), Some((1, 4)));
        assert_eq!(find_event_boundary(b"a\nb"), None);
    }

    #[test]
    fn test_user_message_for_api_error() {
        let err = ReplicateError::Api("rate limit".to_string());
        assert_eq!(err.user_message(), "Replicate API Error: rate limit");
    }

    #[test]
    fn test_user_message_for_other_errors() {
        let err = ReplicateError::Unexpected("boom".to_string());
        assert_eq!(
            err.user_message(),
            "Unexpected error: boom. Please check your connection and API token."
        );
    }

    #[test]
    fn test_predictions_url() {
        let client =
            ReplicateClient::new("https://api.replicate.com/", DEFAULT_MODEL).unwrap();
        assert_eq!(
            client.predictions_url(),
            "https://api.replicate.com/v1/models/meta/meta-llama-3-8b-instruct/predictions"
        );
    }

    #[tokio::test]
    async fn test_stream_output_events() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .match_header("authorization", format!("Bearer {}", TOKEN).as_str())
            .match_body(mockito::Matcher::Json(json!({
                "input": {"prompt": "System: S\n\nAssistant: "},
                "stream": true,
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(prediction_body(&url))
            .create_async()
            .await;

        let sse_response = "event: output\nid: 1\ndata: Hel\n\nevent: output\nid: 2\ndata: lo\n\nevent: output\nid: 3\ndata: !\n\nevent: done\ndata: {}\n\n";
        let stream = server
            .mock("GET", "/v1/streams/abc123")
            .match_header("accept", "text/event-stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_response)
            .create_async()
            .await;

        let client = ReplicateClient::new(&url, DEFAULT_MODEL).unwrap();
        let results = collect(client.stream(
            "System: S\n\nAssistant: ",
            &Credential::interactive(TOKEN),
        ))
        .await;

        create.assert_async().await;
        stream.assert_async().await;

        let fragments: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(fragments, vec!["Hel", "lo", "!"]);
    }

    #[tokio::test]
    async fn test_stream_multiline_output() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let _create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .with_status(201)
            .with_body(prediction_body(&url))
            .create_async()
            .await;
        let _stream = server
            .mock("GET", "/v1/streams/abc123")
            .with_status(200)
            .with_body("event: output\r\ndata: a\r\ndata: b\r\n\r\n: ping\n\nevent: done\ndata: {}\n\n")
            .create_async()
            .await;

        let client = ReplicateClient::new(&url, DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;
        let fragments: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(fragments, vec!["a\nb"]);
    }

    #[tokio::test]
    async fn test_stream_error_response_on_create() {
        let mut server = mockito::Server::new_async().await;

        let _create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .with_status(429)
            .with_header("content-type", "application/problem+json")
            .with_body(r#"{"title":"Too Many Requests","detail":"rate limit","status":429}"#)
            .create_async()
            .await;

        let client = ReplicateClient::new(&server.url(), DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(err) => {
                assert!(matches!(err, ReplicateError::Api(detail) if detail == "rate limit"));
                assert_eq!(err.user_message(), "Replicate API Error: rate limit");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_error_response_without_json_body() {
        let mut server = mockito::Server::new_async().await;

        let _create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .with_status(401)
            .create_async()
            .await;

        let client = ReplicateClient::new(&server.url(), DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(ReplicateError::Api(detail)) => assert!(detail.contains("401")),
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_error_event_terminates() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let _create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .with_status(201)
            .with_body(prediction_body(&url))
            .create_async()
            .await;
        let _stream = server
            .mock("GET", "/v1/streams/abc123")
            .with_status(200)
            .with_body("event: output\ndata: partial\n\nevent: error\ndata: {\"detail\":\"model crashed\"}\n\nevent: output\ndata: never\n\n")
            .create_async()
            .await;

        let client = ReplicateClient::new(&url, DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "partial");
        match &results[1] {
            Err(ReplicateError::Api(detail)) => assert_eq!(detail, "model crashed"),
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_closed_before_done() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let _create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .with_status(201)
            .with_body(prediction_body(&url))
            .create_async()
            .await;
        let _stream = server
            .mock("GET", "/v1/streams/abc123")
            .with_status(200)
            .with_body("event: output\ndata: Hel\n\nevent: output\ndata: lo")
            .create_async()
            .await;

        let client = ReplicateClient::new(&url, DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "Hel");
        match &results[1] {
            Err(err) => {
                assert!(matches!(err, ReplicateError::Unexpected(_)));
                assert_eq!(
                    err.user_message(),
                    "Unexpected error: stream ended before completion. Please check your connection and API token."
                );
            }
            other => panic!("Expected Unexpected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_missing_stream_url() {
        let mut server = mockito::Server::new_async().await;

        let _create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .with_status(201)
            .with_body(r#"{"id":"abc123","urls":{}}"#)
            .create_async()
            .await;

        let client = ReplicateClient::new(&server.url(), DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;

        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], Err(ReplicateError::Api(_))));
    }

    #[tokio::test]
    async fn test_stream_malformed_prediction() {
        let mut server = mockito::Server::new_async().await;

        let _create = server
            .mock("POST", "/v1/models/meta/meta-llama-3-8b-instruct/predictions")
            .with_status(201)
            .with_body("not json")
            .create_async()
            .await;

        let client = ReplicateClient::new(&server.url(), DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(err) => {
                assert!(matches!(err, ReplicateError::Decode(_)));
                assert!(err.user_message().starts_with("Unexpected error: "));
            }
            other => panic!("Expected Decode error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_connection_refused() {
        // Nothing listens on port 9 on the loopback interface
        let client = ReplicateClient::new("http://127.0.0.1:9", DEFAULT_MODEL).unwrap();
        let results = collect(client.stream("p", &Credential::interactive(TOKEN))).await;

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(err) => {
                assert!(matches!(err, ReplicateError::Http(_)));
                assert!(err.user_message().starts_with("Unexpected error: "));
            }
            other => panic!("Expected Http error, got {:?}", other),
        }
    }
}
