//! HTTP handshake: trade an access token for a one-time session endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use slackline_core::ConnectError;

use crate::error::ClientError;
use crate::resolver::{ReqwestResolver, Resolver};

const TOKEN_PARAM: &str = "token";

/// Parsed handshake body: the session endpoint to upgrade against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeResult {
    pub url: String,
}

impl HandshakeResult {
    /// Parse a complete handshake body.
    ///
    /// The body must be JSON with a `url` naming an absolute `ws`/`wss`
    /// endpoint; anything else is a [`ConnectError::MalformedHandshakeResponse`].
    pub fn from_body(body: &[u8]) -> Result<Self, ConnectError> {
        #[derive(Deserialize)]
        struct Body {
            ok: Option<bool>,
            error: Option<String>,
            url: Option<String>,
        }

        let parsed: Body = serde_json::from_slice(body).map_err(|e| {
            ConnectError::MalformedHandshakeResponse(format!("body is not valid JSON: {e}"))
        })?;

        let Some(url) = parsed.url else {
            let reason = match (parsed.ok, parsed.error) {
                (Some(false), Some(code)) => format!("handshake rejected: {code}"),
                _ => "response has no `url` field".to_string(),
            };
            return Err(ConnectError::MalformedHandshakeResponse(reason));
        };

        let endpoint = Url::parse(&url).map_err(|e| {
            ConnectError::MalformedHandshakeResponse(format!("invalid session url `{url}`: {e}"))
        })?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(ConnectError::MalformedHandshakeResponse(format!(
                "session url `{url}` is not a websocket url"
            )));
        }
        Ok(Self { url })
    }
}

/// Collects one handshake response body chunk by chunk, in arrival order.
///
/// Owned by a single handshake and dropped with it.
#[derive(Debug)]
pub struct ResponseAccumulator {
    buf: BytesMut,
    chunks: usize,
    limit: usize,
}

impl ResponseAccumulator {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            chunks: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), ConnectError> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(ConnectError::MalformedHandshakeResponse(format!(
                "response body exceeds {} bytes",
                self.limit
            )));
        }
        self.buf.extend_from_slice(chunk);
        self.chunks += 1;
        Ok(())
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Exchanges an access token for a session endpoint.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn request_session_endpoint(
        &self,
        token: &SecretString,
        cancel: &CancellationToken,
    ) -> Result<HandshakeResult, ConnectError>;
}

/// reqwest-backed [`Handshake`] against a fixed endpoint.
pub struct HandshakeClient {
    client: Client,
    endpoint: Url,
    max_body: usize,
}

impl HandshakeClient {
    pub fn new(
        endpoint: &str,
        resolver: Arc<dyn Resolver>,
        connect_timeout: Duration,
        max_body: usize,
    ) -> Result<Self, ClientError> {
        let endpoint = Url::parse(endpoint).map_err(|e| ClientError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ClientError::InvalidEndpoint {
                url: endpoint.to_string(),
                reason: "scheme must be http or https".into(),
            });
        }
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .dns_resolver(Arc::new(ReqwestResolver(resolver)))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            max_body,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Handshake URL with the token attached. Never log the result.
    fn request_url(&self, token: &SecretString) -> Url {
        let mut url = self.endpoint.clone();
        let _ = url
            .query_pairs_mut()
            .append_pair(TOKEN_PARAM, token.expose_secret());
        url
    }

    async fn exchange(&self, token: &SecretString) -> Result<HandshakeResult, ConnectError> {
        let resp = self
            .client
            .get(self.request_url(token))
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| ConnectError::transport(&e.without_url()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ConnectError::ConnectionAttemptFailed(format!(
                "handshake endpoint returned {status}"
            )));
        }

        let mut body = ResponseAccumulator::new(self.max_body);
        let mut chunks = resp.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| ConnectError::transport(&e.without_url()))?;
            body.push(&chunk)?;
        }
        debug!(bytes = body.len(), chunks = body.chunks(), "handshake body received");

        HandshakeResult::from_body(&body.finish())
    }
}

#[async_trait]
impl Handshake for HandshakeClient {
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn request_session_endpoint(
        &self,
        token: &SecretString,
        cancel: &CancellationToken,
    ) -> Result<HandshakeResult, ConnectError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = self.exchange(token) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::SystemResolver;
    use slackline_core::ConnectErrorKind;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MAX_BODY: usize = 1024 * 1024;

    fn client_for(server: &MockServer) -> HandshakeClient {
        HandshakeClient::new(
            &format!("{}/api/rtm.connect", server.uri()),
            Arc::new(SystemResolver),
            Duration::from_secs(5),
            MAX_BODY,
        )
        .unwrap()
    }

    fn token(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn parses_url_field() {
        let result = HandshakeResult::from_body(br#"{"ok":true,"url":"wss://example/session/abc"}"#).unwrap();
        assert_eq!(result.url, "wss://example/session/abc");
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = HandshakeResult::from_body(b"<html>").unwrap_err();
        assert_eq!(err.kind(), ConnectErrorKind::MalformedHandshakeResponse);
    }

    #[test]
    fn missing_url_is_malformed() {
        let err = HandshakeResult::from_body(br#"{"ok":true}"#).unwrap_err();
        assert_eq!(
            err,
            ConnectError::MalformedHandshakeResponse("response has no `url` field".into())
        );
    }

    #[test]
    fn rejection_reports_service_error() {
        let err = HandshakeResult::from_body(br#"{"ok":false,"error":"invalid_auth"}"#).unwrap_err();
        assert_eq!(
            err,
            ConnectError::MalformedHandshakeResponse("handshake rejected: invalid_auth".into())
        );
    }

    #[test]
    fn non_websocket_url_is_malformed() {
        let err = HandshakeResult::from_body(br#"{"url":"https://example/x"}"#).unwrap_err();
        assert_eq!(err.kind(), ConnectErrorKind::MalformedHandshakeResponse);
        let err = HandshakeResult::from_body(br#"{"url":"not a url"}"#).unwrap_err();
        assert_eq!(err.kind(), ConnectErrorKind::MalformedHandshakeResponse);
    }

    #[test]
    fn accumulator_concatenates_in_order() {
        let mut acc = ResponseAccumulator::new(64);
        acc.push(br#"{"url":"#).unwrap();
        acc.push(br#""wss://h/ws""#).unwrap();
        acc.push(b"}").unwrap();
        assert_eq!(acc.chunks(), 3);
        let body = acc.finish();
        assert_eq!(HandshakeResult::from_body(&body).unwrap().url, "wss://h/ws");
    }

    #[test]
    fn accumulator_enforces_limit() {
        let mut acc = ResponseAccumulator::new(4);
        acc.push(b"abcd").unwrap();
        let err = acc.push(b"e").unwrap_err();
        assert_eq!(err.kind(), ConnectErrorKind::MalformedHandshakeResponse);
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let result = HandshakeClient::new(
            "ftp://example.com/rtm",
            Arc::new(SystemResolver),
            Duration::from_secs(1),
            MAX_BODY,
        );
        assert!(matches!(result, Err(ClientError::InvalidEndpoint { .. })));
    }

    #[test]
    fn token_goes_in_query_string() {
        let client = HandshakeClient::new(
            "https://slack.com/api/rtm.connect",
            Arc::new(SystemResolver),
            Duration::from_secs(1),
            MAX_BODY,
        )
        .unwrap();
        let url = client.request_url(&token("T1"));
        assert_eq!(url.as_str(), "https://slack.com/api/rtm.connect?token=T1");
    }

    #[tokio::test]
    async fn successful_handshake() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rtm.connect"))
            .and(query_param("token", "T1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "ok": true,
                    "url": "wss://host/ws"
                })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server)
            .request_session_endpoint(&token("T1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.url, "wss://host/ws");
    }

    #[tokio::test]
    async fn invalid_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .request_session_endpoint(&token("T1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ConnectErrorKind::MalformedHandshakeResponse);
    }

    #[tokio::test]
    async fn server_error_is_connection_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .request_session_endpoint(&token("T1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ConnectErrorKind::ConnectionAttemptFailed);
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn refused_connection_is_connection_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HandshakeClient::new(
            &format!("http://127.0.0.1:{port}/api/rtm.connect"),
            Arc::new(SystemResolver),
            Duration::from_secs(5),
            MAX_BODY,
        )
        .unwrap();
        let err = client
            .request_session_endpoint(&token("secret-token"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ConnectErrorKind::ConnectionAttemptFailed);
        assert!(!err.to_string().contains("secret-token"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_handshake() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"url": "wss://host/ws"}))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client_for(&server)
            .request_session_endpoint(&token("T1"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::Cancelled);
    }
}
