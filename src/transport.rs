use std::{collections::HashMap, sync::OnceLock, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::{Url, form_urlencoded};

/// Step between samples requested from the metrics endpoint.
pub const STEP_SECONDS: i64 = 15;

/// One outbound call: every merged field of a group, already serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkCall {
    pub name: String,
    pub fields: Vec<String>,
    pub params: String,
    pub host_name: String,
}

/// Failure of a single call. Shared as-is with every subscriber of the group.
#[derive(Debug, Clone, Error)]
#[error("{status_text}: {cause}")]
pub struct TransportError {
    pub status: Option<u16>,
    pub status_text: String,
    pub cause: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, status_text: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            cause: cause.into(),
        }
    }

    /// `"503 error"` when the server answered, plain `"timeout"` otherwise.
    pub fn status_line(&self) -> String {
        match self.status {
            Some(code) => format!("{} {}", code, self.status_text),
            None => self.status_text.clone(),
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        let text = if e.is_timeout() { "timeout" } else { "error" };
        Self::new(e.status().map(|s| s.as_u16()), text, e.to_string())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, call: BulkCall) -> Result<Value, TransportError>;
}

// Each field gets the same window: name[from,to,step], comma-joined.
pub fn format_fields(fields: &[String], to_seconds: i64, time_unit_seconds: u64) -> String {
    let from_seconds = to_seconds - time_unit_seconds as i64;
    fields
        .iter()
        .map(|f| format!("{}[{},{},{}]", f, from_seconds, to_seconds, STEP_SECONDS))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    endpoints: HashMap<String, String>,
    auth: Option<(String, String)>,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        endpoints: HashMap<String, String>,
        auth: Option<(String, String)>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        let base_url = Url::parse(base_url).with_context(|| format!("parse base url {}", base_url))?;

        Ok(Self {
            client,
            base_url,
            endpoints,
            auth,
        })
    }

    /// Fills `{fields}` and `{hostName}` in the endpoint template for `call.name`.
    ///
    /// The host name is percent-encoded so it always stays a single path segment.
    pub fn resolve(&self, call: &BulkCall) -> Result<Url, TransportError> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("regex compiles"));

        let template = self.endpoints.get(&call.name).ok_or_else(|| {
            TransportError::new(None, "error", format!("no endpoint configured for request `{}`", call.name))
        })?;

        let mut unresolved = None;
        let path = re.replace_all(template, |caps: &Captures| match &caps[1] {
            "fields" => call.params.clone(),
            "hostName" => form_urlencoded::byte_serialize(call.host_name.as_bytes()).collect(),
            other => {
                unresolved.get_or_insert_with(|| other.to_string());
                caps[0].to_string()
            }
        });
        if let Some(name) = unresolved {
            return Err(TransportError::new(
                None,
                "error",
                format!("unresolved placeholder `{{{}}}` in endpoint `{}`", name, call.name),
            ));
        }

        let full = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path);
        Url::parse(&full).map_err(|e| TransportError::new(None, "error", format!("bad url {}: {}", full, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: BulkCall) -> Result<Value, TransportError> {
        let url = self.resolve(&call)?;
        debug!(name = %call.name, %url, "sending bulk call");

        let mut req = self.client.get(url);
        if let Some((user, password)) = &self.auth {
            req = req.basic_auth(user, Some(password));
        }

        let resp = req.send().await.map_err(TransportError::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unexpected status");
            return Err(TransportError::new(Some(status.as_u16()), "error", reason));
        }

        let body = resp.text().await.map_err(TransportError::from_reqwest)?;
        serde_json::from_str(&body)
            .map_err(|e| TransportError::new(Some(status.as_u16()), "parsererror", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        let endpoints = HashMap::from([
            ("host_metrics".to_string(), "/hosts/{hostName}?fields={fields}".to_string()),
            ("cluster_metrics".to_string(), "/?fields={fields}".to_string()),
            ("broken".to_string(), "/services/{serviceName}?fields={fields}".to_string()),
        ]);
        HttpTransport::new("http://ambari.local:8080/api/v1/clusters/c1/", endpoints, None).unwrap()
    }

    fn call(name: &str, params: &str, host: &str) -> BulkCall {
        BulkCall {
            name: name.to_string(),
            fields: vec![],
            params: params.to_string(),
            host_name: host.to_string(),
        }
    }

    #[test]
    fn format_fields_appends_the_same_window_to_every_field() {
        let fields = vec!["metrics/cpu/cpu_user".to_string(), "metrics/memory/mem_free".to_string()];
        let out = format_fields(&fields, 10_000, 3600);
        assert_eq!(
            out,
            "metrics/cpu/cpu_user[6400,10000,15],metrics/memory/mem_free[6400,10000,15]"
        );
    }

    #[test]
    fn format_fields_of_nothing_is_empty() {
        assert_eq!(format_fields(&[], 100, 60), "");
    }

    #[test]
    fn resolve_fills_host_and_fields() {
        let url = transport()
            .resolve(&call("host_metrics", "metrics/cpu[1,2,15]", "node1"))
            .unwrap();
        assert_eq!(url.host_str(), Some("ambari.local"));
        assert_eq!(url.path(), "/api/v1/clusters/c1/hosts/node1");
        assert!(url.query().unwrap().starts_with("fields=metrics/cpu"));
    }

    #[test]
    fn resolve_keeps_host_inside_its_segment() {
        let url = transport()
            .resolve(&call("host_metrics", "metrics/cpu[1,2,15]", "evil/../x?y#z"))
            .unwrap();
        assert_eq!(url.path(), "/api/v1/clusters/c1/hosts/evil%2F..%2Fx%3Fy%23z");
        assert!(url.query().unwrap().starts_with("fields=metrics/cpu"));
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn resolve_accepts_empty_host() {
        let url = transport().resolve(&call("cluster_metrics", "a[1,2,15]", "")).unwrap();
        assert_eq!(url.path(), "/api/v1/clusters/c1/");
    }

    #[test]
    fn resolve_unknown_endpoint_is_an_error() {
        let err = transport().resolve(&call("nope", "", "")).unwrap_err();
        assert_eq!(err.status, None);
        assert!(err.cause.contains("nope"));
    }

    #[test]
    fn resolve_rejects_unknown_placeholders() {
        let err = transport().resolve(&call("broken", "a", "")).unwrap_err();
        assert!(err.cause.contains("{serviceName}"));
    }

    #[test]
    fn status_line_prefixes_code_when_present() {
        assert_eq!(TransportError::new(Some(503), "error", "x").status_line(), "503 error");
        assert_eq!(TransportError::new(None, "timeout", "x").status_line(), "timeout");
    }
    mod http {
        use super::*;
        use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::get};
        use serde_json::json;

        async fn metrics() -> Json<Value> {
            Json(json!({"metrics": {"cpu": {"cpu_user": [[1.5, 100]]}}}))
        }

        async fn down() -> StatusCode {
            StatusCode::SERVICE_UNAVAILABLE
        }

        async fn garbage() -> &'static str {
            "<html>not json</html>"
        }

        async fn whoami(headers: HeaderMap) -> Json<Value> {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            Json(json!({ "authorization": auth }))
        }

        async fn start(auth: Option<(String, String)>) -> HttpTransport {
            let app = Router::new()
                .route("/metrics", get(metrics))
                .route("/down", get(down))
                .route("/garbage", get(garbage))
                .route("/whoami", get(whoami));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            let endpoints = HashMap::from([
                ("ok".to_string(), "/metrics?fields={fields}".to_string()),
                ("down".to_string(), "/down?fields={fields}".to_string()),
                ("garbage".to_string(), "/garbage?fields={fields}".to_string()),
                ("whoami".to_string(), "/whoami?fields={fields}".to_string()),
            ]);
            HttpTransport::new(&format!("http://{}", addr), endpoints, auth).unwrap()
        }

        fn bulk(name: &str) -> BulkCall {
            BulkCall {
                name: name.to_string(),
                fields: vec!["metrics/cpu/cpu_user".to_string()],
                params: "metrics/cpu/cpu_user[0,3600,15]".to_string(),
                host_name: String::new(),
            }
        }

        #[tokio::test]
        async fn success_decodes_the_body() {
            let t = start(None).await;
            let v = t.send(bulk("ok")).await.unwrap();
            assert_eq!(v["metrics"]["cpu"]["cpu_user"], json!([[1.5, 100]]));
        }

        #[tokio::test]
        async fn non_success_status_is_an_error_with_code() {
            let t = start(None).await;
            let err = t.send(bulk("down")).await.unwrap_err();
            assert_eq!(err.status, Some(503));
            assert_eq!(err.status_text, "error");
            assert_eq!(err.status_line(), "503 error");
        }

        #[tokio::test]
        async fn body_that_is_not_json_is_a_parse_error() {
            let t = start(None).await;
            let err = t.send(bulk("garbage")).await.unwrap_err();
            assert_eq!(err.status, Some(200));
            assert_eq!(err.status_text, "parsererror");
        }

        #[tokio::test]
        async fn basic_auth_is_sent_when_configured() {
            let t = start(Some(("admin".to_string(), "secret".to_string()))).await;
            let v = t.send(bulk("whoami")).await.unwrap();
            assert_eq!(v["authorization"], "Basic YWRtaW46c2VjcmV0");

            let t = start(None).await;
            let v = t.send(bulk("whoami")).await.unwrap();
            assert_eq!(v["authorization"], "");
        }

        #[tokio::test]
        async fn unknown_request_fails_before_any_io() {
            let t = start(None).await;
            let err = t.send(bulk("missing")).await.unwrap_err();
            assert_eq!(err.status, None);
            assert_eq!(err.status_text, "error");
        }
    }
}
