//! HTTP seam shared by every remote collaborator.
//!
//! Components talk to the lock service, the Pages API and deployment URLs
//! through [`HttpClient`], so polling behaviour can be driven by a scripted
//! client in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ApiError, Error, Result};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds a bearer `Authorization` header.
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    /// Sets a JSON body and content type.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let encoded = serde_json::to_string(body)
            .map_err(|e| Error::Config(format!("failed to encode request body: {}", e)))?;
        self.body = Some(encoded);
        Ok(self.header("Content-Type", "application/json"))
    }

    /// Looks up a header value (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A fully-buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// Builds a response with the canonical reason phrase for `status`.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        let status_text = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string();
        Self {
            status,
            status_text,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parses the body as JSON, normalizing failures into an [`ApiError`].
    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|_| ApiError::from_response(self))
    }
}

/// Minimal asynchronous HTTP client.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and buffers the full response.
    ///
    /// Only transport-level failures are errors; any status code is `Ok`.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} {}: {}", request_label(request.method), request.url, e)))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

fn request_label(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
        Method::Patch => "PATCH",
        Method::Delete => "DELETE",
    }
}

/// Scripted [`HttpClient`] for tests.
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    enum Reply {
        Response(HttpResponse),
        TransportError(String),
    }

    #[derive(Debug)]
    struct Route {
        method: Method,
        suffix: String,
        replies: VecDeque<Reply>,
        fallback: Option<Reply>,
    }

    /// Replays queued replies per (method, URL suffix) and records requests.
    ///
    /// Routes are matched in registration order; a route with an empty queue
    /// answers with its fallback reply if one was set.
    #[derive(Debug, Default)]
    pub struct ScriptedClient {
        routes: Mutex<Vec<Route>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        pub fn new() -> Self {
            Self::default()
        }

        fn route_mut<R>(&self, method: Method, suffix: &str, f: impl FnOnce(&mut Route) -> R) -> R {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            let index = match routes
                .iter()
                .position(|r| r.method == method && r.suffix == suffix)
            {
                Some(index) => index,
                None => {
                    routes.push(Route {
                        method,
                        suffix: suffix.to_string(),
                        replies: VecDeque::new(),
                        fallback: None,
                    });
                    routes.len() - 1
                }
            };
            f(&mut routes[index])
        }

        /// Queues a response.
        pub fn push(&self, method: Method, suffix: &str, response: HttpResponse) -> &Self {
            self.route_mut(method, suffix, |r| r.replies.push_back(Reply::Response(response)));
            self
        }

        /// Queues a transport failure.
        pub fn push_error(&self, method: Method, suffix: &str, message: &str) -> &Self {
            self.route_mut(method, suffix, |r| {
                r.replies.push_back(Reply::TransportError(message.to_string()))
            });
            self
        }

        /// Sets the reply used once the queue for this route is drained.
        pub fn always(&self, method: Method, suffix: &str, response: HttpResponse) -> &Self {
            self.route_mut(method, suffix, |r| r.fallback = Some(Reply::Response(response)));
            self
        }

        /// All requests sent so far.
        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        /// Number of requests sent matching a method and URL suffix.
        pub fn count(&self, method: Method, suffix: &str) -> usize {
            self.requests()
                .iter()
                .filter(|r| r.method == method && r.url.ends_with(suffix))
                .count()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());

            let reply = {
                let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
                routes
                    .iter_mut()
                    .filter(|r| r.method == request.method && request.url.ends_with(&r.suffix))
                    .find_map(|r| r.replies.pop_front().or_else(|| r.fallback.clone()))
            };

            match reply {
                Some(Reply::Response(response)) => Ok(response),
                Some(Reply::TransportError(message)) => Err(Error::Transport(message)),
                None => Err(Error::Transport(format!(
                    "no scripted reply for {} {}",
                    request_label(request.method),
                    request.url
                ))),
            }
        }
    }
}
