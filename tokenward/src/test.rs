//! Fixtures and a scripted authority for tests

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use reqwest::{header::HeaderMap, Method, Request, Response, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next, Result};
use serde_json::json;

use crate::dpop::ProofKey;

pub(crate) fn ec_p256_key() -> ProofKey {
    ProofKey::from_jwk(include_str!("../data/ec-p256.json")).unwrap()
}

pub(crate) fn ec_p384_key() -> ProofKey {
    ProofKey::from_jwk(include_str!("../data/ec-p384.json")).unwrap()
}

pub(crate) fn rsa_key() -> ProofKey {
    ProofKey::from_jwk(include_str!("../data/rsa.json")).unwrap()
}

pub(crate) fn token_endpoint() -> Url {
    Url::parse("https://issuer.example.com/connect/token").unwrap()
}

pub(crate) fn revocation_endpoint() -> Url {
    Url::parse("https://issuer.example.com/connect/revocation").unwrap()
}

/// A canned response
#[derive(Clone, Debug)]
pub(crate) struct StubResponse {
    status: u16,
    body: String,
    headers: Vec<(&'static str, String)>,
}

impl StubResponse {
    pub(crate) fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: vec![("content-type", "application/json".to_owned())],
        }
    }

    pub(crate) fn token(access_token: &str, expires_in: u64) -> Self {
        Self::json(
            200,
            json!({
                "access_token": access_token,
                "token_type": "Bearer",
                "expires_in": expires_in,
            }),
        )
    }

    pub(crate) fn error(status: u16, error: &str) -> Self {
        Self::json(status, json!({ "error": error }))
    }

    pub(crate) fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_owned(),
            headers: Vec::new(),
        }
    }

    pub(crate) fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_owned()));
        self
    }

    fn into_response(self) -> Response {
        let mut builder = http::Response::builder().status(self.status);
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        builder.body(self.body.into_bytes()).unwrap().into()
    }
}

/// A request received by the stub
#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) form: BTreeMap<String, String>,
}

impl RecordedRequest {
    pub(crate) fn form(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A middleware that answers every request itself
///
/// Responses are served in order; the last one is repeated once the script
/// runs out.
#[derive(Debug, Default)]
pub(crate) struct StubAuthority {
    script: Mutex<VecDeque<StubResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl StubAuthority {
    pub(crate) fn new(script: impl IntoIterator<Item = StubResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    pub(crate) fn slow(script: impl IntoIterator<Item = StubResponse>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub(crate) fn client(self: &Arc<Self>) -> ClientWithMiddleware {
        ClientBuilder::new(reqwest::Client::new())
            .with_arc(Arc::clone(self) as Arc<dyn Middleware>)
            .build()
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_response(&self) -> StubResponse {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| StubResponse::text(500, "no scripted response"))
        }
    }
}

#[async_trait::async_trait]
impl Middleware for StubAuthority {
    async fn handle(
        &self,
        req: Request,
        _: &mut http::Extensions,
        _: Next<'_>,
    ) -> Result<Response> {
        let form = req
            .body()
            .and_then(|b| b.as_bytes())
            .map(|bytes| url::form_urlencoded::parse(bytes).into_owned().collect())
            .unwrap_or_default();

        self.requests.lock().unwrap().push(RecordedRequest {
            method: req.method().clone(),
            url: req.url().clone(),
            headers: req.headers().clone(),
            form,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self.next_response().into_response())
    }
}
