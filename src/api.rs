//! Distribution client for the instance control API
//!
//! Every call is fanned out to all target instances concurrently and joined
//! before returning. There is no retry at this layer; a [`BroadcastReport`]
//! tells the caller which hostnames failed and why.
//!
//! Instances answer with a JSON body of the form
//! `{"status": "success" | "error", "msg": ...}`.

use crate::error::ApiError;
use crate::model::Instance;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::join_all;
use reqwest::header::{AUTHORIZATION, HOST};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const USER_AGENT: &str = "convoy";

/// Multipart field name used for file pushes
pub const ARCHIVE_FIELD: &str = "archive.tar.gz";

/// A single logical call to send to every instance
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: reqwest::Method,
    pub path: String,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            path: path.into(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::POST,
            path: path.into(),
            body: None,
            timeout: None,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a fan-out call
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub all_ok: bool,
    /// Failure per hostname
    pub errors: HashMap<String, ApiError>,
    /// Decoded response body per successful hostname
    pub responses: HashMap<String, Value>,
}

impl BroadcastReport {
    fn from_results(results: Vec<(String, Result<Value, ApiError>)>) -> Self {
        let mut report = Self {
            all_ok: true,
            ..Default::default()
        };
        for (hostname, result) in results {
            match result {
                Ok(body) => {
                    report.responses.insert(hostname, body);
                }
                Err(e) => {
                    report.all_ok = false;
                    report.errors.insert(hostname, e);
                }
            }
        }
        report
    }

    /// Hostnames that failed, sorted
    pub fn failed_hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.errors.keys().map(String::as_str).collect();
        hosts.sort_unstable();
        hosts
    }
}

/// Fan-out capability used by the reconciler, the scheduler and the health loop
#[async_trait]
pub trait Distributor: Send + Sync {
    async fn broadcast(&self, instances: &[Instance], request: &ApiRequest) -> BroadcastReport;

    /// Push `dir` as a gzip tarball to `url` on every instance
    async fn send_files(&self, instances: &[Instance], dir: &Path, url: &str) -> BroadcastReport;

    async fn reload(&self, instances: &[Instance], test: bool, timeout: Duration) -> BroadcastReport {
        let path = format!("/reload?test={}", if test { "yes" } else { "no" });
        self.broadcast(instances, &ApiRequest::post(path).timeout(timeout)).await
    }

    async fn ban(&self, instances: &[Instance], ip: &str, exp: u64, reason: &str) -> BroadcastReport {
        let body = json!({ "ip": ip, "exp": exp, "reason": reason });
        self.broadcast(instances, &ApiRequest::post("/ban").json(body)).await
    }

    async fn unban(&self, instances: &[Instance], ip: &str) -> BroadcastReport {
        self.broadcast(instances, &ApiRequest::post("/unban").json(json!({ "ip": ip })))
            .await
    }

    async fn ping(&self, instances: &[Instance]) -> BroadcastReport {
        self.broadcast(instances, &ApiRequest::get("/ping")).await
    }

    async fn health(&self, instances: &[Instance]) -> BroadcastReport {
        self.broadcast(instances, &ApiRequest::get("/health")).await
    }

    async fn metrics(&self, instances: &[Instance], plugin: &str) -> BroadcastReport {
        self.broadcast(instances, &ApiRequest::get(format!("/metrics/{plugin}"))).await
    }
}

/// Client options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            token: None,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP implementation of [`Distributor`]
#[derive(Debug, Clone)]
pub struct FleetClient {
    http: reqwest::Client,
    token: Option<String>,
    request_timeout: Duration,
}

impl FleetClient {
    pub fn new(options: ClientOptions) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Ok(Self {
            http,
            token: options.token.filter(|t| !t.is_empty()),
            request_timeout: options.request_timeout,
        })
    }

    fn builder(
        &self,
        instance: &Instance,
        method: reqwest::Method,
        path: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", instance.endpoint(), path);
        let mut builder = self
            .http
            .request(method, url)
            .header(HOST, &instance.server_name)
            .timeout(timeout);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
    }

    /// Call one instance
    pub async fn call(&self, instance: &Instance, request: &ApiRequest) -> Result<Value, ApiError> {
        let timeout = request.timeout.unwrap_or(self.request_timeout);
        let mut builder = self.builder(instance, request.method.clone(), &request.path, timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        finish(builder, timeout).await
    }

    async fn upload(&self, instance: &Instance, archive: Vec<u8>, url: &str) -> Result<Value, ApiError> {
        let part = reqwest::multipart::Part::bytes(archive)
            .file_name(ARCHIVE_FIELD)
            .mime_str("application/gzip")
            .map_err(|e| ApiError::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part(ARCHIVE_FIELD, part);
        let builder = self
            .builder(instance, reqwest::Method::POST, url, self.request_timeout)
            .multipart(form);
        finish(builder, self.request_timeout).await
    }
}

async fn finish(builder: reqwest::RequestBuilder, timeout: Duration) -> Result<Value, ApiError> {
    let response = builder.send().await.map_err(|e| map_reqwest(e, timeout))?;
    let status = response.status();
    let text = response.text().await.map_err(|e| map_reqwest(e, timeout))?;

    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            body: text,
        });
    }

    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    if body.get("status").and_then(Value::as_str) == Some("error") {
        let msg = match body.get("msg") {
            Some(Value::String(msg)) => msg.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        return Err(ApiError::Rejected(msg));
    }
    Ok(body)
}

fn map_reqwest(e: reqwest::Error, timeout: Duration) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout(timeout.as_secs())
    } else {
        ApiError::from(e)
    }
}

#[async_trait]
impl Distributor for FleetClient {
    async fn broadcast(&self, instances: &[Instance], request: &ApiRequest) -> BroadcastReport {
        let calls = instances.iter().map(|instance| async move {
            (instance.hostname.clone(), self.call(instance, request).await)
        });
        let report = BroadcastReport::from_results(join_all(calls).await);

        for (hostname, error) in &report.errors {
            warn!(hostname = %hostname, path = %request.path, error = %error, "Instance call failed");
        }
        debug!(
            path = %request.path,
            instances = instances.len(),
            failed = report.errors.len(),
            "Broadcast finished"
        );
        report
    }

    async fn send_files(&self, instances: &[Instance], dir: &Path, url: &str) -> BroadcastReport {
        let archive = match create_archive(dir) {
            Ok(archive) => archive,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to archive directory");
                let results = instances
                    .iter()
                    .map(|i| (i.hostname.clone(), Err(ApiError::Http(format!("archive failed: {e}")))))
                    .collect();
                return BroadcastReport::from_results(results);
            }
        };

        let calls = instances.iter().map(|instance| {
            let archive = archive.clone();
            async move { (instance.hostname.clone(), self.upload(instance, archive, url).await) }
        });
        let report = BroadcastReport::from_results(join_all(calls).await);

        for (hostname, error) in &report.errors {
            warn!(hostname = %hostname, url = %url, error = %error, "File push failed");
        }
        if report.all_ok {
            info!(url = %url, instances = instances.len(), "Files pushed");
        }
        report
    }
}

/// Gzip tarball of the contents of `dir`; an absent directory yields an empty archive
pub fn create_archive(dir: &Path) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tarball = tar::Builder::new(encoder);
    if dir.is_dir() {
        tarball.append_dir_all(".", dir)?;
    }
    tarball.into_inner()?.finish()
}
