//! Error types for the control plane
//!
//! Each component has its own error enum. Setting validation failures are not
//! errors: they are collected as [`crate::resolver::Violation`]s and the
//! offending key is dropped.

use std::path::PathBuf;
use thiserror::Error;

/// Plugin manifest and catalog loading failures
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid plugin {plugin}: {reason}")]
    InvalidPlugin { plugin: String, reason: String },

    #[error("Setting {setting} of plugin {plugin} is already declared by {owner}")]
    DuplicateSetting {
        setting: String,
        plugin: String,
        owner: String,
    },

    #[error("Plugin {0} is already loaded")]
    DuplicatePlugin(String),

    #[error("Setting catalog is empty")]
    Empty,
}

/// Failures talking to a single instance's control API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Instance answered with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Instance reported failure: {0}")]
    Rejected(String),

    #[error("Failed to build archive: {0}")]
    Archive(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout(0)
        } else if e.is_connect() {
            ApiError::Connection(e.to_string())
        } else {
            ApiError::Http(e.to_string())
        }
    }
}

/// Failures of the external config renderer
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Renderer command is empty")]
    EmptyCommand,

    #[error("Invalid renderer command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn renderer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Renderer timed out after {0}s")]
    Timeout(u64),

    #[error("Renderer exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

/// Job scheduler failures
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Scheduler is not running")]
    Closed,

    #[error("Failed to spawn job {job}: {source}")]
    Spawn {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

/// Failures enumerating the fleet from an orchestration backend
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid fleet file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Kubernetes API error: {0}")]
    Kubernetes(String),

    #[error("Invalid fleet definition: {0}")]
    Invalid(String),
}

impl From<reqwest::Error> for FleetError {
    fn from(e: reqwest::Error) -> Self {
        FleetError::Kubernetes(e.to_string())
    }
}

/// External plugin installation failures
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Download of {url} failed after {attempts} attempts: {reason}")]
    Download {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] std::io::Error),

    #[error("Archive contains no plugin.json")]
    NoManifest,

    #[error("Invalid plugin: {0}")]
    Invalid(#[from] CatalogError),

    #[error("Plugin {0} is a core plugin and cannot be replaced")]
    CoreConflict(String),

    #[error("Catalog reload failed: {0:#}")]
    Reload(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_unit() {
        let err = CatalogError::DuplicateSetting {
            setting: "USE_CORS".into(),
            plugin: "extra".into(),
            owner: "cors".into(),
        };
        assert_eq!(
            err.to_string(),
            "Setting USE_CORS of plugin extra is already declared by cors"
        );

        let err = ApiError::Status {
            status: 503,
            body: "busy".into(),
        };
        assert!(err.to_string().contains("503"));

        let err = SchedulerError::UnknownJob("certbot-renew".into());
        assert_eq!(err.to_string(), "Unknown job: certbot-renew");
    }

    #[test]
    fn test_render_error_includes_stderr() {
        let err = RenderError::Failed {
            code: Some(2),
            stderr: "template not found".into(),
        };
        assert!(err.to_string().contains("template not found"));
    }
}
