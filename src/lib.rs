/// Orchestration of the update pipeline used by both daemons
pub mod controller;
pub mod entry;
pub mod k8s;
pub mod updater;

pub mod dns;
pub mod frontend;
pub mod nginx;
pub mod status;

/// Log and trace integrations
pub mod telemetry;

/// Prometheus registry and metric statics
pub mod metrics;

pub mod settings;
pub mod web;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("frontend discovery failed: {0}")]
    Discovery(String),

    #[error("cloud API call failed: {0}")]
    Cloud(String),

    #[error("DNS update failed: {0}")]
    Dns(String),

    #[error("nginx rejected the rendered configuration: {0}")]
    NginxConfInvalid(String),

    #[error("nginx process: {0}")]
    Nginx(String),

    #[error("shutdown incomplete: {0}")]
    Shutdown(String),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TemplateError: {0}")]
    TemplateError(#[from] tera::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Discovery(_) => "discovery",
            Error::Cloud(_) => "cloud",
            Error::Dns(_) => "dns",
            Error::NginxConfInvalid(_) => "nginx_conf_invalid",
            Error::Nginx(_) => "nginx",
            Error::Shutdown(_) => "shutdown",
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::TemplateError(_) => "template",
            Error::HttpError(_) => "http",
            Error::IoError(_) => "io",
        }
    }
}
