use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Route {0} does not exist.")]
    RouteNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LoaderError {
    /// Short name of the failure, reported to the UI alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            LoaderError::Config(_) => "ConfigError",
            LoaderError::Transport(_) => "TransportError",
            LoaderError::Manifest(_) => "ManifestError",
            LoaderError::Plugin(PluginError::MethodFailed(_)) => "PluginMethodError",
            LoaderError::Plugin(_) => "PluginError",
            LoaderError::Sandbox(_) => "SandboxError",
            LoaderError::RouteNotFound(_) => "RouteNotFound",
            LoaderError::InvalidArguments(_) => "InvalidArguments",
            LoaderError::Io(_) => "IoError",
            LoaderError::Serialization(_) => "SerializationError",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid {path}: {reason}")]
    Invalid { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin {0} is passive (does not implement a backend)")]
    Passive(String),

    #[error("Plugin {plugin} tried to call private method {method}")]
    PrivateMethod { plugin: String, method: String },

    #[error("{0}")]
    MethodFailed(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin {0} was stopped before the call completed")]
    Stopped(String),

    #[error("Failed to spawn sandbox for {plugin}: {reason}")]
    SpawnFailed { plugin: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to switch identity: {0}")]
    Privilege(String),

    #[error("Failed to load plugin code from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Hook {hook} failed: {reason}")]
    Hook { hook: &'static str, reason: String },

    #[error("Failed to prepare environment: {0}")]
    Environment(String),

    #[error("{0}")]
    ConventionMismatch(String),
}

pub type Result<T> = std::result::Result<T, LoaderError>;
