//! Error types for cluster bring-up
//!
//! Each stage of a run fails with its own error type; [`Error`] wraps them so
//! callers can match on the failing stage while `anyhow` handles reporting at
//! the CLI boundary.

use crate::services::k3s::NodeStage;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Cluster declaration failed to load or validate. Raised before any remote action.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {field}: {value} ({source})")]
    InvalidCidr {
        field: &'static str,
        value: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("cluster-cidr and service-cidr cannot be the same: {0}")]
    IdenticalCidrs(String),

    #[error("cluster-cidr ({cluster}) and service-cidr ({service}) overlap")]
    OverlappingCidrs { cluster: String, service: String },

    #[error("{role} {node}: ip address is empty")]
    EmptyAddress { role: &'static str, node: String },

    #[error("{role} {node}: invalid ip address: {address}")]
    InvalidAddress {
        role: &'static str,
        node: String,
        address: String,
    },
}

/// An SSH session could not be opened.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid address {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Tcp {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("ssh handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open sftp channel to {addr}: {source}")]
    Subsystem {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("host key verification failed for {addr}: {reason}")]
    HostKey { addr: String, reason: String },

    #[error("failed to read private key {path}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("authentication failed for {user}@{addr} (tried: {tried})")]
    Auth {
        user: String,
        addr: String,
        tried: String,
    },

    #[error("no credentials configured for {user}@{addr}")]
    NoCredentials { user: String, addr: String },
}

/// A remote command or file transfer failed on an open session.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cmd failed: {command}\nexit status: {status}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    Exec {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("ssh channel error while running `{command}`: {source}")]
    Channel {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("file transfer failed for {path}: {source}")]
    Transfer {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("size mismatch after upload of {path}: local {local} bytes, remote {remote} bytes")]
    SizeMismatch { path: String, local: u64, remote: u64 },
}

/// An artifact could neither be found locally nor downloaded.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("{description} file not found: {source_ref}{}", .hint.as_ref().map(|h| format!("\n\n{h}")).unwrap_or_default())]
    NotFound {
        description: String,
        source_ref: String,
        hint: Option<&'static str>,
    },

    #[error("failed to access {description}: {source}")]
    Access {
        description: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("cannot determine filename from URL: {0}")]
    NoFilename(String),

    #[error("failed to download {description} from {url}: {source}")]
    Download {
        description: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read response body from {url}: {source}")]
    Read {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("download of {url} exceeded the {limit:?} time limit")]
    Timeout { url: String, limit: Duration },

    #[error("download of {url} failed with status: {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create temp directory: {0}")]
    TempDir(#[source] io::Error),
}

/// The cluster access credential could not be fetched, patched or saved.
#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("failed to download kubeconfig from {host} (tried {tried}): {source}")]
    Fetch {
        host: String,
        tried: String,
        #[source]
        source: RemoteError,
    },

    #[error("failed to parse kubeconfig: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("invalid cluster server address {server}: {reason}")]
    InvalidServer { server: String, reason: String },

    #[error("failed to serialize kubeconfig: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("failed to write kubeconfig {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Top-level error returned by [`crate::services::k3s::Installer::apply`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    #[error("no servers defined")]
    NoServers,

    #[error("node {node} failed while {stage}")]
    Node {
        node: String,
        stage: NodeStage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Strip node attribution and return the underlying failure.
    pub fn root(&self) -> &Error {
        match self {
            Error::Node { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
