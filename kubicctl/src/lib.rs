//! kubicctl client library
//!
//! Connection setup for talking to kubicd over mutual TLS and the rendering
//! of its replies.

pub mod admin;

use kubic_control::grpc::PolicyError;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

pub mod proto {
    tonic::include_proto!("api");
}

use proto::StatusReply;

/// Port kubicd listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 7148;

/// Name the daemon certificate is issued for.
pub const SERVER_NAME: &str = "KubicD";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not read \"{}\": {err}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("invalid server address {0}")]
    Address(String),
    #[error("did not connect: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("{}", .0.message())]
    Rpc(#[from] tonic::Status),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("{0}")]
    Certificates(String),
}

/// Replace a leading `~/` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Where kubicd runs and which identity to present.
#[derive(Debug, Clone)]
pub struct Connection {
    pub server: String,
    pub port: u16,
    pub crt_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: DEFAULT_PORT,
            crt_file: PathBuf::from("~/.config/kubicctl/pki/user.crt"),
            key_file: PathBuf::from("~/.config/kubicctl/pki/user.key"),
            ca_file: PathBuf::from("~/.config/kubicctl/pki/Kubic-Control.crt"),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ClientError> {
    let path = expand_home(path);
    std::fs::read(&path).map_err(|err| ClientError::Read { path, err })
}

impl Connection {
    pub fn endpoint(&self) -> String {
        if self.server.contains(':') && !self.server.starts_with('[') {
            format!("https://[{}]:{}", self.server, self.port)
        } else {
            format!("https://{}:{}", self.server, self.port)
        }
    }

    pub fn tls_config(&self) -> Result<ClientTlsConfig, ClientError> {
        let identity = Identity::from_pem(read(&self.crt_file)?, read(&self.key_file)?);
        let ca = Certificate::from_pem(read(&self.ca_file)?);
        Ok(ClientTlsConfig::new().domain_name(SERVER_NAME).ca_certificate(ca).identity(identity))
    }

    /// Open a mutually authenticated channel to kubicd.
    pub async fn connect(&self) -> Result<Channel, ClientError> {
        let endpoint = Channel::from_shared(self.endpoint()).map_err(|_| ClientError::Address(self.endpoint()))?;
        Ok(endpoint.tls_config(self.tls_config()?)?.connect().await?)
    }
}

/// Echoes replies: successful lines to `out`, failures to `err`.
pub struct Reporter<O: Write, E: Write> {
    out: O,
    err: E,
    failed: bool,
}

impl<O: Write, E: Write> Reporter<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self { out, err, failed: false }
    }

    pub fn report(&mut self, reply: &StatusReply) -> io::Result<()> {
        if reply.success {
            writeln!(self.out, "{}", reply.message.trim_end())
        } else {
            self.failed = true;
            writeln!(self.err, "{}", reply.message.trim_end())
        }
    }

    /// Drain a progress stream. A transport error counts as a failure.
    pub async fn follow(&mut self, mut stream: tonic::Streaming<StatusReply>) -> io::Result<()> {
        loop {
            match stream.message().await {
                Ok(Some(reply)) => self.report(&reply)?,
                Ok(None) => return Ok(()),
                Err(status) => {
                    self.failed = true;
                    return writeln!(self.err, "{}", status.message());
                }
            }
        }
    }

    /// True when no failure was reported.
    pub fn succeeded(&self) -> bool {
        !self.failed
    }

    pub fn into_inner(self) -> (O, E) {
        (self.out, self.err)
    }
}
