//! The RPC surface: mutual TLS, per-call authorization, and the services
//! that dispatch into the orchestrator.

pub mod certs;
pub mod gateway;
pub mod identity;
pub mod policy;
pub mod server;

pub mod proto {
    tonic::include_proto!("api");
}

pub use certs::{CertificateIssuer, IssuedCertificate, ADMIN_IDENTITY, CONTROL_CA, SERVER_IDENTITY};
pub use gateway::{CallAudit, CallOutcome, Gateway};
pub use identity::{caller_identity, IdentityError};
pub use policy::{policy_key, AccessPolicy, Grant, PolicyError};
pub use server::{start_server, tls_config, GrpcServerHandle, ServerError};
