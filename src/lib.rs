pub mod config;
pub mod exec;
pub mod grpc;
pub mod logging;
pub mod orchestrator;
pub mod state;

pub use config::{DaemonConfig, LoadError};
pub use exec::{BoxedRunner, CommandOutput, CommandRunner, HostRunner, RemoteExecutor};
pub use grpc::{start_server, tls_config, GrpcServerHandle, ServerError};
pub use orchestrator::{Orchestrator, Outcome, ProgressMessage, ProgressSink, StreamClosed};
