//! External command execution: the local runner, fleet routing, and the
//! parsers for what those tools print.

pub mod fake;
pub mod parse;
pub mod remote;
pub mod runner;

pub use fake::FakeRunner;
pub use remote::{role_grain, RemoteExecutor, Selector, Target};
pub use runner::{command_line, BoxedRunner, CommandOutput, CommandRunner, HostRunner};
