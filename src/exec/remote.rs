//! Routing commands to the local host or to fleet-managed machines.

use super::parse;
use super::runner::{BoxedRunner, CommandOutput};
use slog::{debug, Logger};
use std::fmt;

const SALT: &str = "salt";

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    /// A fleet-manager minion id.
    Node(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => f.write_str("localhost"),
            Target::Node(id) => f.write_str(id),
        }
    }
}

/// A fleet-manager addressing expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A single id or a glob such as `worker*`.
    Name(String),
    /// An explicit id list (`-L`).
    List(Vec<String>),
    /// A grain match (`-G key:value`).
    Grain(String),
}

impl Selector {
    /// Interpret operator input: a comma outside a bracket expression makes it a list.
    pub fn parse(pattern: &str) -> Selector {
        let pattern = pattern.trim();
        if pattern.contains(',') && !pattern.contains('[') {
            Selector::List(
                pattern.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        } else {
            Selector::Name(pattern.to_string())
        }
    }

    /// Members carrying the `kubic-<role>-node` grain.
    pub fn role(role: &str) -> Selector {
        Selector::Grain(format!("kubicd:{}", role_grain(role)))
    }

    fn args(&self) -> Vec<String> {
        match self {
            Selector::Name(name) => vec![name.clone()],
            Selector::List(ids) => vec!["-L".to_string(), ids.join(",")],
            Selector::Grain(grain) => vec!["-G".to_string(), grain.clone()],
        }
    }
}

/// Grain value recorded for a node role.
pub fn role_grain(role: &str) -> String {
    format!("kubic-{}-node", role)
}

/// Runs commands locally or through the fleet manager with one contract.
#[derive(Clone)]
pub struct RemoteExecutor {
    runner: BoxedRunner,
    log: Logger,
}

impl RemoteExecutor {
    pub fn new(runner: BoxedRunner, log: Logger) -> Self {
        Self { runner, log }
    }

    /// Run a local program directly.
    pub async fn local(&self, program: &str, args: &[&str]) -> CommandOutput {
        self.runner.run(program, args).await
    }

    /// Run a shell command line on the target.
    pub async fn shell(&self, target: &Target, cmdline: &str) -> CommandOutput {
        debug!(self.log, "shell"; "target" => %target, "cmdline" => cmdline);
        match target {
            Target::Local => self.runner.run("/bin/sh", &["-c", cmdline]).await,
            Target::Node(id) => self.runner.run(SALT, &[id, "cmd.run", cmdline]).await,
        }
    }

    /// Invoke a raw fleet function on one node.
    pub async fn call(&self, node: &str, function: &str, args: &[&str]) -> CommandOutput {
        let mut full = vec![node, function];
        full.extend_from_slice(args);
        self.runner.run(SALT, &full).await
    }

    /// Start and enable a service, stopping at the first failure.
    pub async fn enable_service(&self, target: &Target, service: &str) -> CommandOutput {
        match target {
            Target::Local => self.runner.run("systemctl", &["enable", "--now", service]).await,
            Target::Node(id) => {
                let started = self.call(id, "service.start", &[service]).await;
                if !started.success {
                    return started;
                }
                self.call(id, "service.enable", &[service]).await
            }
        }
    }

    /// Disable and stop a service, running both halves regardless.
    pub async fn disable_service(&self, target: &Target, service: &str) -> CommandOutput {
        match target {
            Target::Local => self.runner.run("systemctl", &["disable", "--now", service]).await,
            Target::Node(id) => {
                let disabled = self.call(id, "service.disable", &[service]).await;
                let stopped = self.call(id, "service.stop", &[service]).await;
                if disabled.success {
                    stopped
                } else {
                    disabled
                }
            }
        }
    }

    pub async fn restart_service(&self, target: &Target, service: &str) -> CommandOutput {
        match target {
            Target::Local => self.runner.run("systemctl", &["restart", service]).await,
            Target::Node(id) => self.call(id, "service.restart", &[service]).await,
        }
    }

    /// Run a fleet function with `--out=txt` against a selector.
    pub async fn query(&self, selector: &Selector, function: &str, args: &[&str]) -> CommandOutput {
        let selector_args = selector.args();
        let mut full: Vec<&str> = vec!["--out=txt"];
        full.extend(selector_args.iter().map(String::as_str));
        full.push(function);
        full.extend_from_slice(args);
        self.runner.run(SALT, &full).await
    }

    /// Ids matching the selector that answer a ping.
    ///
    /// The fleet manager exits non-zero when some minions do not answer, so the
    /// output is parsed regardless of the exit status; silent ids are dropped.
    pub async fn ping(&self, selector: &Selector) -> Vec<String> {
        let out = self.query(selector, "test.ping", &[]).await;
        let ids = parse::responding(&out.output);
        debug!(self.log, "ping"; "selector" => ?selector, "responding" => ids.len());
        ids
    }

    /// Ids currently carrying the role grain.
    pub async fn list_role(&self, role: &str) -> CommandOutput {
        self.query(&Selector::role(role), "grains.get", &["kubicd"]).await
    }

    /// Ids currently carrying the role grain, parsed.
    pub async fn role_members(&self, role: &str) -> Vec<String> {
        parse::minions(&self.list_role(role).await.output)
    }

    pub async fn set_role(&self, node: &str, role: &str) -> CommandOutput {
        self.call(node, "grains.append", &["kubicd", &role_grain(role)]).await
    }

    pub async fn clear_role(&self, node: &str) -> CommandOutput {
        self.call(node, "grains.delkey", &["kubicd"]).await
    }

    /// Kubernetes node name of a minion (its hostname).
    pub async fn node_name(&self, node: &str) -> Result<String, CommandOutput> {
        let out = self.query(&Selector::Name(node.to_string()), "network.get_hostname", &[]).await;
        if !out.success {
            return Err(out);
        }
        match parse::value_of(&out.output, node) {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(CommandOutput::failed(format!("{}: no hostname reported", node))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeRunner;
    use crate::logging::test_logger;

    #[test]
    fn test_selector_parse() {
        assert_eq!(Selector::parse("node1"), Selector::Name("node1".into()));
        assert_eq!(Selector::parse("worker*"), Selector::Name("worker*".into()));
        assert_eq!(
            Selector::parse("host1, host2,"),
            Selector::List(vec!["host1".into(), "host2".into()])
        );
        assert_eq!(Selector::parse("node[1,2]"), Selector::Name("node[1,2]".into()));
    }

    #[tokio::test]
    async fn test_ping_ignores_exit_status() {
        let fake = FakeRunner::new(test_logger());
        fake.fail("test.ping", "host1: True\nhost2: Minion did not return. [No response]\n");
        let exec = RemoteExecutor::new(fake.clone().as_runner(), test_logger());

        let ids = exec.ping(&Selector::parse("host1,host2")).await;
        assert_eq!(ids, vec!["host1"]);
        assert_eq!(fake.calls(), vec!["salt --out=txt -L host1,host2 test.ping"]);
    }

    #[tokio::test]
    async fn test_shell_routing() {
        let fake = FakeRunner::new(test_logger());
        let exec = RemoteExecutor::new(fake.clone().as_runner(), test_logger());

        exec.shell(&Target::Local, "true").await;
        exec.shell(&Target::Node("w1".into()), "kubeadm reset --force").await;
        assert_eq!(
            fake.calls(),
            vec!["/bin/sh -c true", "salt w1 cmd.run kubeadm reset --force"]
        );
    }

    #[tokio::test]
    async fn test_enable_service_stops_on_start_failure() {
        let fake = FakeRunner::new(test_logger());
        fake.fail("service.start crio", "failed");
        let exec = RemoteExecutor::new(fake.clone().as_runner(), test_logger());

        let out = exec.enable_service(&Target::Node("w1".into()), "crio").await;
        assert!(!out.success);
        assert_eq!(fake.count("service.enable"), 0);
    }

    #[tokio::test]
    async fn test_node_name() {
        let fake = FakeRunner::new(test_logger());
        fake.on("network.get_hostname", "w1: worker-one\n");
        let exec = RemoteExecutor::new(fake.clone().as_runner(), test_logger());

        assert_eq!(exec.node_name("w1").await.ok().as_deref(), Some("worker-one"));
        assert!(exec.node_name("w2").await.is_err());
    }

    #[tokio::test]
    async fn test_role_members() {
        let fake = FakeRunner::new(test_logger());
        fake.on("-G kubicd:kubic-worker-node grains.get kubicd", "w1: kubic-worker-node\nw2: kubic-worker-node\n");
        let exec = RemoteExecutor::new(fake.clone().as_runner(), test_logger());

        assert_eq!(exec.role_members("worker").await, vec!["w1", "w2"]);
    }
}
