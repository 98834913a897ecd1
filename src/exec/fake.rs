//! A scripted [CommandRunner] for tests.

use super::runner::{command_line, BoxedRunner, CommandOutput, CommandRunner};
use async_trait::async_trait;
use slog::{debug, Logger};
use std::sync::{Arc, Mutex, MutexGuard};

struct Rule {
    pattern: String,
    output: CommandOutput,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

struct FakeRunnerInner {
    rules: Vec<Rule>,
    hooks: Vec<(String, Hook)>,
    calls: Vec<String>,
}

/// A runner which records every command line and answers from a rule table.
///
/// A rule matches when its pattern is a substring of the rendered command
/// line. The most recently registered matching rule wins; an unmatched
/// command succeeds with empty output.
pub struct FakeRunner {
    log: Logger,
    inner: Mutex<FakeRunnerInner>,
}

impl FakeRunner {
    pub fn new(log: Logger) -> Arc<FakeRunner> {
        Arc::new(Self {
            log,
            inner: Mutex::new(FakeRunnerInner { rules: Vec::new(), hooks: Vec::new(), calls: Vec::new() }),
        })
    }

    pub fn as_runner(self: Arc<Self>) -> BoxedRunner {
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeRunnerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer commands containing `pattern` with a successful `output`.
    pub fn on(&self, pattern: &str, output: &str) {
        self.respond(pattern, CommandOutput::ok(output));
    }

    /// Answer commands containing `pattern` with a failure.
    pub fn fail(&self, pattern: &str, output: &str) {
        self.respond(pattern, CommandOutput::failed(output));
    }

    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.lock().rules.push(Rule { pattern: pattern.to_string(), output });
    }

    /// Call `hook` after each command containing `pattern` was recorded.
    pub fn hook(&self, pattern: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.lock().hooks.push((pattern.to_string(), Arc::new(hook)));
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded command lines containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.contains(pattern)).count()
    }

    /// Index of the first recorded command line containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.lock().calls.iter().position(|c| c.contains(pattern))
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        let line = command_line(program, args);
        let (output, hooks) = {
            let mut inner = self.lock();
            inner.calls.push(line.clone());
            let output = inner
                .rules
                .iter()
                .rev()
                .find(|rule| line.contains(&rule.pattern))
                .map(|rule| rule.output.clone())
                .unwrap_or_else(|| CommandOutput::ok(""));
            let hooks: Vec<Hook> = inner
                .hooks
                .iter()
                .filter(|(pattern, _)| line.contains(pattern))
                .map(|(_, hook)| hook.clone())
                .collect();
            (output, hooks)
        };
        for hook in hooks {
            hook();
        }
        debug!(self.log, "fake command"; "command" => &line, "success" => output.success);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_latest_rule_wins() {
        let fake = FakeRunner::new(test_logger());
        fake.on("kubeadm", "first");
        fake.fail("kubeadm token", "second");
        let runner = fake.clone().as_runner();

        let out = runner.run("kubeadm", &["token", "create"]).await;
        assert!(!out.success);
        assert_eq!(out.output, "second");

        let out = runner.run("kubeadm", &["version"]).await;
        assert!(out.success);
        assert_eq!(out.output, "first");

        let out = runner.run("kubectl", &["get", "nodes"]).await;
        assert!(out.success);
        assert!(out.output.is_empty());

        assert_eq!(fake.count("kubeadm"), 2);
        assert_eq!(fake.position("kubectl"), Some(2));
    }

    #[tokio::test]
    async fn test_hook_runs_after_matching_command() {
        let fake = FakeRunner::new(test_logger());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        fake.hook("drain", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let runner = fake.clone().as_runner();

        runner.run("kubectl", &["drain", "worker1"]).await;
        runner.run("kubectl", &["uncordon", "worker1"]).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
