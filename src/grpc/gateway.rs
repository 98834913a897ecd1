//! Admission of every RPC: identify the caller, authorize the method, and
//! write one audit record per call.

use super::identity::{caller_identity, IdentityError};
use super::policy::AccessPolicy;
use crate::orchestrator::{Outcome, WorkflowResult};
use slog::{info, warn, Logger};
use std::time::Instant;
use tonic::{Request, Status};
use uuid::Uuid;

/// How an admitted call ended, as written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Succeeded,
    Failed,
    /// The caller went away before the workflow finished.
    Aborted,
}

impl CallOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CallOutcome::Succeeded => "succeeded",
            CallOutcome::Failed => "failed",
            CallOutcome::Aborted => "aborted",
        }
    }
}

impl From<Outcome> for CallOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => CallOutcome::Succeeded,
            Outcome::Failed => CallOutcome::Failed,
        }
    }
}

impl From<&WorkflowResult> for CallOutcome {
    fn from(result: &WorkflowResult) -> Self {
        match result {
            Ok(outcome) => (*outcome).into(),
            Err(_) => CallOutcome::Aborted,
        }
    }
}

/// An admitted call. Consumed by [CallAudit::finish] once the handler, or
/// the workflow it spawned, is done.
#[must_use]
pub struct CallAudit {
    call_id: Uuid,
    method: &'static str,
    caller: String,
    started: Instant,
    log: Logger,
}

impl CallAudit {
    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn finish(self, outcome: CallOutcome, detail: &str) {
        info!(self.log, "rpc call";
            "call_id" => %self.call_id,
            "method" => self.method,
            "caller" => &self.caller,
            "duration_ms" => self.started.elapsed().as_millis() as u64,
            "outcome" => outcome.as_str(),
            "detail" => detail
        );
    }
}

/// Checks the caller of each call against the access policy before any
/// handler runs.
#[derive(Clone)]
pub struct Gateway {
    policy: AccessPolicy,
    log: Logger,
}

impl Gateway {
    pub fn new(policy: AccessPolicy, log: Logger) -> Self {
        Self { policy, log }
    }

    /// Admit `request` for `method` (`/api.<Service>/<Method>`).
    ///
    /// A missing certificate yields `Unauthenticated`; a caller not listed
    /// for the method, a method without an entry, or an unreadable policy
    /// yields `PermissionDenied`. Every refusal is audited.
    pub fn admit<T>(&self, method: &'static str, request: &Request<T>) -> Result<CallAudit, Status> {
        self.admit_caller(method, caller_identity(request))
    }

    fn admit_caller(
        &self,
        method: &'static str,
        identity: Result<String, IdentityError>,
    ) -> Result<CallAudit, Status> {
        let call_id = Uuid::new_v4();
        let started = Instant::now();

        let caller = match identity {
            Ok(caller) => caller,
            Err(err) => {
                self.deny(call_id, method, "", started, &err.to_string());
                return Err(Status::unauthenticated(err.to_string()));
            }
        };

        if let Err(err) = self.policy.authorize(method, &caller) {
            self.deny(call_id, method, &caller, started, &err.to_string());
            return Err(Status::permission_denied(format!(
                "{} is not allowed to call {}",
                caller, method
            )));
        }

        Ok(CallAudit { call_id, method, caller, started, log: self.log.clone() })
    }

    fn deny(&self, call_id: Uuid, method: &str, caller: &str, started: Instant, reason: &str) {
        warn!(self.log, "rpc call";
            "call_id" => %call_id,
            "method" => method,
            "caller" => caller,
            "duration_ms" => started.elapsed().as_millis() as u64,
            "outcome" => "denied",
            "detail" => reason
        );
    }
}
