//! Permission checks run before any byte moves.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::http::StatusCode;

use crate::error::{Error, Result};
use crate::store::FileRecord;

/// Operation a validator is asked about. Chunk uploads to an existing file
/// are checked as [`Action::Insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Download,
    Insert,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Download => "download",
            Action::Insert => "insert",
            Action::Remove => "remove",
        })
    }
}

/// The acting user, as established by the host's authentication layer.
/// Inserted into request extensions; absence means anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(pub String);

/// Outcome of a single validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { status: StatusCode, message: String },
}

impl Verdict {
    /// `403 Access denied`.
    pub fn forbidden() -> Self {
        Verdict::Deny { status: StatusCode::FORBIDDEN, message: "Access denied".to_string() }
    }

    /// `401 Unauthorized`.
    pub fn unauthorized() -> Self {
        Verdict::Deny { status: StatusCode::UNAUTHORIZED, message: "Unauthorized".to_string() }
    }
}

/// A pluggable permission predicate.
pub trait Validator: Send + Sync {
    fn evaluate(&self, subject: &FileRecord, identity: Option<&Identity>) -> Verdict;
}

impl<F> Validator for F
where
    F: Fn(&FileRecord, Option<&Identity>) -> Verdict + Send + Sync,
{
    fn evaluate(&self, subject: &FileRecord, identity: Option<&Identity>) -> Verdict {
        self(subject, identity)
    }
}

/// Validators registered per action. An action with no validators is
/// permitted.
#[derive(Clone, Default)]
pub struct ValidatorSet {
    rules: HashMap<Action, Vec<Arc<dyn Validator>>>,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action: Action, validator: impl Validator + 'static) -> Self {
        self.add(action, validator);
        self
    }

    pub fn add(&mut self, action: Action, validator: impl Validator + 'static) {
        self.rules.entry(action).or_default().push(Arc::new(validator));
    }

    pub fn for_action(&self, action: Action) -> &[Arc<dyn Validator>] {
        self.rules.get(&action).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<_> = self.rules.iter().map(|(a, v)| (*a, v.len())).collect();
        counts.sort_by_key(|(a, _)| a.to_string());
        f.debug_struct("ValidatorSet").field("rules", &counts).finish()
    }
}

/// Runs the validators of one action against a subject.
pub struct ActionGate;

impl ActionGate {
    /// Fails with [`Error::AuthorizationDenied`] on the first validator
    /// that denies.
    pub fn check(
        validators: &ValidatorSet,
        action: Action,
        subject: &FileRecord,
        identity: Option<&Identity>,
    ) -> Result<()> {
        for validator in validators.for_action(action) {
            if let Verdict::Deny { status, message } = validator.evaluate(subject, identity) {
                tracing::warn!(%action, file = ?subject.id, ?identity, %status, "action denied");
                return Err(Error::AuthorizationDenied { status, message });
            }
        }
        Ok(())
    }
}
