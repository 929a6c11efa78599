//! Overwrite conflict resolution.
//!
//! [`OverwritePolicy`] is a per-run cell shared by every worker. It starts in
//! `Ask` (or a configured "always" state) and moves at most once, to
//! `AlwaysOverwrite` or `AlwaysSkip`; after that no worker prompts again.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ASK: u8 = 0;
const ALWAYS_OVERWRITE: u8 = 1;
const ALWAYS_SKIP: u8 = 2;

/// State of the overwrite policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyState {
    #[default]
    Ask,
    #[serde(rename = "overwrite")]
    AlwaysOverwrite,
    #[serde(rename = "skip")]
    AlwaysSkip,
}

impl PolicyState {
    fn to_raw(self) -> u8 {
        match self {
            Self::Ask => ASK,
            Self::AlwaysOverwrite => ALWAYS_OVERWRITE,
            Self::AlwaysSkip => ALWAYS_SKIP,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            ALWAYS_OVERWRITE => Self::AlwaysOverwrite,
            ALWAYS_SKIP => Self::AlwaysSkip,
            _ => Self::Ask,
        }
    }
}

impl FromStr for PolicyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ask" => Ok(Self::Ask),
            "overwrite" | "always-overwrite" => Ok(Self::AlwaysOverwrite),
            "skip" | "always-skip" => Ok(Self::AlwaysSkip),
            other => Err(format!("unknown overwrite policy: {} (expected ask, overwrite or skip)", other)),
        }
    }
}

/// Answer of the conflict-resolution callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    Overwrite,
    Skip,
    OverwriteAll,
    SkipAll,
}

impl ConflictDecision {
    pub fn writes(&self) -> bool {
        matches!(self, Self::Overwrite | Self::OverwriteAll)
    }

    fn escalation(&self) -> Option<PolicyState> {
        match self {
            Self::OverwriteAll => Some(PolicyState::AlwaysOverwrite),
            Self::SkipAll => Some(PolicyState::AlwaysSkip),
            _ => None,
        }
    }
}

/// Callback consulted when a destination already exists and the policy is `Ask`.
///
/// Called from a blocking thread, so implementations may wait on user input.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, existing: &Path) -> ConflictDecision;
}

/// Resolver that always gives the same answer and counts how often it was asked
pub struct FixedResolver {
    decision: ConflictDecision,
    calls: AtomicUsize,
}

impl FixedResolver {
    pub fn new(decision: ConflictDecision) -> Self {
        Self {
            decision,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConflictResolver for FixedResolver {
    fn resolve(&self, _existing: &Path) -> ConflictDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

/// Monotonic, race-free overwrite policy. A new one is created for every batch run.
pub struct OverwritePolicy {
    state: AtomicU8,
    // One prompt at a time; waiters re-read the state once they get in
    prompt: Mutex<()>,
}

impl OverwritePolicy {
    pub fn new(initial: PolicyState) -> Self {
        Self {
            state: AtomicU8::new(initial.to_raw()),
            prompt: Mutex::new(()),
        }
    }

    pub fn state(&self) -> PolicyState {
        PolicyState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn escalate(&self, to: PolicyState) {
        // Only Ask can move; an existing "always" wins
        let _ = self
            .state
            .compare_exchange(ASK, to.to_raw(), Ordering::AcqRel, Ordering::Acquire);
    }

    /// Decide whether `destination` may be written.
    ///
    /// Missing destinations are always writable. A skip leaves the existing file
    /// untouched and is not an error.
    pub async fn allows_write(&self, destination: &Path, resolver: &Arc<dyn ConflictResolver>) -> bool {
        if !tokio::fs::try_exists(destination).await.unwrap_or(false) {
            return true;
        }

        if let Some(answer) = self.settled() {
            return answer;
        }

        let _guard = self.prompt.lock().await;
        if let Some(answer) = self.settled() {
            return answer;
        }

        let resolver = Arc::clone(resolver);
        let path: PathBuf = destination.to_path_buf();
        let decision = match tokio::task::spawn_blocking(move || resolver.resolve(&path)).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Conflict resolver failed for {}: {}", destination.display(), e);
                ConflictDecision::Skip
            }
        };

        debug!("Conflict on {} resolved as {:?}", destination.display(), decision);
        if let Some(state) = decision.escalation() {
            self.escalate(state);
        }
        decision.writes()
    }

    fn settled(&self) -> Option<bool> {
        match self.state() {
            PolicyState::AlwaysOverwrite => Some(true),
            PolicyState::AlwaysSkip => Some(false),
            PolicyState::Ask => None,
        }
    }
}
