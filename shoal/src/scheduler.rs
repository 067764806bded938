//! Group dispatcher: decides which group releases the next task.
//!
//! The scheduler never touches tasks itself. Idle worker slots hand it a
//! set of [`GroupView`] snapshots; it picks the next eligible group under
//! the active policy and the slot then calls that group's claim primitive.
//! Policy state (round-robin cursor, priority credits) is process-local and
//! serialized behind one async mutex.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Inter-group dispatch policy. The snake_case names are the accepted
/// configuration values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Serve groups in rotation, skipping empty or saturated groups.
    RoundRobin,
    /// Serve the oldest due head across all groups (global arrival order).
    Fifo,
    /// Deterministic weighted round-robin proportional to group weights.
    Priority,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy::RoundRobin
    }
}

impl DispatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchPolicy::RoundRobin => "round_robin",
            DispatchPolicy::Fifo => "fifo",
            DispatchPolicy::Priority => "priority",
        }
    }
}

impl std::str::FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(DispatchPolicy::RoundRobin),
            "fifo" => Ok(DispatchPolicy::Fifo),
            "priority" => Ok(DispatchPolicy::Priority),
            other => Err(format!("unknown dispatch policy: {other}")),
        }
    }
}

/// Point-in-time snapshot of one group, produced by the group manager.
#[derive(Clone, Debug)]
pub struct GroupView {
    pub name: String,
    /// Score of the order head, if any.
    pub head_score: Option<f64>,
    /// Whether the head exists, is due, and is in a claimable state. A head
    /// with a future score makes the group present as empty.
    pub head_due: bool,
    /// Queue the head task targets; `None` when there is no claimable head.
    pub head_queue: Option<String>,
    /// Number of tasks currently executing.
    pub processing: usize,
    /// Group concurrency cap.
    pub cap: usize,
    /// Weight under the priority policy.
    pub weight: u32,
}

impl GroupView {
    /// Whether a claim against this group could succeed right now.
    pub fn eligible(&self) -> bool {
        self.head_due && self.processing < self.cap
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    /// Last group served by the round-robin policy.
    cursor: Option<String>,
    /// Running credits for the priority policy.
    credits: HashMap<String, i64>,
}

/// Policy-driven selector over group snapshots.
#[derive(Clone)]
pub struct GroupScheduler {
    policy: DispatchPolicy,
    state: Arc<Mutex<PolicyState>>,
}

impl GroupScheduler {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(PolicyState::default())),
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Select the group that should release the next task, or `None` when
    /// no group is eligible. Deterministic for a given snapshot sequence.
    pub async fn select(&self, views: &[GroupView]) -> Option<String> {
        match self.policy {
            DispatchPolicy::RoundRobin => self.select_round_robin(views).await,
            DispatchPolicy::Fifo => Self::select_fifo(views),
            DispatchPolicy::Priority => self.select_priority(views).await,
        }
    }

    async fn select_round_robin(&self, views: &[GroupView]) -> Option<String> {
        let mut ordered: Vec<&GroupView> = views.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));
        if ordered.is_empty() {
            return None;
        }

        let mut state = self.state.lock().await;
        // First slot strictly after the cursor; ineligible groups do not
        // consume a turn.
        let start = match &state.cursor {
            Some(cursor) => ordered
                .iter()
                .position(|v| v.name.as_str() > cursor.as_str())
                .unwrap_or(0),
            None => 0,
        };
        for offset in 0..ordered.len() {
            let view = ordered[(start + offset) % ordered.len()];
            if view.eligible() {
                state.cursor = Some(view.name.clone());
                return Some(view.name.clone());
            }
        }
        None
    }

    fn select_fifo(views: &[GroupView]) -> Option<String> {
        views
            .iter()
            .filter(|v| v.eligible())
            .min_by(|a, b| {
                let sa = a.head_score.unwrap_or(f64::MAX);
                let sb = b.head_score.unwrap_or(f64::MAX);
                sa.partial_cmp(&sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|v| v.name.clone())
    }

    async fn select_priority(&self, views: &[GroupView]) -> Option<String> {
        let eligible: Vec<&GroupView> = views.iter().filter(|v| v.eligible()).collect();
        if eligible.is_empty() {
            return None;
        }
        let max_weight = eligible.iter().map(|v| v.weight.max(1)).max().unwrap_or(1) as i64;

        let mut state = self.state.lock().await;
        // Smooth weighted round-robin: every eligible group earns its
        // weight each decision, the highest credit wins (ties break on the
        // name) and pays the maximum eligible weight. Interleaving stays
        // proportional to weights with no starvation.
        for view in &eligible {
            *state.credits.entry(view.name.clone()).or_insert(0) += view.weight.max(1) as i64;
        }
        let mut winner: Option<(&GroupView, i64)> = None;
        for view in &eligible {
            let credit = state.credits.get(&view.name).copied().unwrap_or(0);
            let better = match winner {
                None => true,
                Some((current, best)) => {
                    credit > best || (credit == best && view.name < current.name)
                }
            };
            if better {
                winner = Some((view, credit));
            }
        }
        let (view, _) = winner?;
        let name = view.name.clone();
        if let Some(credit) = state.credits.get_mut(&name) {
            *credit -= max_weight;
        }
        Some(name)
    }
}

impl std::fmt::Debug for GroupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("GroupScheduler");
        debug.field("policy", &self.policy);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("cursor", &state.cursor)
                    .field("credit_count", &state.credits.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}
