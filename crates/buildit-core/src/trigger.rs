//! Recurring triggers and the per-project trigger set.
//!
//! A [`TriggerSet`] holds at most one trigger per [`TriggerKind`]. Adding a
//! trigger of a kind that is already present replaces it. Persisted sets are
//! always read back through [`TriggerSet::load_legacy`], which accepts the
//! current canonical list as well as older unordered lists with repeated or
//! externally tagged entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::BuildResult;

/// Kind of a trigger, used as the key of a [`TriggerSet`].
///
/// The declaration order is the listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Timer,
    Scm,
    Upstream,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Timer => "timer",
            TriggerKind::Scm => "scm",
            TriggerKind::Upstream => "upstream",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(TriggerKind::Timer),
            "scm" | "scm-poll" => Ok(TriggerKind::Scm),
            "upstream" => Ok(TriggerKind::Upstream),
            other => Err(TriggerError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("unknown trigger kind: {0}")]
    UnknownKind(String),

    #[error("invalid schedule '{spec}': {message}")]
    InvalidSchedule { spec: String, message: String },

    #[error("malformed trigger entry: {0}")]
    Malformed(String),

    #[error("upstream trigger lists no projects")]
    NoUpstreamProjects,
}

/// A rule that requests builds automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Trigger {
    /// Build periodically on a crontab schedule.
    Timer { spec: String },
    /// Poll the SCM on a crontab schedule and build on change.
    Scm { spec: String },
    /// Build after any of the listed projects finishes with a good enough result.
    Upstream {
        projects: Vec<String>,
        #[serde(default = "default_threshold")]
        threshold: BuildResult,
    },
}

fn default_threshold() -> BuildResult {
    BuildResult::Success
}

impl Trigger {
    pub fn timer(spec: impl Into<String>) -> Self {
        Trigger::Timer { spec: spec.into() }
    }

    pub fn scm(spec: impl Into<String>) -> Self {
        Trigger::Scm { spec: spec.into() }
    }

    pub fn upstream(projects: Vec<String>, threshold: BuildResult) -> Self {
        Trigger::Upstream {
            projects,
            threshold,
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Timer { .. } => TriggerKind::Timer,
            Trigger::Scm { .. } => TriggerKind::Scm,
            Trigger::Upstream { .. } => TriggerKind::Upstream,
        }
    }

    /// Crontab spec for schedule-driven triggers.
    pub fn spec(&self) -> Option<&str> {
        match self {
            Trigger::Timer { spec } | Trigger::Scm { spec } => Some(spec),
            Trigger::Upstream { .. } => None,
        }
    }

    /// Activate the trigger for a project. `seed` resolves `H` fields.
    pub fn start(&self, seed: &str) -> Result<TriggerSchedule, TriggerError> {
        match self {
            Trigger::Timer { spec } | Trigger::Scm { spec } => {
                let expr = crontab_to_cron(spec, seed)?;
                let schedule = cron::Schedule::from_str(&expr).map_err(|e| {
                    TriggerError::InvalidSchedule {
                        spec: spec.clone(),
                        message: e.to_string(),
                    }
                })?;
                Ok(TriggerSchedule::Cron(Box::new(schedule)))
            }
            Trigger::Upstream { projects, .. } => {
                if projects.is_empty() {
                    return Err(TriggerError::NoUpstreamProjects);
                }
                Ok(TriggerSchedule::OnUpstream)
            }
        }
    }
}

/// Parsed activation state of a started trigger.
#[derive(Debug, Clone)]
pub enum TriggerSchedule {
    Cron(Box<cron::Schedule>),
    OnUpstream,
}

impl TriggerSchedule {
    /// True when the schedule has an occurrence in `(from, to]`.
    pub fn fires_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        match self {
            TriggerSchedule::Cron(schedule) => schedule
                .after(&from)
                .next()
                .is_some_and(|next| next <= to),
            TriggerSchedule::OnUpstream => false,
        }
    }
}

/// Activation state of one entry.
#[derive(Debug, Clone)]
pub enum Activation {
    /// Not started yet.
    Idle,
    Armed(TriggerSchedule),
    /// Starting failed; the trigger stays configured but never fires.
    Faulted(String),
}

#[derive(Debug, Clone)]
struct Entry {
    trigger: Trigger,
    activation: Activation,
}

/// Typed collection of triggers, at most one per kind.
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    entries: BTreeMap<TriggerKind, Entry>,
    seed: Option<String>,
}

impl TriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from triggers in order; later triggers of a kind win.
    pub fn from_triggers(triggers: impl IntoIterator<Item = Trigger>) -> Self {
        let mut set = Self::new();
        for trigger in triggers {
            set.add(trigger);
        }
        set
    }

    /// Normalize a persisted trigger list.
    ///
    /// Each element is read on its own: canonical entries carry a `kind`
    /// field, legacy entries are single-key objects named after their kind.
    /// Unreadable elements are logged and skipped.
    pub fn load_legacy(entries: Vec<serde_json::Value>) -> Self {
        let mut set = Self::new();
        for (index, value) in entries.into_iter().enumerate() {
            match trigger_from_value(value) {
                Ok(trigger) => {
                    set.add(trigger);
                }
                Err(e) => warn!(index, error = %e, "Skipping unreadable trigger entry"),
            }
        }
        set
    }

    /// Add a trigger, replacing and returning any trigger of the same kind.
    pub fn add(&mut self, trigger: Trigger) -> Option<Trigger> {
        let activation = match &self.seed {
            Some(seed) => activate(&trigger, seed),
            None => Activation::Idle,
        };
        self.entries
            .insert(
                trigger.kind(),
                Entry {
                    trigger,
                    activation,
                },
            )
            .map(|old| old.trigger)
    }

    /// Remove the trigger of `kind`, if any.
    pub fn remove(&mut self, kind: TriggerKind) -> Option<Trigger> {
        self.entries.remove(&kind).map(|e| e.trigger)
    }

    pub fn get(&self, kind: TriggerKind) -> Option<&Trigger> {
        self.entries.get(&kind).map(|e| &e.trigger)
    }

    /// Triggers in kind order.
    pub fn list(&self) -> Vec<&Trigger> {
        self.entries.values().map(|e| &e.trigger).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Activate every trigger. A failing trigger is logged and marked
    /// faulted; the others are still armed.
    pub fn start(&mut self, seed: &str) {
        self.seed = Some(seed.to_string());
        for entry in self.entries.values_mut() {
            entry.activation = activate(&entry.trigger, seed);
        }
    }

    /// Disarm all triggers.
    pub fn stop(&mut self) {
        self.seed = None;
        for entry in self.entries.values_mut() {
            entry.activation = Activation::Idle;
        }
    }

    pub fn activation(&self, kind: TriggerKind) -> Option<&Activation> {
        self.entries.get(&kind).map(|e| &e.activation)
    }

    /// Armed triggers with their schedules.
    pub fn armed(&self) -> impl Iterator<Item = (&Trigger, &TriggerSchedule)> {
        self.entries.values().filter_map(|e| match &e.activation {
            Activation::Armed(schedule) => Some((&e.trigger, schedule)),
            _ => None,
        })
    }
}

fn activate(trigger: &Trigger, seed: &str) -> Activation {
    match trigger.start(seed) {
        Ok(schedule) => Activation::Armed(schedule),
        Err(e) => {
            warn!(kind = %trigger.kind(), error = %e, "Failed to start trigger");
            Activation::Faulted(e.to_string())
        }
    }
}

fn trigger_from_value(value: serde_json::Value) -> Result<Trigger, TriggerError> {
    let serde_json::Value::Object(mut map) = value else {
        return Err(TriggerError::Malformed("entry is not an object".to_string()));
    };
    if !map.contains_key("kind") {
        if map.len() != 1 {
            return Err(TriggerError::Malformed(
                "entry has neither a kind nor a single tag".to_string(),
            ));
        }
        let Some((tag, body)) = map.into_iter().next() else {
            return Err(TriggerError::Malformed("empty entry".to_string()));
        };
        let kind: TriggerKind = tag.parse()?;
        let mut body = match body {
            serde_json::Value::Object(body) => body,
            serde_json::Value::String(spec) => {
                let mut body = serde_json::Map::new();
                body.insert("spec".to_string(), serde_json::Value::String(spec));
                body
            }
            _ => return Err(TriggerError::Malformed(format!("bad body for '{tag}'"))),
        };
        body.insert(
            "kind".to_string(),
            serde_json::Value::String(kind.as_str().to_string()),
        );
        map = body;
    }
    serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| TriggerError::Malformed(e.to_string()))
}

impl PartialEq for TriggerSet {
    fn eq(&self, other: &Self) -> bool {
        self.list() == other.list()
    }
}

impl Serialize for TriggerSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.values().map(|e| &e.trigger))
    }
}

impl<'de> Deserialize<'de> for TriggerSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
        Ok(TriggerSet::load_legacy(raw))
    }
}

// Field ranges of a five-field crontab line.
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

/// Convert a five-field crontab spec (with `H` hashing) into the
/// seconds-first form understood by the `cron` crate.
pub fn crontab_to_cron(spec: &str, seed: &str) -> Result<String, TriggerError> {
    let invalid = |message: &str| TriggerError::InvalidSchedule {
        spec: spec.to_string(),
        message: message.to_string(),
    };

    let fields: Vec<&str> = spec.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid("expected five fields"));
    }

    let hash = fnv1a(seed);
    let mut out = vec!["0".to_string()];
    for (i, (field, (lo, hi))) in fields.iter().zip(FIELD_RANGES).enumerate() {
        let resolved = resolve_hash(field, lo, hi, hash.rotate_left(i as u32 * 7))
            .ok_or_else(|| invalid(&format!("bad H expression '{field}'")))?;
        let resolved = if i == 4 {
            shift_day_of_week(&resolved)
        } else {
            resolved
        };
        out.push(resolved);
    }
    Ok(out.join(" "))
}

fn resolve_hash(field: &str, lo: u32, hi: u32, hash: u64) -> Option<String> {
    let Some(rest) = field.strip_prefix('H') else {
        return Some(field.to_string());
    };

    let (lo, hi, rest) = match rest.strip_prefix('(') {
        Some(range) => {
            let (range, rest) = range.split_once(')')?;
            let (a, b) = range.split_once('-')?;
            let (a, b): (u32, u32) = (a.trim().parse().ok()?, b.trim().parse().ok()?);
            if a > b || a < lo || b > hi {
                return None;
            }
            (a, b, rest)
        }
        None => (lo, hi, rest),
    };

    if rest.is_empty() {
        let span = u64::from(hi - lo + 1);
        return Some((lo + (hash % span) as u32).to_string());
    }

    let step: u32 = rest.strip_prefix('/')?.parse().ok()?;
    if step == 0 {
        return None;
    }
    let start = lo + (hash % u64::from(step)) as u32;
    if start > hi {
        return Some(lo.to_string());
    }
    Some(format!("{start}-{hi}/{step}"))
}

// crontab counts Sunday as 0 or 7, the `cron` crate as 1. Numeric parts
// are expanded to the days they select and renumbered, so a step keeps
// landing on the same weekdays.
fn shift_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(shift_day_part)
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day_part(part: &str) -> String {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => match step.parse::<u32>() {
            Ok(step) if step > 0 => (range, step),
            _ => return part.to_string(),
        },
        None => (part, 1),
    };
    if range == "*" && step == 1 {
        return part.to_string();
    }

    let bounds = match range {
        "*" => Some((0, 6)),
        _ => match range.split_once('-') {
            Some((a, b)) => a.parse::<u32>().ok().zip(b.parse::<u32>().ok()),
            // `a/step` runs to the end of the week.
            None if step > 1 => range.parse::<u32>().ok().map(|a| (a, 6)),
            None => range.parse::<u32>().ok().map(|a| (a, a)),
        },
    };
    let Some((lo, hi)) = bounds.filter(|(lo, hi)| lo <= hi && *hi <= 7) else {
        return part.to_string();
    };

    let days: BTreeSet<u32> = (lo..=hi)
        .step_by(step as usize)
        .map(|day| (day % 7) + 1)
        .collect();
    days.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
