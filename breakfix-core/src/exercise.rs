use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::ExerciseId;

/// One authored troubleshooting exercise.
///
/// Exercises are immutable once authored. Progression follows
/// [`Exercise::sort_key`], which is a total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Exercise {
    /// Primary key.
    pub id: ExerciseId,
    /// Short title shown to the trainee.
    pub title: String,
    /// Task description (markdown).
    #[serde(default)]
    pub body: String,
    /// Progressive hints, least revealing first.
    #[serde(default)]
    pub hints: Vec<String>,
    /// Rough difficulty rating.
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Position in the progression; ties are broken by `id`.
    pub ordering: i32,
    /// Script that breaks the VM.
    pub fault: ScriptSource,
    /// Script that exits 0 once the trainee has repaired the VM.
    pub check: ScriptSource,
    /// Disabled exercises are skipped by progression.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Exercise {
    /// Create an enabled exercise of medium difficulty.
    #[must_use]
    pub fn new(
        id: ExerciseId,
        title: impl Into<String>,
        ordering: i32,
        fault: ScriptSource,
        check: ScriptSource,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            body: String::new(),
            hints: Vec::new(),
            difficulty: Difficulty::Medium,
            ordering,
            fault,
            check,
            enabled: true,
        }
    }

    /// Builder-style setter for the description.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Builder-style setter for the hints.
    #[must_use]
    pub fn with_hints<I, T>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.hints = hints.into_iter().map(Into::into).collect();
        self
    }

    /// Hint number `step`, counting from zero.
    #[must_use]
    pub fn hint(&self, step: usize) -> Option<&str> {
        self.hints.get(step).map(String::as_str)
    }

    /// Builder-style setter for the difficulty.
    #[must_use]
    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Builder-style setter for the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Total ordering key used for progression.
    #[must_use]
    pub fn sort_key(&self) -> (i32, ExerciseId) {
        (self.ordering, self.id)
    }
}

/// Difficulty rating of an exercise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

/// Where a fault or check script comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    /// Shell text, uploaded to the VM before running.
    Inline(String),
    /// A script that already exists inside the VM image.
    Path(String),
}

impl ScriptSource {
    /// Convenience constructor for inline content.
    pub fn inline(content: impl Into<String>) -> Self {
        Self::Inline(content.into())
    }

    /// Convenience constructor for a pre-installed path.
    pub fn path(path: impl Into<String>) -> Self {
        Self::Path(path.into())
    }
}

/// Whether a script breaks the VM or checks the repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Fault,
    Check,
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault => f.write_str("fault"),
            Self::Check => f.write_str("check"),
        }
    }
}

/// Sort exercises into progression order.
pub fn sort_exercises(exercises: &mut [Exercise]) {
    exercises.sort_by_key(Exercise::sort_key);
}

/// First enabled exercise in progression order.
#[must_use]
pub fn first_enabled(exercises: &[Exercise]) -> Option<&Exercise> {
    exercises
        .iter()
        .filter(|e| e.enabled)
        .min_by_key(|e| e.sort_key())
}

/// The enabled exercise immediately after `current` in progression order.
///
/// `current` itself need not be enabled; its position is still taken from
/// its ordering key.
#[must_use]
pub fn next_enabled<'a>(exercises: &'a [Exercise], current: &Exercise) -> Option<&'a Exercise> {
    let after = current.sort_key();
    exercises
        .iter()
        .filter(|e| e.enabled && e.sort_key() > after)
        .min_by_key(|e| e.sort_key())
}
