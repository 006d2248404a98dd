// Redaction of secret values from step output and log lines.
// One masker is shared by a job and every nested composite or reusable-workflow run under it.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a masked value is found.
const MASK: &str = "***";

/// A cloneable handle to a shared set of masked values.
///
/// Clones share the same underlying set, so a value registered through
/// `::add-mask::` inside a composite action is hidden in the parent job too.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    values: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to redact. Blank values are ignored.
    ///
    /// Multi-line values are also registered line by line since step output
    /// is masked one line at a time.
    pub fn add(&self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }

        let mut values = self.values.write();
        let mut candidates = vec![value];
        if value.contains('\n') {
            candidates.extend(value.lines().map(str::trim).filter(|l| !l.is_empty()));
        }

        for candidate in candidates {
            if !values.iter().any(|v| v == candidate) {
                values.push(candidate.to_string());
            }
        }
        // Longest first so a value that contains another is not partially masked.
        values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Register every value of an iterator, e.g. the configured secrets.
    pub fn add_all<'a>(&self, values: impl IntoIterator<Item = &'a String>) {
        for value in values {
            self.add(value);
        }
    }

    /// Replace every registered value in `input` with `***`.
    pub fn mask(&self, input: &str) -> String {
        let values = self.values.read();
        let mut result = input.to_string();
        for value in values.iter() {
            if result.contains(value.as_str()) {
                result = result.replace(value.as_str(), MASK);
            }
        }
        result
    }

    /// Snapshot of the registered values, longest first.
    pub fn values(&self) -> Vec<String> {
        self.values.read().clone()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}
