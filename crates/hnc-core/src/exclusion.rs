//! Exclusion policy: which namespaces never take part in the hierarchy.
//!
//! An excluded namespace cannot be a child (any declared-hierarchy object it
//! has is deleted), cannot be a parent (children naming it get
//! `IllegalParent`), and never carries the inclusion marker label.
//!
//! The set is replaceable at runtime through [`ExclusionPolicy`]. Readers
//! take an [`ExclusionPolicy::snapshot`] at the start of a reconciliation, so
//! a replacement applies to every reconciliation that starts afterwards and
//! never to one already in flight.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;

/// Namespaces excluded when no configuration says otherwise.
pub const DEFAULT_EXCLUDED_NAMESPACES: &[&str] =
    &["hnc-system", "kube-node-lease", "kube-public", "kube-system"];

/// An immutable exclusion rule set.
///
/// Has no `Default`. [`ExclusionSet::empty`] excludes nothing, while
/// [`ExclusionSet::defaults`], which [`ExclusionPolicy::default`] starts
/// from, excludes the system namespaces.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    excluded: BTreeSet<String>,
    included: Option<Regex>,
}

impl ExclusionSet {
    /// Creates a set excluding exactly `names`.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: names.into_iter().map(Into::into).collect(),
            included: None,
        }
    }

    /// Creates a set that excludes nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            excluded: BTreeSet::new(),
            included: None,
        }
    }

    /// Creates the default set ([`DEFAULT_EXCLUDED_NAMESPACES`]).
    #[must_use]
    pub fn defaults() -> Self {
        Self::new(DEFAULT_EXCLUDED_NAMESPACES.iter().copied())
    }

    /// Additionally excludes every name that does not fully match `pattern`.
    ///
    /// # Errors
    ///
    /// Returns the regex error if `pattern` does not compile.
    pub fn with_included_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.included = Some(Regex::new(&format!("^(?:{pattern})$"))?);
        Ok(self)
    }

    /// Returns `true` if `name` must not take part in the hierarchy.
    #[must_use]
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.contains(name) || self.included.as_ref().is_some_and(|re| !re.is_match(name))
    }

    /// Names listed explicitly, sorted.
    pub fn excluded_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.excluded.iter().map(String::as_str)
    }
}

/// Shared, runtime-replaceable handle to the current [`ExclusionSet`].
#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
    current: Arc<RwLock<Arc<ExclusionSet>>>,
}

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self::new(ExclusionSet::defaults())
    }
}

impl ExclusionPolicy {
    /// Creates a policy starting from `set`.
    #[must_use]
    pub fn new(set: ExclusionSet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(set))),
        }
    }

    /// Returns the set in effect right now.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ExclusionSet> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replaces the set, returning the one previously in effect.
    pub fn replace(&self, set: ExclusionSet) -> Arc<ExclusionSet> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(set))
    }
}
