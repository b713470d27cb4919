//! Explicit queue-name scoping for publishes.

/// Queue used when neither the call, the scope nor the per-type resolver
/// names one.
pub const DEFAULT_QUEUE: &str = "messenger.default";

/// Queue failed messages are moved back into for another attempt.
pub const RETRY_FAILED_QUEUE: &str = "messenger.retry.failed";

/// A nested queue-name override.
///
/// Scopes are plain values: entering a scope returns a new value and leaves
/// the outer one untouched, so leaving a scope is simply dropping it.
///
/// ```
/// use fatqueue::QueueScope;
///
/// let outer = QueueScope::root().enter("reports");
/// let inner = outer.enter("reports.slow");
/// assert_eq!(inner.current(), Some("reports.slow"));
/// assert_eq!(outer.current(), Some("reports"));
/// assert_eq!(QueueScope::root().current(), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueScope {
    names: Vec<String>,
}

impl QueueScope {
    /// The empty scope.
    pub fn root() -> Self {
        Self::default()
    }

    /// A nested scope redirecting publishes to `queue_name`.
    pub fn enter(&self, queue_name: impl Into<String>) -> Self {
        let mut names = self.names.clone();
        names.push(queue_name.into());
        Self { names }
    }

    /// The innermost queue name, if any scope was entered.
    pub fn current(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    /// Nesting depth.
    pub fn depth(&self) -> usize {
        self.names.len()
    }
}

/// A queue named at the publish call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueTarget {
    /// Queue name. Blank names fall through to the next resolution step.
    pub name: Option<String>,
    /// Publish to `name` even inside a [`QueueScope`].
    pub ignore_scope: bool,
}

impl QueueTarget {
    /// Publish to `name` unless a scope redirects it.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ignore_scope: false,
        }
    }

    /// Publish to `name` regardless of any scope.
    pub fn exactly(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ignore_scope: true,
        }
    }

    /// Resolve the effective queue name.
    ///
    /// The call-site name wins only when it opts out of scoping; otherwise
    /// the innermost scope wins, then the call-site name, then `default_for`,
    /// then [`DEFAULT_QUEUE`].
    pub(crate) fn resolve(
        &self,
        scope: &QueueScope,
        default_for: impl FnOnce() -> Option<String>,
    ) -> String {
        let mut name = self.name.clone();

        if !self.ignore_scope {
            if let Some(scoped) = scope.current() {
                name = Some(scoped.to_string());
            }
        }

        name.filter(|name| !name.trim().is_empty())
            .or_else(|| default_for().filter(|name| !name.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string())
    }
}

impl From<&str> for QueueTarget {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for QueueTarget {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none() -> Option<String> {
        None
    }

    #[test]
    fn scope_overrides_a_plain_name() {
        let scope = QueueScope::root().enter("scoped");
        assert_eq!(QueueTarget::named("explicit").resolve(&scope, none), "scoped");
    }

    #[test]
    fn ignoring_the_scope_keeps_the_explicit_name() {
        let scope = QueueScope::root().enter("scoped");
        assert_eq!(QueueTarget::exactly("explicit").resolve(&scope, none), "explicit");
    }

    #[test]
    fn blank_names_fall_back_to_the_type_default_then_the_constant() {
        let scope = QueueScope::root();
        let target = QueueTarget::named("  ");
        assert_eq!(
            target.resolve(&scope, || Some("per-type".to_string())),
            "per-type"
        );
        assert_eq!(target.resolve(&scope, none), DEFAULT_QUEUE);
    }
}
