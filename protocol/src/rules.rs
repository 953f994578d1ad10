use serde::Deserialize;
use serde::Serialize;

/// Ordered access level. Each level subsumes every level below it: `Write`
/// implies `Read` implies `View`. The discriminants double as the
/// comparison order relied on throughout the permission engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    None = 0,
    View = 1,
    Read = 2,
    Write = 3,
}

impl PermissionLevel {
    pub fn satisfies(self, requested: PermissionLevel) -> bool {
        self >= requested
    }
}

/// How a rule's `pattern` is interpreted against a normalized path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    File,
    Directory,
    Glob,
}

impl PatternKind {
    /// Tie-break rank used when two rules match a path with the same
    /// priority: `File` is the most specific kind, `Glob` the least.
    pub fn rank(self) -> u8 {
        match self {
            PatternKind::File => 3,
            PatternKind::Directory => 2,
            PatternKind::Glob => 1,
        }
    }
}

/// A single declarative access-control rule.
///
/// `priority` is the first tie-breaker between rules that both match a
/// path; ties in `priority` fall back to [`PatternKind::rank`], then to
/// pattern specificity (see `sandfs_permissions::engine`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub kind: PatternKind,
    pub level: PermissionLevel,
    #[serde(default)]
    pub priority: i32,
}

impl PermissionRule {
    pub fn new(pattern: impl Into<String>, kind: PatternKind, level: PermissionLevel) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
            level,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn permission_level_ordering_is_monotone() {
        assert!(PermissionLevel::Write > PermissionLevel::Read);
        assert!(PermissionLevel::Read > PermissionLevel::View);
        assert!(PermissionLevel::View > PermissionLevel::None);
    }

    #[test]
    fn satisfies_is_reflexive_and_monotone() {
        assert!(PermissionLevel::Write.satisfies(PermissionLevel::Read));
        assert!(PermissionLevel::Read.satisfies(PermissionLevel::Read));
        assert!(!PermissionLevel::View.satisfies(PermissionLevel::Read));
    }

    #[test]
    fn wire_form_uses_lowercase_tags() {
        let rule = PermissionRule::new("/secrets/**", PatternKind::Glob, PermissionLevel::None)
            .with_priority(5);
        let json = serde_json::to_string(&rule).unwrap_or_else(|e| panic!("serialize: {e}"));
        assert_eq!(
            json,
            r#"{"pattern":"/secrets/**","kind":"glob","level":"none","priority":5}"#
        );
    }
}
