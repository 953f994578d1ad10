use std::sync::Arc;

use arc_swap::ArcSwap;
use sandfs_protocol::PermissionLevel;
use sandfs_protocol::PermissionRule;
use sandfs_protocol::SandboxError;
use sandfs_protocol::SandboxResult;

use crate::matcher;
use crate::normalize::normalize_checked;

/// Evaluates a path against a rule set and returns its effective
/// [`PermissionLevel`]. Rule updates are swapped behind an `ArcSwap` so every
/// in-flight evaluation sees either the whole old set or the whole new set,
/// never a partial mix (`update_rules` is a single atomic pointer store).
#[derive(Debug)]
pub struct PermissionEngine {
    rules: ArcSwap<Vec<PermissionRule>>,
}

impl PermissionEngine {
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
        }
    }

    /// Atomically replaces the rule set. Evaluations already in flight keep
    /// using the snapshot they loaded at entry.
    pub fn update_rules(&self, rules: Vec<PermissionRule>) {
        self.rules.store(Arc::new(rules));
    }

    pub fn rules(&self) -> Arc<Vec<PermissionRule>> {
        self.rules.load_full()
    }

    /// Returns the effective permission level for `path`. Pure and
    /// deterministic: same (rules, path) always yields the same level, and
    /// permuting the rule list never changes the outcome.
    pub fn evaluate(&self, path: &str) -> PermissionLevel {
        let Ok(path) = normalize_checked(path) else {
            return PermissionLevel::None;
        };
        let rules = self.rules.load();

        let mut best: Option<(i32, u8, usize, usize, PermissionLevel)> = None;
        for (index, rule) in rules.iter().enumerate() {
            if !matcher::matches(&rule.pattern, rule.kind, &path) {
                continue;
            }
            let key = (
                rule.priority,
                rule.kind.rank(),
                matcher::specificity(&rule.pattern, rule.kind),
                index,
            );
            let replace = match &best {
                None => true,
                Some((p, k, s, i, _)) => key >= (*p, *k, *s, *i),
            };
            if replace {
                best = Some((key.0, key.1, key.2, key.3, rule.level));
            }
        }

        let resolved = best.map(|(.., level)| level).unwrap_or(PermissionLevel::None);

        // The mount root has no parent directory to be looked up through, so
        // no rule can ever deny it without also making the mount itself
        // unlistable. Floor it at `view` regardless of what matched.
        if path == "/" && resolved < PermissionLevel::View {
            PermissionLevel::View
        } else {
            resolved
        }
    }

    fn check(&self, path: &str, requested: PermissionLevel) -> SandboxResult<()> {
        let effective = self.evaluate(path);
        if effective.satisfies(requested) {
            Ok(())
        } else {
            Err(SandboxError::Denied {
                path: path.to_string(),
                requested,
                effective,
            })
        }
    }

    pub fn allow_view(&self, path: &str) -> SandboxResult<()> {
        self.check(path, PermissionLevel::View)
    }

    pub fn allow_read(&self, path: &str) -> SandboxResult<()> {
        self.check(path, PermissionLevel::Read)
    }

    pub fn allow_write(&self, path: &str) -> SandboxResult<()> {
        self.check(path, PermissionLevel::Write)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::seq::SliceRandom;
    use sandfs_protocol::PatternKind;

    fn rule(pattern: &str, kind: PatternKind, level: PermissionLevel, priority: i32) -> PermissionRule {
        PermissionRule::new(pattern, kind, level).with_priority(priority)
    }

    #[test]
    fn default_is_deny() {
        let engine = PermissionEngine::new(vec![]);
        assert_eq!(engine.evaluate("/anything"), PermissionLevel::None);
    }

    #[test]
    fn scenario_s1_secret_hidden() {
        let engine = PermissionEngine::new(vec![
            rule("/**/*", PatternKind::Glob, PermissionLevel::Read, 0),
            rule("/secrets/**", PatternKind::Glob, PermissionLevel::None, 0),
        ]);
        assert_eq!(engine.evaluate("/secrets/k"), PermissionLevel::None);
        assert_eq!(engine.evaluate("/readme.md"), PermissionLevel::Read);
    }

    #[test]
    fn mount_root_is_always_at_least_viewable() {
        let engine = PermissionEngine::new(vec![
            rule("/**/*", PatternKind::Glob, PermissionLevel::Read, 0),
            rule("/secrets/**", PatternKind::Glob, PermissionLevel::None, 0),
        ]);
        assert_eq!(engine.evaluate("/"), PermissionLevel::View);
    }

    #[test]
    fn scenario_s2_file_override_inside_denied_directory() {
        let engine = PermissionEngine::new(vec![
            rule("/**/*", PatternKind::Glob, PermissionLevel::Read, 0),
            rule("/secrets/**", PatternKind::Glob, PermissionLevel::None, 0),
            rule(
                "/secrets/public.key",
                PatternKind::File,
                PermissionLevel::Read,
                0,
            ),
        ]);
        assert_eq!(
            engine.evaluate("/secrets/public.key"),
            PermissionLevel::Read
        );
        assert_eq!(engine.evaluate("/secrets/other"), PermissionLevel::None);
    }

    #[test]
    fn rule_order_does_not_affect_outcome() {
        let mut rules = vec![
            rule("/**/*", PatternKind::Glob, PermissionLevel::Read, 0),
            rule("/secrets/**", PatternKind::Glob, PermissionLevel::None, 0),
            rule(
                "/secrets/public.key",
                PatternKind::File,
                PermissionLevel::Read,
                0,
            ),
        ];
        let baseline = PermissionEngine::new(rules.clone());
        let expected_secret = baseline.evaluate("/secrets/other");
        let expected_public = baseline.evaluate("/secrets/public.key");
        let expected_readme = baseline.evaluate("/readme.md");

        let mut rng = rand::rng();
        for _ in 0..20 {
            rules.shuffle(&mut rng);
            let engine = PermissionEngine::new(rules.clone());
            assert_eq!(engine.evaluate("/secrets/other"), expected_secret);
            assert_eq!(engine.evaluate("/secrets/public.key"), expected_public);
            assert_eq!(engine.evaluate("/readme.md"), expected_readme);
        }
    }

    #[test]
    fn priority_beats_kind_rank() {
        let engine = PermissionEngine::new(vec![
            rule("/a", PatternKind::File, PermissionLevel::None, 5),
            rule("/**", PatternKind::Glob, PermissionLevel::Write, 10),
        ]);
        assert_eq!(engine.evaluate("/a"), PermissionLevel::Write);
    }

    #[test]
    fn update_rules_is_visible_to_subsequent_evaluations() {
        let engine = PermissionEngine::new(vec![]);
        assert_eq!(engine.evaluate("/a"), PermissionLevel::None);
        engine.update_rules(vec![rule(
            "/a",
            PatternKind::File,
            PermissionLevel::Write,
            0,
        )]);
        assert_eq!(engine.evaluate("/a"), PermissionLevel::Write);
    }

    #[test]
    fn predicates_report_denied_with_structured_context() {
        let engine = PermissionEngine::new(vec![rule(
            "/meta/**",
            PatternKind::Glob,
            PermissionLevel::View,
            0,
        )]);
        engine.allow_view("/meta/schema.json").unwrap_or_else(|e| panic!("{e}"));
        let err = engine.allow_read("/meta/schema.json").unwrap_err();
        match err {
            SandboxError::Denied {
                requested,
                effective,
                ..
            } => {
                assert_eq!(requested, PermissionLevel::Read);
                assert_eq!(effective, PermissionLevel::View);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn traversal_escape_denies_rather_than_panics() {
        let engine = PermissionEngine::new(vec![rule(
            "/**",
            PatternKind::Glob,
            PermissionLevel::Write,
            0,
        )]);
        assert_eq!(engine.evaluate("/../../etc/passwd"), PermissionLevel::None);
    }
}
