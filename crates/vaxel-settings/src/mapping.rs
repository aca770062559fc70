// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Model resolution: per-mode overrides, then the mapping table.
//!
//! Mapping order is exact match, then the most specific glob (`*`
//! wildcards; specificity = pattern length with `*` removed, ties broken
//! lexicographically), then the configured fallback, then the requested
//! model itself — unless `model_map_strict` turns that last step into a
//! rejection.

use vaxel_wire::GatewayError;

use crate::schema::RuntimeSettings;

/// Match `name` against `pattern` where `*` matches any run of characters.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    // Dynamic-programming walk; patterns are short so this stays cheap.
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let mut dp = vec![vec![false; n.len() + 1]; p.len() + 1];
    dp[0][0] = true;
    for i in 1..=p.len() {
        if p[i - 1] == '*' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=p.len() {
        for j in 1..=n.len() {
            dp[i][j] = if p[i - 1] == '*' {
                dp[i - 1][j] || dp[i][j - 1]
            } else {
                dp[i - 1][j - 1] && p[i - 1] == n[j - 1]
            };
        }
    }
    dp[p.len()][n.len()]
}

fn specificity(pattern: &str) -> usize {
    pattern.chars().filter(|c| *c != '*').count()
}

/// Select the best glob match from `patterns`: longest specificity first,
/// lexicographically smallest on ties.
pub(crate) fn best_glob<'a, I>(patterns: I, name: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    patterns
        .into_iter()
        .filter(|p| p.contains('*') && glob_match(p, name))
        .min_by(|a, b| {
            specificity(b)
                .cmp(&specificity(a))
                .then_with(|| a.cmp(b))
        })
}

/// Resolve `(mode, requested_model)` to the upstream model name.
pub fn resolve_model(
    settings: &RuntimeSettings,
    mode: &str,
    requested: &str,
) -> Result<String, GatewayError> {
    // Step 1: per-mode override.
    let logical = if settings.use_mode_model_override {
        settings
            .mode_models
            .get(mode)
            .filter(|m| !m.is_empty())
            .or_else(|| settings.mode_models.get("default").filter(|m| !m.is_empty()))
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    } else {
        requested.to_string()
    };

    // Step 2: mapping table.
    if let Some(target) = settings.model_mappings.get(&logical) {
        return Ok(target.clone());
    }
    if let Some(pattern) = best_glob(
        settings.model_mappings.keys().map(String::as_str),
        &logical,
    ) {
        return Ok(settings.model_mappings[pattern].clone());
    }
    if let Some(fallback) = &settings.model_map_fallback {
        return Ok(fallback.clone());
    }
    if settings.model_map_strict {
        return Err(GatewayError::InvalidRequest(format!(
            "model {logical:?} has no mapping and strict mapping is enabled"
        )));
    }
    Ok(logical)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RuntimeSettings {
        RuntimeSettings::default()
    }

    #[test]
    fn glob_literal_matches_exactly() {
        assert!(glob_match("gpt-4o", "gpt-4o"));
        assert!(!glob_match("gpt-4o", "gpt-4o-mini"));
    }

    #[test]
    fn glob_star_matches_any_run() {
        assert!(glob_match("claude-*", "claude-3-5-sonnet"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*-mini", "gpt-4o-mini"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("claude-*", "gpt-4o"));
    }

    #[test]
    fn identity_when_no_mapping() {
        let got = resolve_model(&settings(), "chat", "claude-test").unwrap();
        assert_eq!(got, "claude-test");
    }

    #[test]
    fn exact_mapping_wins_over_glob() {
        let mut s = settings();
        s.model_mappings.insert("gpt-4o".into(), "exact-target".into());
        s.model_mappings.insert("gpt-*".into(), "glob-target".into());
        assert_eq!(resolve_model(&s, "chat", "gpt-4o").unwrap(), "exact-target");
    }

    #[test]
    fn longest_specificity_glob_wins() {
        let mut s = settings();
        s.model_mappings.insert("gpt-*".into(), "short".into());
        s.model_mappings.insert("gpt-4o-*".into(), "long".into());
        assert_eq!(resolve_model(&s, "chat", "gpt-4o-mini").unwrap(), "long");
    }

    #[test]
    fn specificity_tie_breaks_lexicographically() {
        let mut s = settings();
        // Both have specificity 4 and match "abcd".
        s.model_mappings.insert("abc*d".into(), "first".into());
        s.model_mappings.insert("abcd*".into(), "second".into());
        assert_eq!(resolve_model(&s, "chat", "abcd").unwrap(), "first");
    }

    #[test]
    fn fallback_applies_when_nothing_matches() {
        let mut s = settings();
        s.model_mappings.insert("known".into(), "upstream".into());
        s.model_map_fallback = Some("default-upstream".into());
        assert_eq!(
            resolve_model(&s, "chat", "unknown-model").unwrap(),
            "default-upstream"
        );
    }

    #[test]
    fn strict_mode_rejects_unmapped_model() {
        let mut s = settings();
        s.model_map_strict = true;
        s.model_mappings.insert("known".into(), "upstream".into());
        let err = resolve_model(&s, "chat", "unknown-model").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn strict_mode_allows_mapped_model() {
        let mut s = settings();
        s.model_map_strict = true;
        s.model_mappings.insert("known".into(), "upstream".into());
        assert_eq!(resolve_model(&s, "chat", "known").unwrap(), "upstream");
    }

    #[test]
    fn mode_override_applies_before_mapping() {
        let mut s = settings();
        s.use_mode_model_override = true;
        s.mode_models.insert("plan".into(), "planner-model".into());
        s.model_mappings
            .insert("planner-model".into(), "planner-upstream".into());
        assert_eq!(
            resolve_model(&s, "plan", "whatever").unwrap(),
            "planner-upstream"
        );
    }

    #[test]
    fn mode_override_falls_back_to_default_key() {
        let mut s = settings();
        s.use_mode_model_override = true;
        s.mode_models.insert("default".into(), "std-model".into());
        assert_eq!(resolve_model(&s, "chat", "whatever").unwrap(), "std-model");
    }

    #[test]
    fn mode_override_disabled_is_ignored() {
        let mut s = settings();
        s.mode_models.insert("chat".into(), "override".into());
        assert_eq!(resolve_model(&s, "chat", "asked").unwrap(), "asked");
    }
}
