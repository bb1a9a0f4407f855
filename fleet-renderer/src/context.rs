//! Template context: the variable map accumulated along a containment path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fleet_core::types::Variable;

/// Key set from the enclosing host's name.
pub const HOSTNAME_KEY: &str = "hostname";
/// Key set from the enclosing user's name.
pub const USER_KEY: &str = "user";

/// Ordered `key -> value` map used to resolve `{{key}}` placeholders.
///
/// Later insertions win, so callers feed scopes outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Merge a declared variable list; entries override existing keys.
    pub fn extend_from(&mut self, variables: &[Variable]) {
        for v in variables {
            self.vars.insert(v.key.clone(), v.value.clone());
        }
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.insert(HOSTNAME_KEY, hostname);
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.insert(USER_KEY, user);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn user(&self) -> Option<&str> {
        self.get(USER_KEY)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get(HOSTNAME_KEY)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TemplateContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = Self::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_scopes_override_earlier_ones() {
        let mut ctx = TemplateContext::new();
        ctx.extend_from(&[Variable::new("env", "prod"), Variable::new("port", "80")]);
        ctx.extend_from(&[Variable::new("port", "8080")]);
        assert_eq!(ctx.get("env"), Some("prod"));
        assert_eq!(ctx.get("port"), Some("8080"));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn well_known_keys() {
        let mut ctx = TemplateContext::new();
        assert!(ctx.user().is_none());
        ctx.set_user("alice");
        ctx.set_hostname("web1");
        assert_eq!(ctx.user(), Some("alice"));
        assert_eq!(ctx.hostname(), Some("web1"));
    }

    #[test]
    fn serializes_as_plain_map() {
        let ctx: TemplateContext = [("a", "1"), ("b", "2")].into_iter().collect();
        let json = serde_json::to_string(&ctx).expect("serialize");
        assert_eq!(json, r#"{"a":"1","b":"2"}"#);
    }
}
