//! Placeholder engine: [`Interpolator`] and the per-class template step.
//!
//! Placeholders use the `{{key}}` form (surrounding whitespace inside the
//! braces is allowed). A placeholder whose key is not in the context is left
//! in the output verbatim; rendering never fails.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use fleet_core::types::ObjectContent;

use crate::context::TemplateContext;

/// Owner/group used for files when no user scope supplies one.
pub const DEFAULT_OWNER: &str = "root";

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}";

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is a valid regex")
    })
}

// ---------------------------------------------------------------------------
// Interpolator
// ---------------------------------------------------------------------------

/// Pure `{{key}}` substitution over strings.
pub struct Interpolator;

impl Interpolator {
    /// Substitute every resolvable placeholder in `template`.
    pub fn render(template: &str, ctx: &TemplateContext) -> String {
        Self::render_cow(template, ctx).into_owned()
    }

    /// Like [`Interpolator::render`], borrowing when nothing was replaced.
    fn render_cow<'a>(template: &'a str, ctx: &TemplateContext) -> Cow<'a, str> {
        placeholder().replace_all(template, |caps: &Captures<'_>| {
            match ctx.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
    }

    /// Keys referenced by `template` that `ctx` cannot resolve.
    pub fn unresolved(template: &str, ctx: &TemplateContext) -> Vec<String> {
        let mut keys: Vec<String> = placeholder()
            .captures_iter(template)
            .map(|caps| caps[1].to_string())
            .filter(|key| ctx.get(key).is_none())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

// ---------------------------------------------------------------------------
// Template step
// ---------------------------------------------------------------------------

/// Resolve the desired content of a unit against its variable scope.
///
/// - files: `path` and `data` are interpolated; empty `user`/`group` fall back
///   to the scope's `user` variable, then to [`DEFAULT_OWNER`]
/// - users: the login name is forced to the unit's display name
/// - every other class passes through unchanged
pub fn apply_templates(
    content: ObjectContent,
    unit_name: &str,
    ctx: &TemplateContext,
) -> ObjectContent {
    match content {
        ObjectContent::File(mut file) => {
            file.path = Interpolator::render(&file.path, ctx);
            file.data = Interpolator::render(&file.data, ctx);
            let owner = ctx.user().unwrap_or(DEFAULT_OWNER);
            if file.user.is_empty() {
                file.user = owner.to_string();
            }
            if file.group.is_empty() {
                file.group = owner.to_string();
            }
            ObjectContent::File(file)
        }
        ObjectContent::User(mut user) => {
            user.name = Some(unit_name.to_string());
            ObjectContent::User(user)
        }
        other @ (ObjectContent::Root(_)
        | ObjectContent::Host(_)
        | ObjectContent::Group(_)
        | ObjectContent::Package(_)
        | ObjectContent::Collection(_)
        | ObjectContent::FirewallRule(_)) => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
