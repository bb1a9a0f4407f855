//! # fleet-renderer
//!
//! `{{key}}` placeholder interpolation for configuration content.
//!
//! ## Usage
//!
//! ```rust
//! use fleet_renderer::{Interpolator, TemplateContext};
//!
//! let mut ctx = TemplateContext::new();
//! ctx.set_user("alice");
//! ctx.set_hostname("web1");
//! assert_eq!(Interpolator::render("{{user}}/{{hostname}}", &ctx), "alice/web1");
//! ```

pub mod context;
pub mod engine;

pub use context::TemplateContext;
pub use engine::{apply_templates, Interpolator, DEFAULT_OWNER};
