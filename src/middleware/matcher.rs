//! Method-selector dispatch for per-message middleware
//!
//! Selectors are either a literal full method name or a `prefix*` pattern.
//! Literals win over prefixes; among prefixes the longest match wins, which
//! the descending sort on insert makes a first-match scan.

use super::Middleware;
use std::collections::HashMap;

/// Selector-based middleware table.
#[derive(Clone, Default)]
pub struct Matcher {
    prefixes: Vec<String>,
    defaults: Vec<Middleware>,
    selectors: HashMap<String, Vec<Middleware>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the middleware applied to every method.
    pub fn use_default(&mut self, middleware: Vec<Middleware>) {
        self.defaults = middleware;
    }

    /// Register middleware for a selector: a literal method name, or a
    /// `prefix*` pattern matched against the start of the method.
    pub fn add(&mut self, selector: &str, middleware: Vec<Middleware>) {
        let selector = match selector.strip_suffix('*') {
            Some(prefix) => {
                self.prefixes.push(prefix.to_string());
                // Longest prefix first:
                //  - /foo/bar
                //  - /foo
                self.prefixes.sort_by(|a, b| b.cmp(a));
                prefix.to_string()
            }
            None => selector.to_string(),
        };
        self.selectors.insert(selector, middleware);
    }

    /// Middleware for a method: defaults plus the literal hit, else defaults
    /// plus the longest matching prefix, else just the defaults.
    pub fn matches(&self, method: &str) -> Vec<Middleware> {
        let mut out = self.defaults.clone();
        if let Some(hit) = self.selectors.get(method) {
            out.extend(hit.iter().cloned());
            return out;
        }
        for prefix in &self.prefixes {
            if method.starts_with(prefix.as_str()) {
                if let Some(hit) = self.selectors.get(prefix) {
                    out.extend(hit.iter().cloned());
                }
                return out;
            }
        }
        out
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("defaults", &self.defaults.len())
            .field("selectors", &self.selectors.len())
            .field("prefixes", &self.prefixes)
            .finish()
    }
}
