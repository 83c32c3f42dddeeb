//! Username-template expansion for proxy providers.
//!
//! Recognized tokens:
//!   {COUNTRY}    upper-cased country code
//!   {country}    lower-cased country code
//!   {random:N}   N fresh alphanumerics per expansion
//!   {session:N}  N alphanumerics, stable across one selector pass

use std::collections::HashMap;

use rand::distr::Alphanumeric;
use rand::Rng;

/// Expansion context for one selector pass: session tokens are generated on
/// first use and reused so every provider in the pass shares the session.
#[derive(Debug, Default)]
pub struct ExpandCtx {
    pub country: String,
    sessions: HashMap<usize, String>,
}

impl ExpandCtx {
    pub fn new(country: &str) -> Self {
        Self {
            country: country.to_string(),
            sessions: HashMap::new(),
        }
    }

    pub fn expand(&mut self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                // Unbalanced brace: emit verbatim.
                out.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let token = &after[..close];
            match self.substitute(token) {
                Some(s) => out.push_str(&s),
                None => {
                    out.push('{');
                    out.push_str(token);
                    out.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }

    fn substitute(&mut self, token: &str) -> Option<String> {
        if token == "COUNTRY" {
            return Some(self.country.to_ascii_uppercase());
        }
        if token == "country" {
            return Some(self.country.to_ascii_lowercase());
        }
        if let Some(n) = token.strip_prefix("random:").and_then(|s| s.parse::<usize>().ok()) {
            return Some(random_token(n));
        }
        if let Some(n) = token.strip_prefix("session:").and_then(|s| s.parse::<usize>().ok()) {
            let tok = self
                .sessions
                .entry(n)
                .or_insert_with(|| random_token(n))
                .clone();
            return Some(tok);
        }
        None
    }
}

fn random_token(n: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}
