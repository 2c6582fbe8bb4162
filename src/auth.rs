//! Access-token gating shared by the HTTP dispatcher and WS actions.
//! Mirrors the teacher's bearer-token extraction/level-check split: token
//! parsing lives here, but the decision of which level a route requires is
//! the caller's.

use std::collections::HashMap;

pub trait AuthChecker: Send + Sync {
    /// The auth level granted by `token`, or `None` if the token is unknown.
    fn level_for(&self, token: &str) -> Option<u32>;

    /// `true` if `token` grants at least `required`.
    fn allows(&self, token: Option<&str>, required: u32) -> bool {
        if required == 0 {
            return true;
        }
        match token.and_then(|t| self.level_for(t)) {
            Some(level) => level >= required,
            None => false,
        }
    }
}

/// Static credential -> level map loaded from config.
pub struct TokenMapAuth {
    tokens: HashMap<String, u32>,
}

impl TokenMapAuth {
    pub fn new(tokens: HashMap<String, u32>) -> Self {
        Self { tokens }
    }
}

impl AuthChecker for TokenMapAuth {
    fn level_for(&self, token: &str) -> Option<u32> {
        self.tokens.get(token).copied()
    }
}

/// Pull a bearer token out of an `Authorization: Bearer <token>` header
/// value, if present.
pub fn bearer_token(header_value: Option<&str>) -> Option<&str> {
    header_value?.strip_prefix("Bearer ")
}
