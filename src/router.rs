//! Component F: route resolver (spec §4.F). Resolution is tried in a fixed
//! order: proxy rule, static HTTP route, static WS route, regex HTTP
//! routes, regex WS routes. The first match wins.

use std::collections::HashMap;

use regex::Regex;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub enum Target {
    Http(String),
    WebSocket(String),
}

#[derive(Debug, Clone)]
pub struct ProxyRule {
    pub prefix: String,
    pub upstream_app: String,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub target: Target,
    /// Named path variables captured from a regex route, in declaration
    /// order for unnamed groups and by name for named ones.
    pub vars: HashMap<String, String>,
    /// Minimum credential level required to invoke this route (service
    /// descriptor's `auth_level`, spec §3). 0 means no auth gate.
    pub auth_level: u32,
}

struct StaticRoute {
    handler: String,
    auth_level: u32,
}

struct RegexRoute {
    pattern: Regex,
    target_template: Target,
    var_names: Vec<String>,
    auth_level: u32,
}

#[derive(Default)]
pub struct RouteResolver {
    proxy_rules: Vec<ProxyRule>,
    static_http: HashMap<String, StaticRoute>,
    static_ws: HashMap<String, StaticRoute>,
    regex_http: Vec<RegexRoute>,
    regex_ws: Vec<RegexRoute>,
}

impl RouteResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_proxy_rule(&mut self, prefix: impl Into<String>, upstream_app: impl Into<String>) {
        self.proxy_rules.push(ProxyRule {
            prefix: prefix.into(),
            upstream_app: upstream_app.into(),
        });
    }

    pub fn add_static_http(
        &mut self,
        path: impl Into<String>,
        handler: impl Into<String>,
        auth_level: u32,
    ) -> Result<(), ConfigError> {
        let path = path.into();
        if self.static_http.contains_key(&path) {
            return Err(ConfigError::DuplicateRoute(path));
        }
        self.static_http.insert(
            path,
            StaticRoute {
                handler: handler.into(),
                auth_level,
            },
        );
        Ok(())
    }

    pub fn add_static_ws(
        &mut self,
        path: impl Into<String>,
        handler: impl Into<String>,
        auth_level: u32,
    ) -> Result<(), ConfigError> {
        let path = path.into();
        if self.static_ws.contains_key(&path) {
            return Err(ConfigError::DuplicateRoute(path));
        }
        self.static_ws.insert(
            path,
            StaticRoute {
                handler: handler.into(),
                auth_level,
            },
        );
        Ok(())
    }

    /// Register a regex route. Patterns with zero capture groups are
    /// rejected: a route with no variables to bind should be declared
    /// `add_static_http`/`add_static_ws` instead, so the resolution order
    /// stays cheap and predictable for the common case.
    pub fn add_regex_http(
        &mut self,
        pattern: &str,
        handler: impl Into<String>,
        var_names: Vec<String>,
        auth_level: u32,
    ) -> Result<(), ConfigError> {
        let route =
            Self::build_regex_route(pattern, Target::Http(handler.into()), var_names, auth_level)?;
        self.regex_http.push(route);
        Ok(())
    }

    pub fn add_regex_ws(
        &mut self,
        pattern: &str,
        handler: impl Into<String>,
        var_names: Vec<String>,
        auth_level: u32,
    ) -> Result<(), ConfigError> {
        let route = Self::build_regex_route(
            pattern,
            Target::WebSocket(handler.into()),
            var_names,
            auth_level,
        )?;
        self.regex_ws.push(route);
        Ok(())
    }

    fn build_regex_route(
        pattern: &str,
        target_template: Target,
        var_names: Vec<String>,
        auth_level: u32,
    ) -> Result<RegexRoute, ConfigError> {
        let compiled = Regex::new(pattern).map_err(|source| ConfigError::InvalidRegexRoute {
            path: pattern.to_string(),
            source,
        })?;
        if compiled.captures_len() <= 1 {
            return Err(ConfigError::RegexRouteWithoutCaptures(pattern.to_string()));
        }
        Ok(RegexRoute {
            pattern: compiled,
            target_template,
            var_names,
            auth_level,
        })
    }

    /// Resolve `path` following the fixed order: proxy rule, static HTTP,
    /// static WS, regex HTTP, regex WS.
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        if let Some(rule) = self.proxy_rules.iter().find(|r| path.starts_with(&r.prefix)) {
            return Some(Resolved {
                target: Target::Http(rule.upstream_app.clone()),
                vars: HashMap::new(),
                auth_level: 0,
            });
        }
        if let Some(route) = self.static_http.get(path) {
            return Some(Resolved {
                target: Target::Http(route.handler.clone()),
                vars: HashMap::new(),
                auth_level: route.auth_level,
            });
        }
        if let Some(route) = self.static_ws.get(path) {
            return Some(Resolved {
                target: Target::WebSocket(route.handler.clone()),
                vars: HashMap::new(),
                auth_level: route.auth_level,
            });
        }
        if let Some(resolved) = Self::match_regex_routes(&self.regex_http, path) {
            return Some(resolved);
        }
        if let Some(resolved) = Self::match_regex_routes(&self.regex_ws, path) {
            return Some(resolved);
        }
        None
    }

    fn match_regex_routes(routes: &[RegexRoute], path: &str) -> Option<Resolved> {
        for route in routes {
            if let Some(caps) = route.pattern.captures(path) {
                let mut vars = HashMap::new();
                for (i, name) in route.var_names.iter().enumerate() {
                    if let Some(m) = caps.get(i + 1) {
                        vars.insert(name.clone(), m.as_str().to_string());
                    }
                }
                return Some(Resolved {
                    target: route.target_template.clone(),
                    vars,
                    auth_level: route.auth_level,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod router_test {
    use super::*;

    #[test]
    fn proxy_rule_wins_over_everything_else() {
        let mut r = RouteResolver::new();
        r.add_proxy_rule("/api/", "billing");
        r.add_static_http("/api/health", "health", 0).unwrap();
        let resolved = r.resolve("/api/health").unwrap();
        assert!(matches!(resolved.target, Target::Http(ref h) if h == "billing"));
    }

    #[test]
    fn static_http_before_regex() {
        let mut r = RouteResolver::new();
        r.add_static_http("/users/me", "whoami", 0).unwrap();
        r.add_regex_http(r"^/users/(\w+)$", "get_user", vec!["id".into()], 0)
            .unwrap();
        let resolved = r.resolve("/users/me").unwrap();
        assert!(matches!(resolved.target, Target::Http(ref h) if h == "whoami"));
    }

    #[test]
    fn regex_http_captures_path_variable() {
        let mut r = RouteResolver::new();
        r.add_regex_http(r"^/users/(\w+)$", "get_user", vec!["id".into()], 0)
            .unwrap();
        let resolved = r.resolve("/users/42").unwrap();
        assert_eq!(resolved.vars.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn static_ws_resolved_before_regex_ws() {
        let mut r = RouteResolver::new();
        r.add_static_ws("/ws/chat", "chat_handler", 0).unwrap();
        let resolved = r.resolve("/ws/chat").unwrap();
        assert!(matches!(resolved.target, Target::WebSocket(ref h) if h == "chat_handler"));
    }

    #[test]
    fn zero_capture_regex_is_rejected() {
        let mut r = RouteResolver::new();
        let err = r
            .add_regex_http(r"^/users/\w+$", "get_user", vec![], 0)
            .unwrap_err();
        assert!(matches!(err, ConfigError::RegexRouteWithoutCaptures(_)));
    }

    #[test]
    fn unmatched_path_resolves_to_none() {
        let r = RouteResolver::new();
        assert!(r.resolve("/nope").is_none());
    }

    #[test]
    fn duplicate_static_route_is_rejected() {
        let mut r = RouteResolver::new();
        r.add_static_http("/health", "health", 0).unwrap();
        let err = r.add_static_http("/health", "other", 0).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRoute(_)));
    }

    #[test]
    fn auth_level_is_carried_through_resolution() {
        let mut r = RouteResolver::new();
        r.add_static_http("/admin", "admin_handler", 5).unwrap();
        let resolved = r.resolve("/admin").unwrap();
        assert_eq!(resolved.auth_level, 5);
    }
}
