//! Route table matching requests to services

use crate::config::RouteConfig;
use tracing::debug;

/// Ordered route table; the first matching route wins
pub struct RouteTable {
    routes: Vec<RouteConfig>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    /// Find the route for a request
    pub fn match_route(&self, method: &str, path: &str) -> Option<&RouteConfig> {
        let route = self
            .routes
            .iter()
            .find(|route| match_path(path, &route.path) && match_method(method, &route.methods));
        if route.is_none() {
            debug!("No route for {} {}", method, path);
        }
        route
    }
}

/// Match a request path against a route pattern
pub fn match_path(path: &str, pattern: &str) -> bool {
    // Exact match
    if pattern == path {
        return true;
    }

    // Prefix match (pattern ends with /)
    if pattern.ends_with('/') && path.starts_with(pattern) {
        return true;
    }

    // Prefix match with wildcard
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path == prefix || path.starts_with(&format!("{}/", prefix));
    }

    false
}

/// Match HTTP method against allowed methods
pub fn match_method(method: &str, allowed_methods: &[String]) -> bool {
    if allowed_methods.is_empty() {
        return true;
    }

    allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
}
