/// Request routing for the edge gateway
use anyhow::{anyhow, Result};
use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RouteConfig;

/// Compiled route with a regex pattern for efficient matching
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    /// Original route configuration
    pub config: RouteConfig,
    /// Compiled path regex pattern
    path_regex: Regex,
    /// Literal prefix of the pattern, up to the first wildcard
    literal_prefix: String,
    /// Number of wildcard segments in the pattern
    wildcard_count: usize,
}

impl CompiledRoute {
    /// Create a new compiled route from configuration
    pub fn new(config: RouteConfig) -> Result<Self> {
        let regex_pattern = glob_to_regex(&config.path)?;
        let path_regex = Regex::new(&regex_pattern)
            .map_err(|e| anyhow!("Failed to compile path pattern '{}': {}", config.path, e))?;

        let literal_prefix = literal_prefix(&config.path).to_string();
        let wildcard_count = config.path.matches('*').count();

        Ok(Self {
            config,
            path_regex,
            literal_prefix,
            wildcard_count,
        })
    }

    /// Check if this route matches the given request path
    pub fn matches(&self, path: &str) -> bool {
        // Cheap prefix rejection before the regex
        if !path.starts_with(&self.literal_prefix) {
            return false;
        }
        self.path_regex.is_match(path)
    }

    /// Rewrite an inbound path for the upstream, removing the configured
    /// number of leading segments. Stripping every segment yields "/".
    pub fn upstream_path(&self, path: &str) -> String {
        let strip = self.config.strip_prefix_segments;
        if strip == 0 {
            return path.to_string();
        }

        let remainder: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(strip)
            .collect();

        if remainder.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", remainder.join("/"))
        }
    }
}

/// Route table holding compiled routes in specificity order
pub struct RouteTable {
    /// Compiled routes, most specific first
    routes: Vec<Arc<CompiledRoute>>,
    /// Route lookup by ID
    route_by_id: HashMap<String, Arc<CompiledRoute>>,
}

impl RouteTable {
    /// Build a route table from route configurations.
    ///
    /// Ordering is deterministic: longest literal prefix first, then fewer
    /// wildcards, then longer patterns, then route id. The first match wins,
    /// so any handled path resolves to exactly one route.
    pub fn new(route_configs: &[RouteConfig]) -> Result<Self> {
        let mut routes = Vec::with_capacity(route_configs.len());
        let mut route_by_id = HashMap::with_capacity(route_configs.len());

        for config in route_configs {
            let compiled = Arc::new(CompiledRoute::new(config.clone())?);
            route_by_id.insert(config.id.clone(), compiled.clone());
            routes.push(compiled);
        }

        routes.sort_by(|a, b| {
            b.literal_prefix
                .len()
                .cmp(&a.literal_prefix.len())
                .then(a.wildcard_count.cmp(&b.wildcard_count))
                .then(b.config.path.len().cmp(&a.config.path.len()))
                .then(a.config.id.cmp(&b.config.id))
        });

        debug!("Loaded {} routes", routes.len());
        for route in &routes {
            debug!(
                "Route '{}': {} -> {}",
                route.config.id, route.config.path, route.config.target_base_url
            );
        }

        Ok(Self { routes, route_by_id })
    }

    /// Find the most specific route matching a request path
    pub fn find_route(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        for route in &self.routes {
            if route.matches(path) {
                debug!("Route '{}' matched for {}", route.config.id, path);
                return Some(route.clone());
            }
        }
        debug!("No route matched for {}", path);
        None
    }

    /// Get a route by ID
    pub fn get_route(&self, id: &str) -> Option<Arc<CompiledRoute>> {
        self.route_by_id.get(id).cloned()
    }

    /// Get all routes in match order
    pub fn get_routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    /// Get route count
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Literal prefix of a glob pattern, up to the first wildcard character
fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

/// Convert a glob-like pattern to a regex pattern
fn glob_to_regex(pattern: &str) -> Result<String> {
    let mut regex = String::with_capacity(pattern.len() * 2);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    // ** means match anything including path separators
                    chars.next(); // consume the second *
                    regex.push_str(".*");
                } else {
                    // * means match anything except path separators
                    regex.push_str("[^/]*");
                }
            }
            '?' => {
                regex.push_str("[^/]");
            }
            // Escape regex special characters
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => {
                regex.push(ch);
            }
        }
    }

    regex.push('$');
    Ok(regex)
}
