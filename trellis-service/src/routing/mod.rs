//! Route matching: method-keyed radix trees with path parameters
//!
//! Patterns use `:name` or `{name}` for single-segment parameters. Matching
//! is case-sensitive; literal segments always win over parameters at the
//! same node. Trees are built at startup and read-only afterwards.

pub(crate) mod radix;

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;

use crate::error::{Error, Result};
use crate::exchange::AttrKey;
use crate::pipeline::Handler;

pub use radix::{InsertError, RadixTree};

/// Attribute key under which matched path parameters are stored
pub const PATH_PARAMS: AttrKey<PathParams> = AttrKey::new("trellis.path_params");

/// Parameters bound during route matching, in pattern order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    /// Wrap raw bindings
    pub fn new(params: Vec<(String, String)>) -> Self {
        Self(params)
    }

    /// Look up a parameter by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of bound parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no parameters were bound
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Normalize a path: trim whitespace, ensure a leading `/`, strip the
/// trailing `/` unless the path is `/` itself.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// HTTP router: one radix tree per method
#[derive(Default)]
pub struct Router {
    trees: HashMap<Method, RadixTree<Arc<dyn Handler>>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method` + `pattern`
    ///
    /// Duplicate registration for the same pattern overwrites. Registering a
    /// second, differently-named parameter at one node is rejected.
    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl Handler,
    ) -> Result<&mut Self> {
        self.route_arc(method, pattern, Arc::new(handler))
    }

    /// Register an already-shared handler
    pub fn route_arc(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<&mut Self> {
        let normalized = normalize_path(pattern);
        self.trees
            .entry(method)
            .or_default()
            .insert(&normalized, handler)
            .map_err(|e| Error::RouteConflict(format!("{normalized}: {e}")))?;
        Ok(self)
    }

    /// Match a request path, returning the handler and bound parameters
    pub fn search(&self, method: &Method, path: &str) -> Option<(Arc<dyn Handler>, PathParams)> {
        let normalized = normalize_path(path);
        let tree = self.trees.get(method)?;
        let (handler, params) = tree.find(&normalized)?;
        Some((Arc::clone(handler), PathParams::new(params)))
    }

    /// Total number of registered routes
    pub fn len(&self) -> usize {
        self.trees.values().map(RadixTree::len).sum()
    }

    /// True when no route is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;

    fn noop() -> impl Handler {
        |_ex: Arc<Exchange>| async move { Ok::<(), Error>(()) }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/users/"), "/users");
        assert_eq!(normalize_path("users"), "/users");
        assert_eq!(normalize_path("  /users "), "/users");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_method_isolation() {
        let mut router = Router::new();
        router.route(Method::GET, "/users", noop()).unwrap();

        assert!(router.search(&Method::GET, "/users").is_some());
        assert!(router.search(&Method::POST, "/users").is_none());
    }

    #[test]
    fn test_params_surface() {
        let mut router = Router::new();
        router
            .route(Method::GET, "/users/:id/posts/:pid", noop())
            .unwrap();

        let (_, params) = router.search(&Method::GET, "/users/42/posts/9").unwrap();
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("pid"), Some("9"));
        assert_eq!(params.get("missing"), None);
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_trailing_slash_equivalence() {
        let mut router = Router::new();
        router.route(Method::GET, "/users/", noop()).unwrap();
        assert!(router.search(&Method::GET, "/users").is_some());
        assert!(router.search(&Method::GET, "/users/").is_some());
    }

    #[test]
    fn test_conflict_is_error() {
        let mut router = Router::new();
        router.route(Method::GET, "/u/:id", noop()).unwrap();
        let err = router.route(Method::GET, "/u/:name", noop()).unwrap_err();
        assert!(matches!(err, Error::RouteConflict(_)));
    }
}
