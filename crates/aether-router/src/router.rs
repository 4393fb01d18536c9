//! Route table keyed by path template.

use crate::error::RouterError;
use crate::node::Node;
use crate::RouteMatch;

/// A radix tree route table mapping path templates to values.
///
/// # Example
///
/// ```rust
/// use aether_router::Router;
///
/// let mut router = Router::new();
/// router.insert("/chat/{room}", "chat").unwrap();
/// router.insert("/files/*path", "files").unwrap();
///
/// let m = router.match_path("/chat/lobby").unwrap();
/// assert_eq!(*m.value, "chat");
/// assert_eq!(m.template, "/chat/{room}");
/// assert_eq!(m.params.get("room"), Some("lobby"));
/// ```
///
/// # Route Priority
///
/// 1. **Static segments** (e.g. `/users/me`)
/// 2. **Parameter segments** (e.g. `/users/{id}`)
/// 3. **Wildcard segments** (e.g. `/files/*path`)
#[derive(Debug, Clone)]
pub struct Router<T> {
    root: Node<(String, T)>,
    templates: Vec<String>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Router<T> {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Node::root(),
            templates: Vec::new(),
        }
    }

    /// Registers a template.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the template is malformed, duplicated,
    /// or conflicts with an existing parameter name.
    pub fn insert(&mut self, template: &str, value: T) -> Result<(), RouterError> {
        self.root.insert(template, (template.to_string(), value))?;
        self.templates.push(template.to_string());
        Ok(())
    }

    /// Matches a concrete path.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<RouteMatch<'_, T>> {
        let ((template, value), params) = self.root.match_path(path)?;
        Some(RouteMatch {
            template,
            value,
            params,
        })
    }

    /// Registered templates in insertion order.
    pub fn templates(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(String::as_str)
    }

    /// Number of registered templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns true if no templates are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_routing() {
        let mut router = Router::new();
        router.insert("/echo", 1).unwrap();
        router.insert("/chat/{room}", 2).unwrap();

        let m = router.match_path("/echo").unwrap();
        assert_eq!(*m.value, 1);
        assert!(m.params.is_empty());

        let m = router.match_path("/chat/general").unwrap();
        assert_eq!(*m.value, 2);
        assert_eq!(m.template, "/chat/{room}");
        assert_eq!(m.params.get("room"), Some("general"));
    }

    #[test]
    fn test_trailing_slash_is_ignored() {
        let mut router = Router::new();
        router.insert("/echo", ()).unwrap();
        assert!(router.match_path("/echo/").is_some());
    }

    #[test]
    fn test_no_match() {
        let mut router = Router::new();
        router.insert("/echo", ()).unwrap();
        assert!(router.match_path("/other").is_none());
    }

    #[test]
    fn test_failed_insert_is_not_counted() {
        let mut router = Router::new();
        router.insert("/echo", ()).unwrap();
        assert!(router.insert("/echo", ()).is_err());
        assert_eq!(router.len(), 1);
        assert_eq!(router.templates().collect::<Vec<_>>(), vec!["/echo"]);
    }

    #[test]
    fn test_multiple_params() {
        let mut router = Router::new();
        router.insert("/orgs/{org}/rooms/{room}", ()).unwrap();

        let m = router.match_path("/orgs/acme/rooms/42").unwrap();
        assert_eq!(m.params.get("org"), Some("acme"));
        assert_eq!(m.params.get("room"), Some("42"));
    }
}
