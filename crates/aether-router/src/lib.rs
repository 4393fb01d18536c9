//! Radix tree path-template matching for aether endpoints.
//!
//! Endpoint paths are templates such as `/chat/{room}` or `/files/*path`.
//! The [`Router`] resolves a concrete connection path to the registered
//! value and the parameters captured along the way, in O(k) of the number
//! of segments.
//!
//! # Architecture
//!
//! ```text
//!                    (root)
//!                      │
//!              ┌───────┴───────┐
//!              │               │
//!            "chat"         "files"
//!              │               │
//!           "{room}"        "*path"
//!              │
//!           (value)
//! ```

mod error;
mod node;
mod params;
mod router;

pub use error::RouterError;
pub use node::{Node, SegmentKind};
pub use params::Params;
pub use router::Router;

/// A successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a, T> {
    /// The template that matched
    pub template: &'a str,
    /// Value registered for the template
    pub value: &'a T,
    /// Captured parameters
    pub params: Params,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_param_captures_any_segment(seg in "[a-zA-Z0-9_.-]{1,24}") {
            let mut router = Router::new();
            router.insert("/chat/{room}", ()).unwrap();
            let m = router.match_path(&format!("/chat/{seg}")).unwrap();
            prop_assert_eq!(m.params.get("room"), Some(seg.as_str()));
        }

        #[test]
        fn prop_wildcard_captures_tail(parts in proptest::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            let mut router = Router::new();
            router.insert("/files/*path", ()).unwrap();
            let tail = parts.join("/");
            let m = router.match_path(&format!("/files/{tail}")).unwrap();
            prop_assert_eq!(m.params.get("path"), Some(tail.as_str()));
        }
    }
}
