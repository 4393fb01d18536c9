//! Radix tree node.
//!
//! Each node owns one path segment. Static children are kept sorted so
//! lookups can binary search; a node has at most one parameter child and
//! at most one wildcard child.

use crate::error::RouterError;
use crate::params::Params;

/// Kind of path segment held by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    /// Literal segment (e.g. `chat`)
    Static,
    /// Named parameter (e.g. `{room}`)
    Param(String),
    /// Catch-all wildcard (e.g. `*rest`), only valid as the last segment
    Wildcard(String),
}

/// A node in the radix tree carrying an optional route value.
#[derive(Debug, Clone)]
pub struct Node<T> {
    /// The raw segment text
    pub segment: String,
    /// Segment kind
    pub kind: SegmentKind,
    /// Value stored when a template ends at this node
    pub value: Option<T>,
    static_children: Vec<Node<T>>,
    param_child: Option<Box<Node<T>>>,
    wildcard_child: Option<Box<Node<T>>>,
}

impl<T> Node<T> {
    fn with_kind(segment: impl Into<String>, kind: SegmentKind) -> Self {
        Self {
            segment: segment.into(),
            kind,
            value: None,
            static_children: Vec::new(),
            param_child: None,
            wildcard_child: None,
        }
    }

    /// Creates the root of a tree.
    #[must_use]
    pub fn root() -> Self {
        Self::with_kind("", SegmentKind::Static)
    }

    /// Splits a template into typed segments.
    pub(crate) fn parse_template(template: &str) -> Result<Vec<(String, SegmentKind)>, RouterError> {
        let raw: Vec<&str> = template.split('/').filter(|s| !s.is_empty()).collect();
        let mut out = Vec::with_capacity(raw.len());

        for (i, s) in raw.iter().enumerate() {
            let kind = if let Some(name) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(RouterError::invalid_template(template, "empty parameter name"));
                }
                SegmentKind::Param(name.to_string())
            } else if let Some(name) = s.strip_prefix('*') {
                if i + 1 != raw.len() {
                    return Err(RouterError::invalid_template(
                        template,
                        "wildcard must be the last segment",
                    ));
                }
                SegmentKind::Wildcard(name.to_string())
            } else {
                SegmentKind::Static
            };
            out.push(((*s).to_string(), kind));
        }

        Ok(out)
    }

    /// Inserts a template. Fails if the template is malformed, already
    /// present, or names a parameter differently from an existing sibling.
    pub fn insert(&mut self, template: &str, value: T) -> Result<(), RouterError> {
        let segments = Self::parse_template(template)?;
        self.insert_segments(template, &segments, value)
    }

    fn insert_segments(
        &mut self,
        template: &str,
        segments: &[(String, SegmentKind)],
        value: T,
    ) -> Result<(), RouterError> {
        let Some(((segment, kind), remaining)) = segments.split_first() else {
            if self.value.is_some() {
                return Err(RouterError::duplicate(template));
            }
            self.value = Some(value);
            return Ok(());
        };

        let child = match kind {
            SegmentKind::Static => {
                match self
                    .static_children
                    .binary_search_by(|c| c.segment.as_str().cmp(segment))
                {
                    Ok(i) => &mut self.static_children[i],
                    Err(i) => {
                        self.static_children
                            .insert(i, Self::with_kind(segment.clone(), SegmentKind::Static));
                        &mut self.static_children[i]
                    }
                }
            }
            SegmentKind::Param(name) | SegmentKind::Wildcard(name) => {
                let slot = if matches!(kind, SegmentKind::Param(_)) {
                    &mut self.param_child
                } else {
                    &mut self.wildcard_child
                };
                let child = slot.get_or_insert_with(|| {
                    Box::new(Self::with_kind(segment.clone(), kind.clone()))
                });
                if child.kind != *kind {
                    return Err(RouterError::ConflictingParameter {
                        template: template.to_string(),
                        existing: child.segment.clone(),
                        name: name.clone(),
                    });
                }
                child.as_mut()
            }
        };

        child.insert_segments(template, remaining, value)
    }

    /// Matches a concrete path, returning the stored value and the
    /// captured parameters. Static segments win over parameters, which
    /// win over wildcards; a failed deeper match backtracks cleanly.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<(&T, Params)> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Params::new();
        let value = self.match_segments(&segments, &mut params)?;
        Some((value, params))
    }

    fn match_segments<'a>(&'a self, segments: &[&str], params: &mut Params) -> Option<&'a T> {
        let Some((segment, remaining)) = segments.split_first() else {
            return self.value.as_ref();
        };

        if let Some(child) = self.find_static_child(segment) {
            if let Some(found) = child.match_segments(remaining, params) {
                return Some(found);
            }
        }

        if let Some(child) = &self.param_child {
            if let SegmentKind::Param(name) = &child.kind {
                params.push(name.clone(), *segment);
                if let Some(found) = child.match_segments(remaining, params) {
                    return Some(found);
                }
                params.pop();
            }
        }

        if let Some(child) = &self.wildcard_child {
            if let (SegmentKind::Wildcard(name), Some(value)) = (&child.kind, &child.value) {
                params.push(name.clone(), segments.join("/"));
                return Some(value);
            }
        }

        None
    }

    fn find_static_child(&self, segment: &str) -> Option<&Self> {
        self.static_children
            .binary_search_by(|c| c.segment.as_str().cmp(segment))
            .ok()
            .map(|i| &self.static_children[i])
    }
}
