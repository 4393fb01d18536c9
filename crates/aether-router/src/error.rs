//! Router errors.

use thiserror::Error;

/// Errors raised while building a route table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The template is syntactically invalid.
    #[error("invalid template '{template}': {reason}")]
    InvalidTemplate {
        /// The offending template
        template: String,
        /// What is wrong with it
        reason: String,
    },

    /// The same template was registered twice.
    #[error("template '{template}' is already registered")]
    Duplicate {
        /// The duplicated template
        template: String,
    },

    /// A parameter or wildcard at the same position already has another name.
    #[error("template '{template}' declares '{name}' where '{existing}' is already registered")]
    ConflictingParameter {
        /// The template being inserted
        template: String,
        /// Segment already in the tree
        existing: String,
        /// Name the new template wanted
        name: String,
    },
}

impl RouterError {
    /// Creates an [`RouterError::InvalidTemplate`].
    pub fn invalid_template(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template: template.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`RouterError::Duplicate`].
    pub fn duplicate(template: impl Into<String>) -> Self {
        Self::Duplicate {
            template: template.into(),
        }
    }
}
