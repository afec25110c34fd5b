//! Validated identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for identifier types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// The value contained characters outside the allowed set.
    #[error("{field} contains invalid characters: {value:?}")]
    InvalidCharacters { field: &'static str, value: String },
}

/// Generates a validated string ID newtype with common trait implementations.
///
/// `$allowed` decides which characters may appear in the identifier.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal, $allowed:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                let allowed: fn(char) -> bool = $allowed;
                if !id.chars().all(allowed) {
                    return Err(ValidationError::InvalidCharacters {
                        field: $field_name,
                        value: id,
                    });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated tenant identifier.
    ///
    /// Tenants are isolated dataset partitions (one per customer or campaign).
    /// Only lowercase ASCII letters, digits and `-` are accepted. Storage
    /// identifiers compare case-insensitively, so `T1` and `t1` would otherwise
    /// name the same collection.
    TenantId, "tenant ID", |c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
);

define_string_id!(
    /// A validated schema name, e.g. `ProvisionRecord`.
    ///
    /// Schema names are restricted to ASCII alphanumerics.
    SchemaName, "schema name", |c| c.is_ascii_alphanumeric()
);
