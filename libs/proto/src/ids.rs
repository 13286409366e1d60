//! Typed identifiers for the executor and agent APIs.
//!
//! Two families:
//!
//! - Scheduler-supplied IDs (`FrameworkId`, `ExecutorId`, `TaskId`) are
//!   opaque strings chosen by the other side of the wire. They carry no
//!   structure and serialize transparently.
//! - Generated tokens (`UpdateId`, container-id values) are fresh ULIDs:
//!   128-bit, time-ordered, 80 bits of randomness.

use serde::{Deserialize, Serialize};

/// Macro to define an opaque string identifier supplied by the scheduler
/// or agent. Generates a newtype with transparent serde, `Display`, and
/// conversions from string types.
#[macro_export]
macro_rules! define_string_id {
    ($name:ident) => {
        /// An opaque identifier supplied by a remote party.
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw string value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the raw string value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

/// Macro to define a generated 128-bit random token backed by a ULID.
///
/// Generates `new()`, string parsing, `Display`, and serde-through-string
/// implementations.
#[macro_export]
macro_rules! define_token {
    ($name:ident) => {
        /// A generated 128-bit random token.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// Generates a fresh token.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Parses a token from its canonical string form.
            pub fn parse(s: &str) -> Result<Self, $crate::ProtoError> {
                s.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::ProtoError::InvalidToken(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::ProtoError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_string_id!(FrameworkId);
define_string_id!(ExecutorId);
define_string_id!(TaskId);

define_token!(UpdateId);

/// Identifier of a (possibly nested) container.
///
/// A child container carries its parent's id; the agent uses the chain to
/// locate the container in the containerizer hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId {
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ContainerId>>,
}

impl ContainerId {
    /// Creates a root container id from a raw value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            parent: None,
        }
    }

    /// Creates a fresh child container id nested under `parent`.
    #[must_use]
    pub fn child_of(parent: &ContainerId) -> Self {
        Self {
            value: ulid::Ulid::new().to_string(),
            parent: Some(Box::new(parent.clone())),
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}.{}", parent, self.value),
            None => write!(f, "{}", self.value),
        }
    }
}
