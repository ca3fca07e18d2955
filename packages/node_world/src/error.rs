use thiserror::Error;

/// Reasons why a handle could not be used to remove a node.
///
/// Reading through a stale or foreign handle is not an error: lookups simply return `None`.
/// These errors are only produced by the `try_*` removal methods, which let the caller learn
/// exactly which contract a handle violated.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The handle is null and does not refer to any slot.
    #[error("the handle is null")]
    NullHandle,

    /// The handle refers to a slot in a page that the container does not own.
    #[error("the handle does not belong to any {type_name} container in this store")]
    ForeignHandle {
        /// The element type of the container that rejected the handle.
        type_name: &'static str,
    },

    /// The slot no longer holds the node the handle was issued for.
    ///
    /// A `live_generation` of zero means the slot is empty.
    #[error(
        "stale {type_name} handle: handle generation {handle_generation}, slot generation {live_generation}"
    )]
    StaleHandle {
        /// The element type stored in the slot.
        type_name: &'static str,

        /// The generation recorded in the handle.
        handle_generation: u32,

        /// The generation currently stored in the slot.
        live_generation: u32,
    },

    /// A type-erased handle was used as a handle to a different element type.
    #[error("type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        /// The requested element type.
        expected: &'static str,

        /// The element type actually stored at the handle's address.
        actual: &'static str,
    },
}

/// A specialized `Result` type for node store operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, Clone);

    #[test]
    fn stale_handle_message_names_both_generations() {
        let error = Error::StaleHandle {
            type_name: "u32",
            handle_generation: 3,
            live_generation: 0,
        };

        let message = error.to_string();
        assert!(message.contains("handle generation 3"));
        assert!(message.contains("slot generation 0"));
    }

    #[test]
    fn type_mismatch_is_error() {
        let error = Error::TypeMismatch {
            expected: "u32",
            actual: "alloc::string::String",
        };

        let result: Result<()> = Err(error);
        assert!(result.is_err());
    }
}
