//! The closed set of registry failures.

use thiserror::Error;

use crate::context::DestructorError;
use crate::key::HandleKey;

/// Everything that can go wrong inside the registry.
///
/// Synchronous calls ([`register`](crate::HandleRegistry::register),
/// [`add_dependency`](crate::HandleRegistry::add_dependency),
/// [`remove_dependency`](crate::HandleRegistry::remove_dependency)) return
/// these directly. Failures on the asynchronous destruction path are
/// delivered to the registered error sink instead and never reach a caller.
#[derive(Debug, Error)]
pub enum RegistryError<C, I> {
    /// Lookup of a required key failed.
    #[error("handle ({class:?}, {id:?}) not found")]
    ObjectNotFound {
        /// Class component of the missing key.
        class: C,
        /// Id component of the missing key.
        id: I,
    },

    /// A refcount was observed in an illegal state: non-positive after an
    /// acquire, or negative after a release.
    #[error("handle ({class:?}, {id:?}) has invalid refcount {count}")]
    InvalidRefCount {
        /// Class component of the offending key.
        class: C,
        /// Id component of the offending key.
        id: I,
        /// The refcount value that was observed.
        count: i64,
    },

    /// Attempted to remove a dependency edge that was never recorded.
    #[error("handle ({class:?}, {id:?}) is not a recorded dependency")]
    DependencyNotFound {
        /// Class component of the absent dependency.
        class: C,
        /// Id component of the absent dependency.
        id: I,
    },

    /// The map did not contain the entry the teardown path was removing.
    /// Indicates an invariant breach, not a caller mistake.
    #[error("handle ({class:?}, {id:?}) vanished from the registry during removal")]
    FailedObjectRemoval {
        /// Class component of the vanished key.
        class: C,
        /// Id component of the vanished key.
        id: I,
    },

    /// The caller-supplied destructor returned an error.
    #[error("destructor for handle ({class:?}, {id:?}) failed: {source}")]
    DestructorFailure {
        /// Class component of the handle being destroyed.
        class: C,
        /// Id component of the handle being destroyed.
        id: I,
        /// The error the destructor returned.
        #[source]
        source: DestructorError,
    },
}

impl<C: Clone, I: Clone> RegistryError<C, I> {
    pub(crate) fn not_found(key: &HandleKey<C, I>) -> Self {
        Self::ObjectNotFound {
            class: key.class.clone(),
            id: key.id.clone(),
        }
    }

    pub(crate) fn invalid_refcount(key: &HandleKey<C, I>, count: i64) -> Self {
        Self::InvalidRefCount {
            class: key.class.clone(),
            id: key.id.clone(),
            count,
        }
    }

    pub(crate) fn dependency_not_found(key: &HandleKey<C, I>) -> Self {
        Self::DependencyNotFound {
            class: key.class.clone(),
            id: key.id.clone(),
        }
    }

    pub(crate) fn failed_removal(key: &HandleKey<C, I>) -> Self {
        Self::FailedObjectRemoval {
            class: key.class.clone(),
            id: key.id.clone(),
        }
    }

    pub(crate) fn destructor_failure(key: &HandleKey<C, I>, source: DestructorError) -> Self {
        Self::DestructorFailure {
            class: key.class.clone(),
            id: key.id.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_key_and_detail() {
        let key = HandleKey::new("F", "h1");

        let err = RegistryError::not_found(&key);
        assert_eq!(err.to_string(), r#"handle ("F", "h1") not found"#);

        let err = RegistryError::invalid_refcount(&key, -1);
        assert_eq!(
            err.to_string(),
            r#"handle ("F", "h1") has invalid refcount -1"#
        );
    }

    #[test]
    fn test_destructor_failure_preserves_source() {
        use std::error::Error as _;

        let key = HandleKey::new("F", "h1");
        let err = RegistryError::destructor_failure(&key, "device busy".into());

        assert!(err.to_string().ends_with("device busy"));
        assert_eq!(err.source().unwrap().to_string(), "device busy");
    }
}
