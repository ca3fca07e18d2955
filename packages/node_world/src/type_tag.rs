use std::any::{self, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies the element type stored in a page.
///
/// Every page records the tag of its element type in its header, which allows a type-erased
/// handle to be checked against a requested type before it is trusted.
///
/// Tags are only meaningful within the process that created them. They must never be persisted.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Returns the tag of `T`.
    #[must_use]
    #[inline]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: any::type_name::<T>(),
        }
    }

    /// Returns `true` if this is the tag of `T`.
    #[must_use]
    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// The name of the tagged type, for diagnostics only.
    #[must_use]
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub(crate) fn type_id(&self) -> TypeId {
        self.id
    }
}

// The name is derived from the id, so only the id takes part in comparisons.
impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeTag {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeTag").field(&self.name).finish()
    }
}

impl fmt::Display for TypeTag {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(TypeTag: Send, Sync, Copy);

    #[test]
    fn same_type_same_tag() {
        assert_eq!(TypeTag::of::<u32>(), TypeTag::of::<u32>());
        assert!(TypeTag::of::<String>().is::<String>());
    }

    #[test]
    fn different_types_different_tags() {
        assert_ne!(TypeTag::of::<u32>(), TypeTag::of::<i32>());
        assert!(!TypeTag::of::<u32>().is::<u64>());
    }

    #[test]
    fn type_name_is_reported() {
        assert!(TypeTag::of::<String>().type_name().ends_with("String"));
        assert_eq!(TypeTag::of::<u8>().to_string(), "u8");
    }
}
