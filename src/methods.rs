use crate::table::{CompositeKey, DynamoTable};

/// Set helpers over typed items and their keys
pub trait DynamoTableMethods: DynamoTable {
    /// Values in `left` whose key is not listed in `right`
    fn left_diff(left: Vec<Self>, right: &[CompositeKey<Self::PK, Self::SK>]) -> Vec<Self> {
        left.into_iter()
            .filter(|item| !right.contains(&item.composite_key()))
            .collect()
    }

    /// Keys in `right` that no value in `left` carries
    fn right_diff(
        left: &[Self],
        right: Vec<CompositeKey<Self::PK, Self::SK>>,
    ) -> Vec<CompositeKey<Self::PK, Self::SK>> {
        let left_keys: Vec<CompositeKey<Self::PK, Self::SK>> =
            left.iter().map(|item| item.composite_key()).collect();

        right
            .into_iter()
            .filter(|key| !left_keys.contains(key))
            .collect()
    }

    /// Requested keys a batch read did not return
    ///
    /// Batch reads carry no order correspondence with their keys, so this
    /// is how a caller learns which keys have no stored item.
    fn missing_keys(
        requested: &[CompositeKey<Self::PK, Self::SK>],
        found: &[Self],
    ) -> Vec<CompositeKey<Self::PK, Self::SK>> {
        Self::right_diff(found, requested.to_vec())
    }
}

impl<T: DynamoTable> DynamoTableMethods for T {}
