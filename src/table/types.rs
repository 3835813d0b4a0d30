use aws_sdk_dynamodb::types::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A DynamoDB item: attribute name to typed value
pub type Item = HashMap<String, AttributeValue>;

/// A key is an item holding only the key attributes
pub type Key = Item;

/// Partition key type alias - fully generic
pub type PartitionKey<PK> = PK;

/// Sort key type alias - fully generic
pub type SortKey<SK> = Option<SK>;

/// Composite key type alias - fully generic
pub type CompositeKey<PK, SK> = (PK, SortKey<SK>);

/// Names of the attributes that identify an item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    /// Hash (partition) attribute name
    pub partition_key: String,
    /// Optional range (sort) attribute name
    pub sort_key: Option<String>,
}

impl KeySchema {
    /// Schema with only a partition key
    pub fn hash(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: None,
        }
    }

    /// Schema with a partition and a sort key
    pub fn composite(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: Some(sort_key.into()),
        }
    }

    /// Key attribute names, partition key first
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.partition_key.as_str()).chain(self.sort_key.as_deref())
    }

    /// Check that `item` carries every key attribute as a non-empty scalar
    ///
    /// Returns a description of the first problem found.
    pub fn check(&self, item: &Item) -> Result<(), String> {
        for name in self.attribute_names() {
            match item.get(name) {
                None => return Err(format!("missing key attribute '{name}'")),
                Some(value) if !is_key_scalar(value) => {
                    return Err(format!("key attribute '{name}' must be a non-empty S, N or B"));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Like [`KeySchema::check`], and also reject attributes outside the key
    pub fn check_key(&self, key: &Key) -> Result<(), String> {
        self.check(key)?;
        match key
            .keys()
            .find(|name| !self.attribute_names().any(|k| k == name.as_str()))
        {
            Some(extra) => Err(format!("attribute '{extra}' is not part of the key schema")),
            None => Ok(()),
        }
    }

    /// Project an item down to its key attributes
    pub fn key_of(&self, item: &Item) -> Key {
        self.attribute_names()
            .filter_map(|name| item.get(name).map(|v| (name.to_string(), v.clone())))
            .collect()
    }

    /// Whether two items share the same identity
    ///
    /// Items carrying none of the key attributes fall back to whole-item
    /// equality so malformed entries can still be matched.
    pub fn same_key(&self, left: &Item, right: &Item) -> bool {
        let has_key = |item: &Item| self.attribute_names().any(|name| item.contains_key(name));
        if !has_key(left) && !has_key(right) {
            return left == right;
        }
        self.attribute_names()
            .all(|name| left.get(name) == right.get(name))
    }

    /// Stable textual fingerprint of an item's key, usable as a map key
    pub fn fingerprint(&self, item: &Item) -> String {
        let mut out = String::new();
        for name in self.attribute_names() {
            if !out.is_empty() {
                out.push('\u{1f}');
            }
            match item.get(name) {
                Some(AttributeValue::S(s)) => {
                    out.push_str("S:");
                    out.push_str(s);
                }
                Some(AttributeValue::N(n)) => {
                    out.push_str("N:");
                    out.push_str(n);
                }
                Some(AttributeValue::B(b)) => {
                    out.push_str("B:");
                    for byte in b.as_ref() {
                        out.push_str(&format!("{byte:02x}"));
                    }
                }
                Some(other) => out.push_str(&format!("?:{other:?}")),
                None => out.push('-'),
            }
        }
        out
    }
}

fn is_key_scalar(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::S(s) => !s.is_empty(),
        AttributeValue::N(n) => !n.is_empty(),
        AttributeValue::B(b) => !b.as_ref().is_empty(),
        _ => false,
    }
}

/// A table name together with its key schema
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Key attributes
    pub key: KeySchema,
}

impl TableSchema {
    /// Describe a table
    pub fn new(name: impl Into<String>, key: KeySchema) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}
