//! Utilities for working with containers with strongly-typed indexes.
use crate::Error;
use std::collections::HashMap;

/// Stores a set of `(Value, Index)` tuples, with lookup in both directions.
///
/// Implemented using a `Vec<Value>` and a `HashMap<Value, Index>`.
///
/// The `Index` type should be a wrapper around a `usize` and be convertible
/// in both directions; it is typically passed around using `Copy`.
///
/// The `Value` type may be larger and is passed around by reference. However,
/// it must be `Clone`, because it is stored twice in the data structure (once
/// in the `Vec` and once in the `HashMap`).
#[derive(Debug)]
pub struct IndexMap<Value, Index> {
    data: Vec<Value>,
    map: HashMap<Value, Index>,
}

impl<Value, Index> Default for IndexMap<Value, Index> {
    fn default() -> Self {
        Self {
            data: vec![],
            map: HashMap::new(),
        }
    }
}

impl<Value, Index> IndexMap<Value, Index>
where
    Value: Eq + std::hash::Hash + Clone,
    Index: Eq + std::hash::Hash + Copy + From<usize>,
    usize: From<Index>,
{
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn clear(&mut self) {
        self.data.clear();
        self.map.clear();
    }
    pub fn get_by_index(&self, v: Index) -> Option<&Value> {
        self.data.get(usize::from(v))
    }
    /// Inserts a value, returning the existing index if it's already present
    pub fn insert(&mut self, v: Value) -> Index {
        *self.map.entry(v.clone()).or_insert_with(|| {
            let out = Index::from(self.data.len());
            self.data.push(v);
            out
        })
    }
    pub fn pop(&mut self) -> Result<Value, Error> {
        match self.data.pop() {
            Some(v) => {
                self.map.remove(&v);
                Ok(v)
            }
            None => Err(Error::EmptyMap),
        }
    }
    pub fn keys(&self) -> impl Iterator<Item = Index> + use<Value, Index> {
        (0..self.data.len()).map(Index::from)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A `Vec` which is indexed by a strongly-typed index
pub struct IndexVec<Value, Index> {
    data: Vec<Value>,
    _phantom: std::marker::PhantomData<fn() -> Index>,
}

impl<Value, Index> Default for IndexVec<Value, Index> {
    fn default() -> Self {
        Vec::new().into()
    }
}

impl<Value, Index> IndexVec<Value, Index> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// Appends a value, returning its index
    pub fn push(&mut self, v: Value) -> Index
    where
        Index: From<usize>,
    {
        let out = Index::from(self.data.len());
        self.data.push(v);
        out
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.data.iter()
    }
}

impl<Value: Clone, Index> Clone for IndexVec<Value, Index> {
    fn clone(&self) -> Self {
        self.data.clone().into()
    }
}

impl<Value: std::fmt::Debug, Index> std::fmt::Debug for IndexVec<Value, Index> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.data.fmt(f)
    }
}

impl<Value, Index> std::ops::Index<Index> for IndexVec<Value, Index>
where
    usize: From<Index>,
{
    type Output = Value;
    fn index(&self, i: Index) -> &Value {
        &self.data[usize::from(i)]
    }
}

impl<Value, Index> std::ops::IndexMut<Index> for IndexVec<Value, Index>
where
    usize: From<Index>,
{
    fn index_mut(&mut self, i: Index) -> &mut Value {
        &mut self.data[usize::from(i)]
    }
}

impl<Value, Index> From<Vec<Value>> for IndexVec<Value, Index> {
    fn from(data: Vec<Value>) -> Self {
        Self {
            data,
            _phantom: std::marker::PhantomData,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! define_index {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $name(usize);
        impl $name {
            /// Returns the raw index
            pub fn get(&self) -> usize {
                self.0
            }
        }
        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                Self(v)
            }
        }
        impl From<$name> for usize {
            fn from(v: $name) -> Self {
                v.0
            }
        }
    };
}
pub(crate) use define_index;
