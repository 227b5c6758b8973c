//! The parameter tree produced by query and multipart parsing.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use derive_more::Display;

use crate::spool::SpoolHandle;

/// The three shapes a parameter can take.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    #[display(fmt = "Scalar")]
    Scalar,
    #[display(fmt = "Map")]
    Map,
    #[display(fmt = "List")]
    List,
}

/// A node of the parameter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Scalar(Value),
    Map(Params),
    List(Vec<Param>),
}

/// A leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The key was present without `=`, as in `?flag`.
    Null,
    Text(String),
    /// Data that did not decode in its declared charset.
    Binary(Bytes),
    File(UploadedFile),
}

impl Param {
    pub fn kind(&self) -> ParamKind {
        match self {
            Param::Scalar(_) => ParamKind::Scalar,
            Param::Map(_) => ParamKind::Map,
            Param::List(_) => ParamKind::List,
        }
    }

    pub fn text<T: Into<String>>(text: T) -> Param {
        Param::Scalar(Value::Text(text.into()))
    }

    pub fn null() -> Param {
        Param::Scalar(Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Scalar(Value::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Param::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&UploadedFile> {
        match self {
            Param::Scalar(Value::File(file)) => Some(file),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Params> {
        match self {
            Param::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Param]> {
        match self {
            Param::List(list) => Some(list),
            _ => None,
        }
    }

    /// Follows a path of map keys.
    pub fn get_path(&self, path: &[&str]) -> Option<&Param> {
        path.iter().try_fold(self, |node, key| node.as_map()?.get(key))
    }

    pub(crate) fn for_each_spool<F: FnMut(&SpoolHandle)>(&self, f: &mut F) {
        match self {
            Param::Scalar(Value::File(file)) => f(&file.tempfile),
            Param::Scalar(_) => {}
            Param::Map(map) => map.values().for_each(|p| p.for_each_spool(f)),
            Param::List(list) => list.iter().for_each(|p| p.for_each_spool(f)),
        }
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Param {
        Param::Scalar(value)
    }
}

impl From<&str> for Param {
    fn from(text: &str) -> Param {
        Param::text(text)
    }
}

impl From<String> for Param {
    fn from(text: String) -> Param {
        Param::text(text)
    }
}

impl From<Params> for Param {
    fn from(map: Params) -> Param {
        Param::Map(map)
    }
}

impl From<Vec<Param>> for Param {
    fn from(list: Vec<Param>) -> Param {
        Param::List(list)
    }
}

/// A file upload: the part's metadata and the spool holding its body.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub filename: String,
    pub content_type: Option<String>,
    /// The part's raw header block.
    pub head: String,
    pub tempfile: SpoolHandle,
}

impl UploadedFile {
    /// Size of the upload in bytes.
    pub fn size(&self) -> u64 {
        self.tempfile.len()
    }
}

impl PartialEq for UploadedFile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.filename == other.filename
            && self.content_type == other.content_type
            && self.head == other.head
            && (self.tempfile.ptr_eq(&other.tempfile)
                || matches!(
                    (self.tempfile.read_to_vec(), other.tempfile.read_to_vec()),
                    (Ok(a), Ok(b)) if a == b
                ))
    }
}

/// A map of parameters with unique keys.
///
/// Iteration follows insertion order; equality does not depend on it.
#[derive(Clone, Default)]
pub struct Params {
    entries: Vec<(String, Param)>,
    index: HashMap<String, usize>,
}

impl Params {
    pub fn new() -> Params {
        Params::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Param> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Param> {
        match self.index.get(key) {
            Some(&i) => Some(&mut self.entries[i].1),
            None => None,
        }
    }

    /// Looks `key` up, asking `fallback` for a value when it is missing.
    pub fn get_or_else<'a, F>(&'a self, key: &str, fallback: F) -> &'a Param
    where
        F: FnOnce() -> &'a Param,
    {
        self.get(key).unwrap_or_else(fallback)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts or replaces a value, returning the previous one. A replaced key
    /// keeps its original position.
    pub fn insert<K: Into<String>, V: Into<Param>>(&mut self, key: K, value: V) -> Option<Param> {
        let key = key.into();
        let value = value.into();

        match self.index.get(&key) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Returns the value at `key`, inserting `default()` first when missing.
    pub fn get_or_insert_with<F>(&mut self, key: &str, default: F) -> &mut Param
    where
        F: FnOnce() -> Param,
    {
        let i = match self.index.get(key) {
            Some(&i) => i,
            None => {
                let i = self.entries.len();
                self.index.insert(key.to_owned(), i);
                self.entries.push((key.to_owned(), default()));
                i
            }
        };
        &mut self.entries[i].1
    }

    pub fn remove(&mut self, key: &str) -> Option<Param> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Param> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every spool referenced anywhere in the tree.
    pub fn spools(&self) -> Vec<SpoolHandle> {
        let mut spools = Vec::new();
        for value in self.values() {
            value.for_each_spool(&mut |spool| spools.push(spool.clone()));
        }
        spools
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<Param>> FromIterator<(K, V)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Params {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a str, &'a Param);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a Param)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(feature = "json")]
mod json {
    use serde::ser::{SerializeMap, SerializeStruct};
    use serde::{Serialize, Serializer};

    use super::{Param, Params, UploadedFile, Value};

    impl Serialize for Param {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self {
                Param::Scalar(value) => value.serialize(serializer),
                Param::Map(map) => map.serialize(serializer),
                Param::List(list) => list.serialize(serializer),
            }
        }
    }

    impl Serialize for Value {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self {
                Value::Null => serializer.serialize_none(),
                Value::Text(text) => serializer.serialize_str(text),
                Value::Binary(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
                Value::File(file) => file.serialize(serializer),
            }
        }
    }

    impl Serialize for Params {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(self.len()))?;
            for (k, v) in self.iter() {
                map.serialize_entry(k, v)?;
            }
            map.end()
        }
    }

    impl Serialize for UploadedFile {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut file = serializer.serialize_struct("UploadedFile", 5)?;
            file.serialize_field("name", &self.name)?;
            file.serialize_field("filename", &self.filename)?;
            file.serialize_field("type", &self.content_type)?;
            file.serialize_field("size", &self.size())?;
            file.serialize_field("path", &self.tempfile.path())?;
            file.end()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_position_and_replaces() {
        let mut params = Params::new();
        params.insert("a", "1");
        params.insert("b", "2");
        assert_eq!(params.insert("a", "3"), Some(Param::text("1")));

        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(params.get("a").and_then(Param::as_str), Some("3"));
    }

    #[test]
    fn test_equality_ignores_order() {
        let a: Params = vec![("x", "1"), ("y", "2")].into_iter().collect();
        let b: Params = vec![("y", "2"), ("x", "1")].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_remove_reindexes() {
        let mut params: Params = vec![("a", "1"), ("b", "2"), ("c", "3")].into_iter().collect();
        assert_eq!(params.remove("a"), Some(Param::text("1")));
        assert_eq!(params.get("c").and_then(Param::as_str), Some("3"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_get_path() {
        let inner: Params = vec![("b", "x")].into_iter().collect();
        let mut outer = Params::new();
        outer.insert("a", inner);
        let root = Param::Map(outer);

        assert_eq!(root.get_path(&["a", "b"]).and_then(Param::as_str), Some("x"));
        assert!(root.get_path(&["a", "c"]).is_none());
    }

    #[test]
    fn test_lookup_miss_policy() {
        let params = Params::new();
        let fallback = Param::null();
        assert_eq!(params.get_or_else("missing", || &fallback), &Param::null());
    }
}
