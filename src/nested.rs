//! Folds `key[sub][]=value` pairs into a [`Params`] tree.
//!
//! A key is a base name followed by bracket groups. `[name]` descends into a
//! map, a trailing `[]` appends to a list, and `[]` followed by more groups
//! addresses a map inside a list. That map is reused until one of its keys
//! shows up again, which starts the next element:
//!
//! ```text
//! x[y][][z]=1&x[y][][w]=2   =>  {x: {y: [{z: 1, w: 2}]}}
//! x[y][][z]=1&x[y][][z]=2   =>  {x: {y: [{z: 1}, {z: 2}]}}
//! ```
//!
//! Unbalanced brackets are never an error; they stay part of the key.

use crate::params::{Param, ParamKind, Params, Value};

enum Normalized {
    Merged,
    /// A bare `[]` below the top level: the value wrapped in a new list, to
    /// be stored by the caller.
    Wrapped(Param),
}

impl Normalized {
    fn into_wrapped(self) -> Option<Param> {
        match self {
            Normalized::Merged => None,
            Normalized::Wrapped(param) => Some(param),
        }
    }
}

/// Stores `value` under the bracketed key `name`.
///
/// Fails with [`ParamsTooDeep`](crate::Error::ParamsTooDeep) when the key has
/// more than `max_depth` levels, before anything is stored, and with
/// [`ParameterType`](crate::Error::ParameterType) when a level is already
/// used as a different kind of value.
///
/// # Examples
///
/// ```
/// use multiform::{normalize_params, Params, Value};
///
/// let mut params = Params::new();
/// normalize_params(&mut params, "user[tags][]", Value::Text("a".into()), 32).unwrap();
/// normalize_params(&mut params, "user[tags][]", Value::Text("b".into()), 32).unwrap();
///
/// let tags = params.get("user").and_then(|u| u.as_map()).and_then(|u| u.get("tags")).unwrap();
/// assert_eq!(tags.as_list().map(|l| l.len()), Some(2));
/// ```
pub fn normalize_params(params: &mut Params, name: &str, value: Value, max_depth: usize) -> crate::Result<()> {
    if key_depth(name) > max_depth {
        log::warn!("parameter `{}` nests deeper than {} levels", name, max_depth);
        return Err(crate::Error::ParamsTooDeep { limit: max_depth });
    }

    normalize(params, name, value, 0).map(|_| ())
}

/// Whether `key`, read as a bracketed path, already resolves inside `params`.
/// A key containing `[]` never does.
pub fn params_hash_has_key(params: &Params, key: &str) -> bool {
    if key.contains("[]") {
        return false;
    }

    let mut node = params;
    let mut parts = key.split(|c| c == '[' || c == ']').filter(|part| !part.is_empty()).peekable();

    while let Some(part) = parts.next() {
        match node.get(part) {
            Some(Param::Map(child)) => node = child,
            Some(_) if parts.peek().is_none() => return true,
            _ => return false,
        }
    }

    true
}

fn normalize(params: &mut Params, name: &str, value: Value, depth: usize) -> crate::Result<Normalized> {
    let (key, after) = split_name(name, depth);

    if key.is_empty() {
        return Ok(Normalized::Merged);
    }

    match after {
        "" => {
            if key == "[]" && depth != 0 {
                return Ok(Normalized::Wrapped(Param::List(vec![Param::Scalar(value)])));
            }
            assign_scalar(params, key, value)?;
        }
        "[" => assign_scalar(params, name, value)?,
        "[]" => list_at(params, key)?.push(Param::Scalar(value)),
        _ if after.starts_with("[]") => {
            let child_key = list_child_key(after);
            let list = list_at(params, key)?;

            let appended = match list.last_mut() {
                Some(Param::Map(last)) if !params_hash_has_key(last, child_key) => {
                    normalize(last, child_key, value, depth + 1)?.into_wrapped()
                }
                _ => {
                    let mut child = Params::new();
                    let wrapped = normalize(&mut child, child_key, value, depth + 1)?.into_wrapped();
                    Some(wrapped.unwrap_or(Param::Map(child)))
                }
            };

            if let Some(param) = appended {
                list.push(param);
            }
        }
        _ => {
            let slot = params.get_or_insert_with(key, || Param::Map(Params::new()));
            let outcome = match &mut *slot {
                Param::Map(child) => normalize(child, after, value, depth + 1)?,
                other => return Err(type_error(key, ParamKind::Map, other.kind())),
            };

            if let Normalized::Wrapped(param) = outcome {
                *slot = param;
            }
        }
    }

    Ok(Normalized::Merged)
}

/// Splits one level off `name`, returning the key for this level and the
/// rest of the name.
fn split_name(name: &str, depth: usize) -> (&str, &str) {
    if depth == 0 {
        // A leading `[` is part of the base name.
        let first = name.chars().next().map_or(0, char::len_utf8);
        return match name[first..].find('[') {
            Some(idx) => name.split_at(first + idx),
            None => (name, ""),
        };
    }

    if let Some(rest) = name.strip_prefix("[]") {
        return ("[]", rest);
    }

    if let Some(inner) = name.strip_prefix('[') {
        if let Some(close) = inner.find(']') {
            return (&inner[..close], &inner[close + 1..]);
        }
    }

    (name, "")
}

/// The key addressed inside a list element: `z` for `[][z]`, the remaining
/// groups verbatim otherwise.
fn list_child_key(after: &str) -> &str {
    let rest = &after[2..];

    if rest.len() > 2 && rest.starts_with('[') && rest.ends_with(']') {
        let inner = &rest[1..rest.len() - 1];
        if !inner.contains(&['[', ']'][..]) {
            return inner;
        }
    }

    rest
}

/// Number of levels `normalize` descends through for `name`.
fn key_depth(name: &str) -> usize {
    let mut name = name;
    let mut depth = 0;

    loop {
        let (key, after) = split_name(name, depth);
        depth += 1;

        if key.is_empty() || matches!(after, "" | "[" | "[]") {
            return depth;
        }

        name = if after.starts_with("[]") {
            list_child_key(after)
        } else {
            after
        };
    }
}

fn assign_scalar(params: &mut Params, key: &str, value: Value) -> crate::Result<()> {
    if let Some(existing) = params.get(key) {
        if existing.kind() != ParamKind::Scalar {
            return Err(type_error(key, ParamKind::Scalar, existing.kind()));
        }
    }

    params.insert(key, Param::Scalar(value));
    Ok(())
}

fn list_at<'a>(params: &'a mut Params, key: &str) -> crate::Result<&'a mut Vec<Param>> {
    match params.get_or_insert_with(key, || Param::List(Vec::new())) {
        Param::List(list) => Ok(list),
        other => Err(type_error(key, ParamKind::List, other.kind())),
    }
}

fn type_error(key: &str, expected: ParamKind, actual: ParamKind) -> crate::Error {
    crate::Error::ParameterType {
        param: key.to_owned(),
        expected,
        actual,
    }
}
