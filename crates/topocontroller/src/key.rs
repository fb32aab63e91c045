//! Object keys
//!
//! Work items and cache entries are addressed by `namespace/name` strings.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed key {0:?}: expected `namespace/name` or `name`")]
    Malformed(String),
    #[error("malformed key {0:?}: name is empty")]
    EmptyName(String),
}

/// Build the key for an object.
pub fn key_for(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a key into `(namespace, name)`.
///
/// A bare `name` resolves to `default_namespace`.
pub fn split_key(key: &str, default_namespace: &str) -> Result<(String, String), KeyError> {
    let mut parts = key.split('/');
    let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => (default_namespace, name),
        (Some(namespace), Some(name), None) => (namespace, name),
        _ => return Err(KeyError::Malformed(key.to_string())),
    };

    if name.is_empty() {
        return Err(KeyError::EmptyName(key.to_string()));
    }

    let namespace = if namespace.is_empty() {
        default_namespace
    } else {
        namespace
    };
    Ok((namespace.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key() {
        assert_eq!(
            split_key("default/node-test1", "other").unwrap(),
            ("default".to_string(), "node-test1".to_string())
        );
        assert_eq!(
            split_key("node-test1", "default").unwrap(),
            ("default".to_string(), "node-test1".to_string())
        );
        assert_eq!(
            split_key("/node-test1", "default").unwrap(),
            ("default".to_string(), "node-test1".to_string())
        );
    }

    #[test]
    fn test_split_key_malformed() {
        assert!(matches!(split_key("a/b/c", "default"), Err(KeyError::Malformed(_))));
        assert!(matches!(split_key("default/", "default"), Err(KeyError::EmptyName(_))));
        assert!(matches!(split_key("", "default"), Err(KeyError::EmptyName(_))));
    }

    #[test]
    fn test_key_round_trip() {
        let key = key_for("default", "node-a");
        assert_eq!(key, "default/node-a");
        assert_eq!(split_key(&key, "x").unwrap().1, "node-a");
        assert_eq!(key_for("", "node-a"), "node-a");
    }
}
