//! Identifier and column-path checks applied before any SQL is built

use crate::dialect::RESERVED_PREFIX;
use crate::error::{Result, StorageError};

const MAX_NAME_LEN: usize = 63;

/// Check a table/view name: `[A-Za-z_][A-Za-z0-9_-]{0,62}`, not reserved
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    };

    if !valid || name.len() > MAX_NAME_LEN || name.starts_with(RESERVED_PREFIX) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Column reference, optionally qualified by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPath {
    pub kind: Option<String>,
    pub column: String,
}

/// Parse and check `[kind:]column`
pub fn parse_path(path: &str) -> Result<ColumnPath> {
    let (kind, column) = match path.split_once(':') {
        Some((kind, column)) => {
            validate_name(kind).map_err(|_| StorageError::InvalidAttr(path.to_string()))?;
            (Some(kind.to_string()), column)
        }
        None => (None, path),
    };

    let valid = !column.is_empty()
        && column
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(StorageError::InvalidAttr(path.to_string()));
    }

    Ok(ColumnPath {
        kind,
        column: column.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["conns", "_tmp", "my-view_2", "a"] {
            assert!(validate_name(name).is_ok(), "{}", name);
        }
        assert!(validate_name(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "1abc", "has space", "semi;colon", "quote\"d", "__symtable", "ümlaut"] {
            assert!(
                matches!(validate_name(name), Err(StorageError::InvalidName(_))),
                "{}",
                name
            );
        }
        assert!(validate_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            parse_path("network-traffic:src_ref.value").unwrap(),
            ColumnPath {
                kind: Some("network-traffic".to_string()),
                column: "src_ref.value".to_string(),
            }
        );
        assert_eq!(parse_path("name").unwrap().kind, None);
        assert!(matches!(parse_path("bad col"), Err(StorageError::InvalidAttr(_))));
        assert!(matches!(parse_path("kind:"), Err(StorageError::InvalidAttr(_))));
        assert!(matches!(parse_path("x\"y"), Err(StorageError::InvalidAttr(_))));
    }
}
