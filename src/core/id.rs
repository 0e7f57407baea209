use crate::core::error::{Error, Result};

/// Validate a client-chosen container ID.
///
/// IDs name a subdirectory of the state root, so they must be a single,
/// non-empty path component. The accepted character set is deliberately
/// conservative.
pub fn validate(id: &str) -> Result<()> {
    let legal = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'));

    if legal {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        assert!(validate("test").is_ok());
        assert!(validate("my-container_01").is_ok());
        assert!(validate("a.b+c").is_ok());
        assert!(validate("0123456789abcdef").is_ok());
    }

    #[test]
    fn rejects_empty_and_dot_ids() {
        assert!(validate("").is_err());
        assert!(validate(".").is_err());
        assert!(validate("..").is_err());
    }

    #[test]
    fn rejects_path_separators_and_spaces() {
        assert!(validate("a/b").is_err());
        assert!(validate("/abs").is_err());
        assert!(validate("has space").is_err());
        assert!(validate("nul\0byte").is_err());
    }
}
