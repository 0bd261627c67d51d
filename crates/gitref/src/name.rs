use std::fmt;

use bstr::{BStr, BString, ByteSlice};

use crate::error::RefError;

/// A validated reference name.
///
/// Enforces the rules from `git-check-ref-format(1)`:
/// - No double dots `..`
/// - No ASCII control characters or space, `~`, `^`, `:`, `?`, `*`, `[`, `\`
/// - Cannot begin or end with `/`, or contain `//`
/// - No component may begin with `.` or end with `.lock`
/// - Cannot end with `.`
/// - Cannot contain `@{`
/// - Cannot be the single character `@`
/// - Cannot contain a NUL byte
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefName(BString);

/// Characters forbidden anywhere in a ref name.
const FORBIDDEN_CHARS: &[u8] = b" ~^:?*[\\";

impl RefName {
    /// Create and validate a ref name.
    pub fn new(name: impl Into<BString>) -> Result<Self, RefError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (for internal use with known-good names).
    pub(crate) fn new_unchecked(name: impl Into<BString>) -> Self {
        Self(name.into())
    }

    /// Get the raw bytes of this ref name.
    pub fn as_bstr(&self) -> &BStr {
        self.0.as_bstr()
    }

    /// Get as a string slice (validated names are always ASCII/UTF-8).
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("<invalid-utf8>")
    }

    /// Is this under `refs/heads/`?
    pub fn is_branch(&self) -> bool {
        self.0.starts_with(b"refs/heads/")
    }

    /// Number of `/`-separated levels above the final component, i.e. the
    /// count of slashes. `refs/heads/main` has two.
    pub fn levels(&self) -> usize {
        self.0.iter().filter(|&&b| b == b'/').count()
    }
}

impl AsRef<str> for RefName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a ref name per git-check-ref-format rules.
pub(crate) fn validate(name: &[u8]) -> Result<(), RefError> {
    let name_str = || String::from_utf8_lossy(name).into_owned();

    if name.is_empty() {
        return Err(RefError::InvalidName("ref name is empty".into()));
    }
    if name.contains(&0) {
        return Err(RefError::InvalidName(format!(
            "'{}': contains NUL byte",
            name_str()
        )));
    }
    if name == b"@" {
        return Err(RefError::InvalidName("'@' is not a valid ref name".into()));
    }

    for (i, &b) in name.iter().enumerate() {
        if b < 0x20 || b == 0x7f {
            return Err(RefError::InvalidName(format!(
                "'{}': contains control character at position {}",
                name_str(),
                i
            )));
        }
        if FORBIDDEN_CHARS.contains(&b) {
            return Err(RefError::InvalidName(format!(
                "'{}': contains forbidden character '{}' at position {}",
                name_str(),
                b as char,
                i
            )));
        }
    }

    if name.starts_with(b"/") || name.ends_with(b"/") {
        return Err(RefError::InvalidName(format!(
            "'{}': begins or ends with '/'",
            name_str()
        )));
    }
    if name.ends_with(b".") {
        return Err(RefError::InvalidName(format!(
            "'{}': ends with '.'",
            name_str()
        )));
    }
    if name.find(b"..").is_some() {
        return Err(RefError::InvalidName(format!(
            "'{}': contains '..'",
            name_str()
        )));
    }
    if name.find(b"//").is_some() {
        return Err(RefError::InvalidName(format!(
            "'{}': contains '//'",
            name_str()
        )));
    }
    if name.find(b"@{").is_some() {
        return Err(RefError::InvalidName(format!(
            "'{}': contains '@{{'",
            name_str()
        )));
    }

    for component in name.split_str(b"/") {
        if component.starts_with(b".") {
            return Err(RefError::InvalidName(format!(
                "'{}': component starts with '.'",
                name_str()
            )));
        }
        if component.ends_with(b".lock") {
            return Err(RefError::InvalidName(format!(
                "'{}': component ends with '.lock'",
                name_str()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ref_names() {
        assert!(RefName::new("refs/heads/main").is_ok());
        assert!(RefName::new("refs/tags/v1.0").is_ok());
        assert!(RefName::new("refs/remotes/origin/main").is_ok());
        assert!(RefName::new("HEAD").is_ok());
        assert!(RefName::new("MERGE_HEAD").is_ok());
        assert!(RefName::new("refs/heads/feature/sub-branch").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(RefName::new("").is_err());
        assert!(RefName::new("@").is_err());
        assert!(RefName::new("refs/heads/main..branch").is_err());
        assert!(RefName::new(b"refs/heads/\x01bad".to_vec()).is_err());
        assert!(RefName::new("refs/heads/bad name").is_err());
        assert!(RefName::new("refs/heads/bad~name").is_err());
        assert!(RefName::new("refs/heads/bad^name").is_err());
        assert!(RefName::new("refs/heads/bad:name").is_err());
        assert!(RefName::new("refs/heads/bad?name").is_err());
        assert!(RefName::new("refs/heads/bad*name").is_err());
        assert!(RefName::new("refs/heads/bad[name").is_err());
        assert!(RefName::new("refs/heads/bad\\name").is_err());
        assert!(RefName::new(".refs/heads/main").is_err());
        assert!(RefName::new("refs/heads/.hidden").is_err());
        assert!(RefName::new("refs/heads/main/").is_err());
        assert!(RefName::new("/refs/heads/main").is_err());
        assert!(RefName::new("refs/heads/main.").is_err());
        assert!(RefName::new("refs/heads/main.lock").is_err());
        assert!(RefName::new("refs/heads/bad.lock/sub").is_err());
        assert!(RefName::new("refs//heads/main").is_err());
        assert!(RefName::new("refs/heads/main@{0}").is_err());
    }

    #[test]
    fn levels() {
        assert_eq!(RefName::new("HEAD").unwrap().levels(), 0);
        assert_eq!(RefName::new("refs/heads/main").unwrap().levels(), 2);
        assert_eq!(RefName::new("refs/heads/a/b/c").unwrap().levels(), 4);
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = RefName::new("refs/heads/alpha").unwrap();
        let b = RefName::new("refs/heads/beta").unwrap();
        assert!(a < b);
    }

    #[test]
    fn is_branch() {
        assert!(RefName::new("refs/heads/main").unwrap().is_branch());
        assert!(!RefName::new("refs/tags/v1.0").unwrap().is_branch());
    }

    #[test]
    fn display() {
        let r = RefName::new("refs/heads/main").unwrap();
        assert_eq!(r.to_string(), "refs/heads/main");
    }
}
