/// Bounded-length text for values that must fit fixed buffers on the device.
///
/// Unlike a plain `String`, construction fails instead of truncating when the
/// input does not fit, and empty input is never accepted.
use core::fmt;

use heapless::String;
use thiserror::Error;

/// Longest accepted firmware version identifier, in bytes
pub const MAX_VERSION_LEN: usize = 32;
/// Longest accepted manifest or download URL, in bytes
pub const MAX_URL_LEN: usize = 256;

pub type VersionString = BoundedText<MAX_VERSION_LEN>;
pub type UrlString = BoundedText<MAX_URL_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TextError {
    #[error("text is empty")]
    Empty,
    #[error("text is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BoundedText<const N: usize>(String<N>);

impl<const N: usize> BoundedText<N> {
    pub fn new(text: &str) -> Result<Self, TextError> {
        if text.is_empty() {
            return Err(TextError::Empty);
        }
        let mut inner = String::new();
        inner
            .push_str(text)
            .map_err(|()| TextError::TooLong { len: text.len(), max: N })?;
        Ok(Self(inner))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Never true for a constructed value
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub const fn capacity() -> usize {
        N
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl<const N: usize> TryFrom<&str> for BoundedText<N> {
    type Error = TextError;

    fn try_from(text: &str) -> Result<Self, Self::Error> {
        Self::new(text)
    }
}

impl<const N: usize> AsRef<str> for BoundedText<N> {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<const N: usize> PartialEq<str> for BoundedText<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<const N: usize> PartialEq<&str> for BoundedText<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<const N: usize> fmt::Display for BoundedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> fmt::Debug for BoundedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_empty() {
        assert_eq!(VersionString::new(""), Err(TextError::Empty));
    }

    #[test]
    fn test_rejects_oversized_instead_of_truncating() {
        let long = "1".repeat(MAX_VERSION_LEN + 1);
        assert_eq!(
            VersionString::new(&long),
            Err(TextError::TooLong { len: MAX_VERSION_LEN + 1, max: MAX_VERSION_LEN })
        );
    }

    #[test]
    fn test_accepts_exact_capacity() {
        let exact = "a".repeat(MAX_URL_LEN);
        let text = UrlString::new(&exact).unwrap();
        assert_eq!(text.len(), MAX_URL_LEN);
        assert_eq!(text, exact.as_str());
    }

    #[test]
    fn test_display_is_raw_text() {
        let version = VersionString::new("1.0.0").unwrap();
        assert_eq!(version.to_string(), "1.0.0");
        assert_eq!(format!("{:?}", version), "\"1.0.0\"");
    }

    proptest! {
        #[test]
        fn prop_accepts_iff_non_empty_and_fits(text in ".{0,40}") {
            let result = VersionString::new(&text);
            let fits = !text.is_empty() && text.len() <= MAX_VERSION_LEN;
            prop_assert_eq!(result.is_ok(), fits);
            if let Ok(value) = result {
                prop_assert_eq!(value.as_str(), text.as_str());
            }
        }
    }
}
