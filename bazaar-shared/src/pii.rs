use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wrapper for buyer contact details and bank numbers.
///
/// `Debug` and `Display` never print the value, so `tracing::info!("{:?}", order)`
/// is safe. Serialization passes the value through; API responses that must not
/// expose it use [`Masked::tail`] instead.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl Masked<String> {
    /// Last `n` characters prefixed with bullets, e.g. `••••6789`.
    pub fn tail(&self, n: usize) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let start = chars.len().saturating_sub(n);
        let visible: String = chars[start..].iter().collect();
        format!("••••{}", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_masked() {
        let account = Masked::new("0012345678".to_string());
        assert_eq!(format!("{:?}", account), "********");
        assert_eq!(account.tail(4), "••••5678");
    }

    #[test]
    fn test_tail_on_short_value() {
        assert_eq!(Masked::new("12".to_string()).tail(4), "••••12");
    }
}
