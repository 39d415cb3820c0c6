use serde::{Deserialize, Serialize};

/// A participant handle in canonical (lower-cased) form.
///
/// Two identities name the same principal iff their canonical strings are
/// equal. Every constructor, including deserialisation, canonicalises.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Identity(String);

/// Case-fold `id`. No format validation; that belongs to the wallet provider.
pub fn canonicalize(id: &str) -> Identity {
    Identity(id.to_lowercase())
}

impl Identity {
    pub fn new(id: &str) -> Self {
        canonicalize(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        canonicalize(&s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        canonicalize(s)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_folds_checksummed_address() {
        let id = canonicalize("0x52908400098527886E0F7030069857D2E4169EE7");
        assert_eq!(id.as_str(), "0x52908400098527886e0f7030069857d2e4169ee7");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let once = canonicalize("CosmosHub1ABC");
        let twice = canonicalize(once.as_str());
        assert_eq!(once, twice);
    }

    #[test]
    fn differently_cased_inputs_are_equal() {
        assert_eq!(Identity::from("0xAbC"), Identity::from("0xaBc"));
    }

    #[test]
    fn no_validation_on_odd_input() {
        assert_eq!(canonicalize("").as_str(), "");
        assert_eq!(canonicalize("  Spaced Out ").as_str(), "  spaced out ");
    }

    #[test]
    fn deserialising_canonicalises() {
        let id: Identity = serde_json::from_str("\"0xDEADBEEF\"").unwrap();
        assert_eq!(id.as_str(), "0xdeadbeef");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0xdeadbeef\"");
    }
}
