use std::borrow::Borrow;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

macro_rules! string_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Panics on an empty key.
            pub fn new(key: impl Into<String>) -> Self {
                let key = key.into();
                assert!(!key.is_empty(), concat!(stringify!($name), " must not be empty"));
                Self(key)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let key = String::deserialize(deserializer)?;
                if key.is_empty() {
                    return Err(D::Error::custom(concat!(stringify!($name), " must not be empty")));
                }
                Ok(Self(key))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(key: &str) -> Self {
                Self::new(key)
            }
        }

        impl From<String> for $name {
            fn from(key: String) -> Self {
                Self::new(key)
            }
        }
    };
}

string_key!(
    /// Identity of a single cached record, e.g. a curriculum id.
    EntityKey
);

string_key!(
    /// Identity that groups entities into a collection, e.g. a user id.
    OwnerKey
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(EntityKey::from("C123"), 1);
        assert_eq!(map.get("C123"), Some(&1));
    }

    #[test]
    #[should_panic]
    fn test_empty_key_panics() {
        let _ = OwnerKey::new("");
    }

    #[test]
    fn test_empty_key_rejected_when_decoding() {
        assert!(serde_json::from_str::<EntityKey>("\"\"").is_err());
        assert_eq!(
            serde_json::from_str::<OwnerKey>("\"u1\"").unwrap(),
            OwnerKey::from("u1")
        );
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&EntityKey::from("C1")).unwrap();
        assert_eq!(json, "\"C1\"");
    }
}
