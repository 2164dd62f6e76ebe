//! Local emergency number classification

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::EmergencyConfig;
use crate::interfaces::EmergencyNumberClassifier;

static NON_DIALABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9+*#]").expect("static pattern is valid"));

/// Strip a URI scheme such as `tel:` from an address.
pub fn scheme_specific_part(address: &str) -> &str {
    match address.split_once(':') {
        Some((scheme, rest))
            if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            rest
        }
        _ => address,
    }
}

/// Reduce an address to its dialable characters.
pub fn dialable_number(address: &str) -> String {
    NON_DIALABLE
        .replace_all(scheme_specific_part(address), "")
        .into_owned()
}

/// Exact-match classifier over a configured number list
#[derive(Debug, Clone)]
pub struct EmergencyNumbers {
    numbers: Vec<String>,
}

impl EmergencyNumbers {
    pub fn new<I, S>(numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            numbers: numbers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &EmergencyConfig) -> Self {
        Self::new(config.numbers.iter().cloned())
    }

    pub fn numbers(&self) -> &[String] {
        &self.numbers
    }
}

impl EmergencyNumberClassifier for EmergencyNumbers {
    fn is_local_emergency_number(&self, address: &str) -> bool {
        let number = dialable_number(address);
        !number.is_empty() && self.numbers.iter().any(|candidate| *candidate == number)
    }
}
