//! Domain newtype and address normalization
//!
//! Wraps domain strings to prevent accidentally passing email addresses
//! or other strings where domains are expected. Normalization lowercases
//! and punycodes, so two spellings of the same domain compare equal
//! everywhere in the queue.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A normalized domain name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

/// Errors raised while normalizing addresses and domains
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// Address has no `@domain` part.
    #[error("Address has no domain part: {0}")]
    MissingDomain(String),

    /// Domain failed IDNA/punycode conversion.
    #[error("Invalid domain {0}: {1}")]
    InvalidDomain(String, idna::Errors),

    /// Address is empty after trimming.
    #[error("Empty address")]
    Empty,
}

impl Domain {
    /// Wrap an already-normalized domain
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    /// Normalize a raw domain: trim, strip one layer of brackets,
    /// lowercase, punycode
    pub fn normalize(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw
            .trim()
            .trim_start_matches(['<', '['])
            .trim_end_matches(['>', ']']);
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let ascii = idna::domain_to_ascii(&trimmed.to_lowercase())
            .map_err(|e| AddressError::InvalidDomain(trimmed.to_string(), e))?;
        Ok(Self(Arc::from(ascii.as_str())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// A recipient address normalized for queueing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAddress {
    /// Full address with the domain part normalized, e.g. `user@xn--bcher-kva.example`
    pub address: String,
    /// The normalized domain part
    pub domain: Domain,
}

/// Normalize a recipient address: trim, strip surrounding angle brackets,
/// keep the local part verbatim, lowercase and punycode the domain
pub fn normalize_address(raw: &str) -> Result<NormalizedAddress, AddressError> {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    let Some((local, domain_part)) = trimmed.rsplit_once('@') else {
        return Err(AddressError::MissingDomain(trimmed.to_string()));
    };

    let domain = Domain::normalize(domain_part)?;
    Ok(NormalizedAddress {
        address: format!("{local}@{domain}"),
        domain,
    })
}

/// Extract and normalize the domain part of an address, if any
#[must_use]
pub fn domain_of(address: &str) -> Option<Domain> {
    let trimmed = address.trim().trim_start_matches('<').trim_end_matches('>');
    let (_, domain_part) = trimmed.rsplit_once('@')?;
    Domain::normalize(domain_part).ok()
}
