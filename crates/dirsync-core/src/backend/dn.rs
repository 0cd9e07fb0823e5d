//! Distinguished names

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A distinguished name
///
/// Keeps the string as given and a normalized form (lowercase, whitespace
/// around separators removed) used for equality, ordering and hashing.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dn {
    raw: String,
    normalized: String,
    rdn_count: usize,
}

impl Dn {
    /// Parse a DN; the empty string is the root DN
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim().to_string();
        if raw.is_empty() {
            return Ok(Self::root());
        }

        let mut normalized = Vec::new();
        for rdn in split_unescaped(&raw, ',')? {
            normalized.push(normalize_rdn(&rdn, &raw)?);
        }

        Ok(Self {
            rdn_count: normalized.len(),
            normalized: normalized.join(","),
            raw,
        })
    }

    /// The root DN (no RDN)
    pub fn root() -> Self {
        Self {
            raw: String::new(),
            normalized: String::new(),
            rdn_count: 0,
        }
    }

    /// DN as originally written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Normalized form
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Normalized form reduced to characters safe in a file name
    pub fn to_file_stem(&self) -> String {
        if self.is_root() {
            return "root".to_string();
        }
        self.normalized
            .chars()
            .map(|c| match c {
                '=' => '-',
                c if c.is_ascii_alphanumeric() => c,
                _ => '_',
            })
            .collect()
    }

    /// Whether this is the root DN
    pub fn is_root(&self) -> bool {
        self.rdn_count == 0
    }

    /// Number of RDN components
    pub fn depth(&self) -> usize {
        self.rdn_count
    }

    /// Leftmost RDN as written
    pub fn rdn(&self) -> Option<String> {
        split_unescaped(&self.raw, ',')
            .ok()
            .and_then(|rdns| rdns.into_iter().next())
            .map(|rdn| rdn.trim().to_string())
    }

    /// `(attribute, value)` pairs of the leftmost RDN, attribute lowercased
    pub fn rdn_values(&self) -> Vec<(String, String)> {
        let Some(rdn) = self.rdn() else {
            return Vec::new();
        };
        split_unescaped(&rdn, '+')
            .unwrap_or_default()
            .into_iter()
            .filter_map(|ava| {
                let (attr, value) = ava.split_once('=')?;
                Some((attr.trim().to_ascii_lowercase(), unescape(value.trim())))
            })
            .collect()
    }

    /// Parent DN, `None` for the root
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            return None;
        }
        let rdns = split_unescaped(&self.raw, ',').ok()?;
        let rest: Vec<&str> = rdns.iter().skip(1).map(|s| s.trim()).collect();
        Dn::parse(&rest.join(",")).ok()
    }

    /// Build `rdn,self`
    pub fn child(&self, rdn: &str) -> Result<Dn> {
        if self.is_root() {
            Dn::parse(rdn)
        } else {
            Dn::parse(&format!("{},{}", rdn, self.raw))
        }
    }

    /// Whether this DN equals `base` or lies below it
    pub fn is_descendant_of(&self, base: &Dn) -> bool {
        if base.is_root() {
            return true;
        }
        if self.rdn_count < base.rdn_count {
            return false;
        }
        self.normalized == base.normalized
            || self
                .normalized
                .strip_suffix(base.normalized.as_str())
                .is_some_and(|prefix| prefix.ends_with(','))
    }

    /// Replace the `old_base` suffix of this DN with `new_base`
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Result<Dn> {
        if !self.is_descendant_of(old_base) {
            return Err(Error::InvalidDn(format!(
                "{} is not below {}",
                self.raw, old_base.raw
            )));
        }
        let rdns = split_unescaped(&self.raw, ',')?;
        let keep = self.rdn_count - old_base.rdn_count;
        let mut parts: Vec<String> = rdns.into_iter().take(keep).map(|s| s.trim().to_string()).collect();
        if !new_base.is_root() {
            parts.push(new_base.raw.clone());
        }
        Dn::parse(&parts.join(","))
    }
}

fn split_unescaped(input: &str, separator: char) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            current.push(ch);
            escaped = true;
        } else if ch == separator {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        return Err(Error::InvalidDn(format!("trailing escape in {:?}", input)));
    }
    parts.push(current);
    Ok(parts)
}

fn normalize_rdn(rdn: &str, whole: &str) -> Result<String> {
    let mut avas = Vec::new();
    for ava in split_unescaped(rdn, '+')? {
        let Some((attr, value)) = ava.split_once('=') else {
            return Err(Error::InvalidDn(format!("missing '=' in {:?}", whole)));
        };
        let attr = attr.trim();
        let value = value.trim();
        if attr.is_empty() || value.is_empty() {
            return Err(Error::InvalidDn(format!("empty RDN component in {:?}", whole)));
        }
        if !attr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(Error::InvalidDn(format!("bad attribute type {:?}", attr)));
        }
        avas.push(format!(
            "{}={}",
            attr.to_ascii_lowercase(),
            unescape(value).to_lowercase()
        ));
    }
    avas.sort();
    Ok(avas.join("+"))
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({:?})", self.raw)
    }
}

impl FromStr for Dn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Dn::parse(s)
    }
}

impl TryFrom<String> for Dn {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Dn::parse(&value)
    }
}

impl From<Dn> for String {
    fn from(dn: Dn) -> Self {
        dn.raw
    }
}
