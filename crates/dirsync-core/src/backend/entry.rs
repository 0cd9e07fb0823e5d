//! Directory entries and their LDIF form

use super::dn::Dn;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A directory entry: a DN plus multi-valued attributes
///
/// Attribute names are stored lowercased. Values are raw bytes so binary
/// attributes (certificates, photos) survive replication untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry name
    pub dn: Dn,
    /// Attribute name -> values, in insertion order per attribute
    pub attributes: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    /// Entry with no attributes
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder helper adding a text value
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.add_value(name, value.as_bytes().to_vec());
        self
    }

    /// Builder helper adding a binary value
    pub fn with_binary(mut self, name: &str, value: Vec<u8>) -> Self {
        self.add_value(name, value);
        self
    }

    /// Add a value; false when it was already present
    pub fn add_value(&mut self, name: &str, value: Vec<u8>) -> bool {
        let values = self.attributes.entry(name.to_ascii_lowercase()).or_default();
        if values.contains(&value) {
            return false;
        }
        values.push(value);
        true
    }

    /// Remove one value; false when it was absent
    pub fn remove_value(&mut self, name: &str, value: &[u8]) -> bool {
        let key = name.to_ascii_lowercase();
        let Some(values) = self.attributes.get_mut(&key) else {
            return false;
        };
        let before = values.len();
        values.retain(|v| v != value);
        let removed = values.len() != before;
        if values.is_empty() {
            self.attributes.remove(&key);
        }
        removed
    }

    /// Remove a whole attribute; false when it was absent
    pub fn remove_attribute(&mut self, name: &str) -> bool {
        self.attributes.remove(&name.to_ascii_lowercase()).is_some()
    }

    /// Replace all values of an attribute (empty removes it)
    pub fn replace_attribute(&mut self, name: &str, values: Vec<Vec<u8>>) {
        let key = name.to_ascii_lowercase();
        if values.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, values);
        }
    }

    /// All values of an attribute
    pub fn values(&self, name: &str) -> &[Vec<u8>] {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of an attribute as UTF-8 text
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.values(name)
            .first()
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Whether the attribute holds `value`
    pub fn has_value(&self, name: &str, value: &[u8]) -> bool {
        self.values(name).iter().any(|v| v == value)
    }

    /// Serialize as one LDIF record
    pub fn to_ldif(&self) -> String {
        let mut out = String::new();
        write_line(&mut out, "dn", self.dn.as_str().as_bytes());
        for (name, values) in &self.attributes {
            for value in values {
                write_line(&mut out, name, value);
            }
        }
        out
    }

    /// Parse one LDIF record
    ///
    /// Accepts folded lines (continuation starting with a single space),
    /// `#` comments and base64 `attr::` values.
    pub fn from_ldif(input: &str) -> Result<Self> {
        let mut logical: Vec<String> = Vec::new();
        for line in input.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(rest) = line.strip_prefix(' ') {
                match logical.last_mut() {
                    Some(last) => last.push_str(rest),
                    None => return Err(Error::InvalidLdif("continuation without a line".into())),
                }
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else {
                logical.push(line.to_string());
            }
        }

        let mut lines = logical.into_iter();
        let first = lines
            .next()
            .ok_or_else(|| Error::InvalidLdif("empty record".into()))?;
        let (name, dn_value) = parse_line(&first)?;
        if name != "dn" {
            return Err(Error::InvalidLdif(format!(
                "record must start with dn, found {:?}",
                name
            )));
        }
        let dn_text = String::from_utf8(dn_value)
            .map_err(|_| Error::InvalidLdif("dn is not UTF-8".into()))?;
        let mut entry = Entry::new(Dn::parse(&dn_text)?);

        for line in lines {
            let (name, value) = parse_line(&line)?;
            entry.add_value(&name, value);
        }
        Ok(entry)
    }
}

fn write_line(out: &mut String, name: &str, value: &[u8]) {
    if is_safe_string(value) {
        out.push_str(name);
        out.push_str(": ");
        // is_safe_string guarantees ASCII
        out.push_str(std::str::from_utf8(value).unwrap_or_default());
    } else {
        out.push_str(name);
        out.push_str(":: ");
        out.push_str(&BASE64.encode(value));
    }
    out.push('\n');
}

/// LDIF SAFE-STRING: printable ASCII, not starting with space, colon or `<`,
/// not ending with a space
fn is_safe_string(value: &[u8]) -> bool {
    if value.is_empty() {
        return true;
    }
    if matches!(value[0], b' ' | b':' | b'<') || value[value.len() - 1] == b' ' {
        return false;
    }
    value.iter().all(|b| (0x20..0x7F).contains(b))
}

fn parse_line(line: &str) -> Result<(String, Vec<u8>)> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| Error::InvalidLdif(format!("missing ':' in {:?}", line)))?;
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(Error::InvalidLdif(format!("empty attribute name in {:?}", line)));
    }
    if let Some(encoded) = rest.strip_prefix(':') {
        let value = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidLdif(format!("bad base64 for {}: {}", name, e)))?;
        Ok((name, value))
    } else {
        Ok((name, rest.trim_start().as_bytes().to_vec()))
    }
}
