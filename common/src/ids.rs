/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! Identifiers and keys.

use crate::error::{CmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length accepted for a bounded identifier string.
pub const MAX_ID_LEN: usize = 256;

fn check_bounded(kind: &str, s: &str) -> Result<()> {
    if s.is_empty() || s.len() > MAX_ID_LEN {
        return Err(CmError::InvalidArgument(format!(
            "{kind} must be 1..={MAX_ID_LEN} bytes, got {}",
            s.len()
        )));
    }
    Ok(())
}

macro_rules! bounded_string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self> {
                let s = s.into();
                check_bounded(stringify!($name), &s)?;
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.0
            }
        }
    };
}

bounded_string_id!(ItemId);
bounded_string_id!(SubjectId);
bounded_string_id!(NodeId);
bounded_string_id!(RuntimeId);
bounded_string_id!(ResourceName);
bounded_string_id!(LabelName);

/// An OCI-style content digest, `algorithm:hex`. Only `sha256` is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| CmError::InvalidArgument(format!("malformed digest: {s}")))?;
        if algorithm != "sha256" {
            return Err(CmError::NotSupported(format!(
                "unsupported digest algorithm: {algorithm}"
            )));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CmError::InvalidArgument(format!(
                "malformed sha256 hex in digest: {s}"
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_lowercase(),
        })
    }

    pub fn sha256(hex: impl Into<String>) -> Result<Self> {
        Self::parse(&format!("sha256:{}", hex.into()))
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn validate(&self, content: &[u8]) -> bool {
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(content);
        let computed = hex::encode(hasher.finalize());
        computed == self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Whether a placement atom is a long-running service or a one-shot/system
/// component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceType {
    Service,
    Component,
}

/// Primary key for instances. Equality and ordering are
/// field-wise; `Display` renders `{itemID}:{subjectID}:{index}` for logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub item_id: ItemId,
    pub subject_id: SubjectId,
    pub instance_index: u64,
    pub instance_type: InstanceType,
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.item_id, self.subject_id, self.instance_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let d = Digest::sha256("a".repeat(64)).unwrap();
        assert_eq!(d.to_string(), format!("sha256:{}", "a".repeat(64)));
    }

    #[test]
    fn digest_rejects_bad_algorithm() {
        assert!(Digest::parse(&format!("md5:{}", "a".repeat(64))).is_err());
    }

    #[test]
    fn digest_rejects_bad_length() {
        assert!(Digest::parse("sha256:abc").is_err());
    }

    #[test]
    fn ident_display_uses_colon_separated_fields() {
        let ident = InstanceIdent {
            item_id: ItemId::new("svc1").unwrap(),
            subject_id: SubjectId::new("subjA").unwrap(),
            instance_index: 2,
            instance_type: InstanceType::Service,
        };
        assert_eq!(ident.to_string(), "svc1:subjA:2");
    }

    #[test]
    fn bounded_id_rejects_empty_and_overlong() {
        assert!(ItemId::new("").is_err());
        assert!(ItemId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(ItemId::new("x".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn digest_validate() {
        let content = b"hello world";
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(content);
        let hexed = hex::encode(hasher.finalize());
        let d = Digest::sha256(hexed).unwrap();
        assert!(d.validate(content));
        assert!(!d.validate(b"other"));
    }
}
