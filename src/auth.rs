//! HTTP Basic authentication.

use std::fmt;

const BASE64_TABLE: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Encode data as base64.
pub struct Base64Encoded<'a>(pub &'a [u8]);

impl<'a> fmt::Display for Base64Encoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.0.chunks(3) {
            let mut triple: u32 = 0;
            for i in 0..3 {
                triple <<= 8;
                triple += *chunk.get(i).unwrap_or(&0) as u32;
            }
            for i in (0..4).rev().take(chunk.len() + 1) {
                let index = (triple as usize >> (i * 6)) & 0x3F;
                write!(f, "{}", BASE64_TABLE[index] as char)?;
            }
            for _ in 0..(3 - chunk.len()) {
                write!(f, "=")?;
            }
        }
        Ok(())
    }
}

/// Checks `Authorization:` headers against the configured credentials.
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    /// base64 of `user:pass`. None disables authentication.
    key: Option<Vec<u8>>,
}

impl Authorizer {
    /// Authorizer that lets everybody in.
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Authorizer for a `user:pass` pair.
    pub fn from_user_pass(user_pass: &str) -> Self {
        Self {
            key: Some(Base64Encoded(user_pass.as_bytes()).to_string().into_bytes()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Is the client allowed in?
    pub fn check(&self, authorization: Option<&str>) -> bool {
        let mut steps = 0;
        self.check_counted(authorization, &mut steps)
    }

    fn check_counted(&self, authorization: Option<&str>, steps: &mut usize) -> bool {
        let key = match &self.key {
            Some(key) => key,
            None => return true,
        };
        let authorization = match authorization {
            Some(authorization) => authorization.trim(),
            None => return false,
        };
        // The scheme is matched separately so the credential scan sees only the secret part.
        let (scheme, credentials) = match authorization.split_once(' ') {
            Some((scheme, credentials)) => (scheme, credentials.trim_start()),
            None => (authorization, ""),
        };
        let scheme_ok = scheme.eq_ignore_ascii_case("basic");
        let credentials_ok = constant_time_eq(credentials.as_bytes(), key, steps);
        scheme_ok & credentials_ok
    }
}

/// Compare two byte strings in time proportional to the longer one.
///
/// Every position up to the longer length is visited, whatever the contents.
fn constant_time_eq(a: &[u8], b: &[u8], steps: &mut usize) -> bool {
    let len = a.len().max(b.len());
    let mut diff = (a.len() != b.len()) as u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
        *steps += 1;
    }
    diff == 0
}
