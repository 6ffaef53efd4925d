//! Address Generator — unguessable abstract UNIX socket names.
//!
//! Mirrors `scm.GenerateAddress` from the reference implementation: 32
//! CSPRNG bytes, base64url-without-padding, prefixed with `@` to land in
//! Linux's abstract socket namespace.

use base64::Engine;
use rand::RngCore;

/// Number of random bytes drawn for each generated identifier.
const ID_LEN: usize = 32;

/// A UNIX-domain socket address in the abstract namespace.
///
/// `Display`s as the full `@...` form; [`SockAddr::id`] exposes the bare
/// identifier (no `@`) for use in service-manager unit names, where a
/// leading NUL/`@` would not be a valid template instance string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SockAddr(String);

impl SockAddr {
    /// Generates a fresh address by drawing [`ID_LEN`] bytes from the OS
    /// CSPRNG. Collisions are astronomically unlikely (2^256 space) and are
    /// not checked for; a caller that somehow observes one should treat it
    /// as a catastrophic RNG failure, not a retryable condition.
    pub fn generate() -> Self {
        let mut raw = [0u8; ID_LEN];
        rand::rng().fill_bytes(&mut raw);
        let id = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        Self(format!("@{id}"))
    }

    /// The full address, including the leading `@`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare identifier, without the leading `@` — safe to splice into a
    /// systemd unit instance name (`<unit>@<id>.service`) since base64url
    /// never emits `/`, `@`, or other path-unsafe characters.
    pub fn id(&self) -> &str {
        &self.0[1..]
    }

    /// True if this address names a node in the Linux abstract namespace
    /// (as opposed to a filesystem path, used on non-Linux fallback).
    pub fn is_abstract(&self) -> bool {
        self.0.starts_with('@')
    }

    /// Wraps an address string received verbatim (e.g. from argv), as
    /// opposed to one freshly drawn from [`SockAddr::generate`].
    pub fn from_raw(addr: String) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_abstract_address_with_leading_at() {
        let addr = SockAddr::generate();
        assert!(addr.as_str().starts_with('@'));
        assert!(addr.is_abstract());
    }

    #[test]
    fn id_strips_leading_at() {
        let addr = SockAddr::generate();
        assert_eq!(format!("@{}", addr.id()), addr.as_str());
    }

    #[test]
    fn id_contains_only_path_safe_characters() {
        let addr = SockAddr::generate();
        assert!(addr
            .id()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn generated_addresses_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let addr = SockAddr::generate();
            assert!(seen.insert(addr.as_str().to_string()), "collision in 10k draws");
        }
    }

    #[test]
    fn id_length_matches_unpadded_base64_of_32_bytes() {
        let addr = SockAddr::generate();
        // base64url without padding of 32 bytes is ceil(32*8/6) = 43 chars.
        assert_eq!(addr.id().len(), 43);
    }
}
