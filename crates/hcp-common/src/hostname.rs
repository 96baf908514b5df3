// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hostname validation and formatting.
//!
//! The accepted grammar is `[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*` —
//! underscores are allowed and no length cap is enforced. Both quirks are
//! part of the enrollment contract and must not be tightened here.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors from hostname validation and splitting.
#[derive(Debug, Error)]
pub enum HostnameError {
    /// The hostname did not match the accepted grammar.
    #[error("invalid hostname: {0}")]
    Invalid(String),

    /// A hostname label was empty.
    #[error("hostname components must be non-empty: {0}")]
    EmptyLabel(String),

    /// The hostname does not end with the claimed domain.
    #[error("hostname '{hostname}' does not sit under domain '{domain}'")]
    DomainMismatch {
        /// Hostname under scrutiny.
        hostname: String,
        /// Domain it was matched against.
        domain: String,
    },
}

fn hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$").expect("hostname regex compiles")
    })
}

/// Validate a hostname against the accepted grammar.
pub fn valid_hostname(hostname: &str) -> Result<(), HostnameError> {
    if hostname_re().is_match(hostname) {
        Ok(())
    } else {
        Err(HostnameError::Invalid(hostname.to_string()))
    }
}

/// Split the first label off a hostname, returning `(label, rest)`.
pub fn pop_hostname(hostname: &str) -> Result<(&str, &str), HostnameError> {
    match hostname.find('.') {
        Some(0) => Err(HostnameError::EmptyLabel(hostname.to_string())),
        Some(i) => Ok((&hostname[..i], &hostname[i + 1..])),
        None => Ok((hostname, "")),
    }
}

/// Render a hostname in LDAP DC form:
/// `host.example.com` → `DC=host,DC=example,DC=com`.
pub fn dc_hostname(hostname: &str) -> Result<String, HostnameError> {
    let mut rest = hostname;
    let mut out = String::new();
    while !rest.is_empty() {
        let (label, tail) = pop_hostname(rest)?;
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str("DC=");
        out.push_str(label);
        rest = tail;
    }
    Ok(out)
}

/// Split a hostname into its id part and the given domain, returning
/// `(id, Some(domain))` when the hostname sits under `domain`, or
/// `(hostname, None)` when it doesn't reach it.
pub fn pop_domain<'a>(
    hostname: &'a str,
    domain: &str,
) -> Result<(String, Option<&'a str>), HostnameError> {
    let mut pre = String::new();
    let mut post = hostname;
    while !post.is_empty() && post != domain {
        let (label, tail) = pop_hostname(post)?;
        if !pre.is_empty() {
            pre.push('.');
        }
        pre.push_str(label);
        post = tail;
    }
    if !post.is_empty() {
        return Ok((pre, Some(post)));
    }
    if pre != hostname {
        return Err(HostnameError::DomainMismatch {
            hostname: hostname.to_string(),
            domain: domain.to_string(),
        });
    }
    Ok((pre, None))
}
