// SPDX-License-Identifier: MIT OR Apache-2.0
//! hcp-common
#![deny(unsafe_code)]
//!
//! Plumbing shared by every HCP service: the JSON config world with its
//! scope discipline, hostname validation and formatting, the
//! HTTP-status/exit-code mapping of the executor contract, and small
//! filesystem helpers.

pub mod config;
pub mod fsutil;
pub mod hostname;
pub mod status;

pub use config::{Config, ConfigError};
pub use fsutil::{datetime2hint, touch};
pub use hostname::{HostnameError, dc_hostname, pop_domain, pop_hostname, valid_hostname};
pub use status::{exit2http, http2exit};
