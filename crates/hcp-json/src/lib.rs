// SPDX-License-Identifier: MIT OR Apache-2.0
//! hcp-json
#![deny(unsafe_code)]
//!
//! JSON plumbing shared by the HCP services: dotted-path traversal,
//! recursive (non-shallow) union, and the two-phase `vars`/`files`
//! expander used to produce job descriptions.

pub mod expand;
pub mod path;
pub mod union;

pub use expand::{ExpandError, Expander};
pub use path::{PathError, delete_path, extract_path, extract_path_must, overwrite_path};
pub use union::{UnionOpts, union, union_with};
