//! Markdown vault export of sites, reports and the triage board.

pub mod vault;

pub use vault::{VaultPaths, VaultSummary, build_vault};
