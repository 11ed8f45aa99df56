//! Core types and configuration for foldervision.
//!
//! This crate provides the data model shared by the scan engine and its
//! collaborators: the folder tree, the aggregate result, scan settings,
//! and the error taxonomy with its shared log.

mod config;
mod error;
mod node;
mod result;

pub use config::{ScanSettings, ScanSettingsBuilder};
pub use error::{ErrorKind, ErrorLog, ErrorRecord, ScanError, Severity};
pub use node::{Descendants, FolderNode};
pub use result::ScanResult;
