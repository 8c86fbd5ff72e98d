//! SuperDots - a multi-platform dotfiles manager.
//!
//! This library provides the core of superdots:
//! - A registry of configurations with one source path per operating system
//! - Deployment by symlink or copy, with backups and drift detection
//! - `{{NAME}}` templates rendered per machine
//! - Git-backed sync with explicit conflict strategies

pub mod cfg;
pub mod deploy;
pub mod error;
pub mod files;
pub mod hash;
pub mod platform;
pub mod registry;
pub mod sync;
pub mod template;
pub mod ui;
pub mod vcs;

pub use error::{Error, Result};
pub use platform::{Platform, PlatformMap};
pub use registry::{ConfigEntry, Registry};
