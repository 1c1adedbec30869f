//! tor-operator library crate
//!
//! Keeps Tor onion services and onion-balanced fleets converged with their
//! declared resources.
//!
//! # Modules
//!
//! - [`api`] - Resource model (HiddenService, BalancedFleet, child objects)
//! - [`store`] - Cluster API boundary, in-memory and file-backed stores
//! - [`crypto`] - Onion identities, key files, control password hashing
//! - [`render`] - Daemon configuration rendering
//! - [`reconcile`] - Ensure-owned-child primitive and resource reconcilers
//! - [`controller`] - Work queue and watch-driven controller
//! - [`agent`] - Node agents and the daemon supervisor
//! - [`config`] - Configuration loading and validation
//! - [`cli`] - Command-line interface
//! - [`util`] - Time, randomization, helpers

#![allow(clippy::unused_async)] // Trait impls share one async shape
#![allow(clippy::missing_const_for_fn)] // Const fn optimization is low priority
#![allow(clippy::doc_markdown)] // Doc formatting is secondary
#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::cast_lossless)] // Explicit casts are fine
#![allow(clippy::cast_possible_wrap)] // Pids fit in i32
#![allow(clippy::option_if_let_else)] // Style preference
#![allow(clippy::use_self)] // Explicit types are clearer
#![allow(clippy::significant_drop_tightening)] // Lock scope is intentional
#![allow(clippy::single_match_else)] // Match for clarity
#![allow(clippy::items_after_statements)] // Local imports are fine
#![allow(clippy::unnecessary_debug_formatting)] // Debug format for paths
#![allow(clippy::new_without_default)] // Explicit new() is fine
#![allow(clippy::match_wildcard_for_single_variants)] // Wildcard for future
#![allow(clippy::redundant_closure_for_method_calls)] // Explicit closures
#![allow(clippy::map_unwrap_or)] // map().unwrap_or is clearer
#![allow(clippy::too_many_arguments)] // Some functions need many args
#![allow(clippy::too_many_lines)] // Some functions are complex
#![allow(clippy::module_name_repetitions)] // ServiceAgent in agent::service

pub mod agent;
pub mod api;
pub mod cli;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod logging;
pub mod reconcile;
pub mod render;
pub mod store;
pub mod util;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
