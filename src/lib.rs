// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stratum
//!
//! A declarative, idempotent resource graph reconciler with pluggable
//! providers.
//!
//! ## Overview
//!
//! Stratum reads a stack of typed resources, variables and modules from a
//! YAML file and drives the outside world to match it:
//!
//! - Resources reference each other's attributes with `${TYPE.NAME.ATTR}`;
//!   every reference is a dependency edge
//! - Modules are flattened into one graph with prefixed addresses
//! - Plans are computed against per-resource state records and can be saved
//!   for review before they are applied
//! - Applies run independent resources concurrently and record each result
//!   with compare-and-swap
//!
//! ## Architecture
//!
//! 1. **Builder**: configuration to an acyclic graph of resource nodes
//! 2. **Planner**: graph plus recorded state to an ordered change set
//! 3. **Executor**: applies the change set through a provider
//! 4. **State store**: durable record per resource (local files, S3, memory)
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Resource graph construction
//! - [`planner`]: Diff computation, planning and execution
//! - [`provider`]: Provider interface and built-in providers
//! - [`state`]: State storage backends (memory, local, S3)
//! - [`reconciler`]: Plan/apply orchestration, drift, refresh and recovery
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-stack
//!
//! resources:
//!   - type: network
//!     name: main
//!     attributes:
//!       cidr: "10.0.0.0/16"
//!   - type: subnet
//!     name: a
//!     attributes:
//!       network_id: "${network.main.id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{Result, StratumError};
pub use graph::{Graph, GraphBuilder, ResourceId};
pub use planner::{ApplyReport, Executor, Plan, Planner};
pub use provider::{Provider, ProviderRegistry, SimulatedProvider};
pub use reconciler::{DriftReport, ReconcileResult, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateRecord, StateStore};
