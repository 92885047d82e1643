//! Warden - guard hooks for autonomous agents
//!
//! Short-lived hook processes that sit between an agent and its tools. Each
//! invocation handles one tool call, consults persisted state, and exits.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`policy`] - Priority-tiered rules for shell commands and file access
//! - [`classifier`] - Maps command output to error categories and retry intents
//! - [`breaker`] - Per-API-source circuit breaker
//! - [`loop_detector`] - Three-tier detection of repetitive tool use
//! - [`state`] - Keyed JSON records with locked read-modify-write
//! - [`hooks`] - Hook protocol and handlers
//! - [`config`] - Configuration loading
//! - [`error`] - Custom error types and handling
//!
//! # Example
//!
//! ```rust
//! use warden::policy::{PolicyEngine, RuleSet, Selection};
//!
//! let engine = PolicyEngine::new(RuleSet::builtin(), &Selection::default(), "/project");
//! assert!(engine.check_bash_command("rm -rf /").is_blocked());
//! assert!(!engine.check_bash_command("cargo test").is_blocked());
//! ```

pub mod breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod hooks;
pub mod loop_detector;
pub mod policy;
pub mod state;

// Re-export commonly used types
pub use error::{Result, WardenError};

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, HealthCheck, SourceHealth};
pub use classifier::{ErrorCategory, ErrorClassification, ErrorClassifier, RetryIntent};
pub use config::{ConfigLocations, WardenConfig};
pub use hooks::{run_hook, HookInput, HookKind, HookOutput};
pub use loop_detector::{LoopDetector, LoopDetectorConfig, LoopTracker, LoopVerdict};
pub use policy::{PolicyDecision, PolicyEngine, Priority, RuleSet, Section, Selection};
pub use state::{FileStore, MemoryStore, StateStore, StateStoreExt};
