//! rootcloak - hides root from selected Android applications
//!
//! The tracer attaches to the app spawner (zygote) with ptrace, follows every
//! process it forks, and once a new application process has taken its final
//! name, unmounts root-related mounts from that process's private mount
//! namespace before the application's own code runs.
//!
//! # Modules
//!
//! - `tracer` - fork/clone event loop driving everything else
//! - `ptrace` - ptrace/tgkill/waitpid wrappers and thread-wise detach
//! - `lineage` - per-pid trace state and fork/clone lineage roots
//! - `conceal` - app identification, mount table rules, namespace helper
//! - `policy` - the hide list file (uids and process names)
//! - `config` - runtime configuration from JSON and environment
//! - `logging` - `tracing` subscriber setup
//! - `metrics` - Prometheus counters
//! - `capabilities` - startup capability check
//! - `cli` - argument parsing
//!
//! # Quick Start
//!
//! ```ignore
//! use rootcloak::{AppDetector, ForkTracer, NamespaceConcealer, PolicyStore, Procfs, Ptrace};
//!
//! let detector = AppDetector::new(
//!     PolicyStore::new("/sbin/supersu/suhide/suhide.uid"),
//!     Procfs::default(),
//!     NamespaceConcealer::new("/proc"),
//! );
//! let mut tracer = ForkTracer::new(Ptrace::default(), detector, spawner_pid);
//! let summary = tracer.run()?;
//! ```

pub mod capabilities;
pub mod cli;
pub mod conceal;
pub mod config;
pub mod error;
pub mod lineage;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod ptrace;
pub mod tracer;

pub use conceal::{AppDetector, Detection, Detector, NamespaceConcealer, Procfs};
pub use config::TracerConfig;
pub use error::{ConfigError, TracerError};
pub use policy::PolicyStore;
pub use ptrace::Ptrace;
pub use tracer::{ForkTracer, TraceSummary};
