//! # EchoDB Core
//!
//! Fundamental building blocks shared by every EchoDB crate:
//! - Row model and time helpers
//! - Error types
//! - Configuration
//! - Metrics
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   echodb-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • types      - Row model, time helpers         │
//! │  • error      - Error taxonomy                  │
//! │  • config     - Configuration                   │
//! │  • metrics    - Counter registry                │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::EchoConfig;
pub use error::{Error, Result};
pub use types::{Row, RowKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
