//! Batch dispatch of work units
//!
//! - [`discovery`]: finding units under a data root
//! - [`completion`]: completion checks and pre-run reset
//! - [`scheduler`]: bounded worker pool
//! - [`executor`]: the batch executor tying the pieces together

pub mod completion;
pub mod discovery;
pub mod executor;
pub mod scheduler;
pub mod types;

pub use completion::*;
pub use discovery::*;
pub use executor::*;
pub use scheduler::*;
pub use types::*;
