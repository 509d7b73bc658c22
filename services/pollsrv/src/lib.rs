//! Field device polling service
//!
//! Runs one `fieldlink-core` worker per configured comm link and samples every
//! enabled controller on a fixed interval. Each interval is one completer
//! epoch; its summary is logged once every sample operation has finished.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod ops;
pub mod scheduler;
pub mod shutdown;

pub use config::ServiceConfig;
pub use error::{PollSrvError, Result};
pub use lifecycle::{LinkRegistry, PollService};
pub use ops::{SampleData, SampleRecord, SampleStore};
pub use scheduler::{CycleOutcome, SampleJob};
pub use shutdown::wait_for_shutdown;
