//! `adm300-ctl` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, signal
//! wiring and process exit codes. The core "business logic" lives in
//! [`crate::app`] where it can be tested deterministically with an
//! injected session + injected output streams.

pub mod alarm;
pub mod app;
pub mod metric;
pub mod reading;
pub mod sentence;
pub mod session;
pub mod test_utils;
pub mod transport;

// Re-export commonly used types at the crate root
pub use alarm::{DeviceStatus, should_clear_alarm};
pub use app::{Command, DeviceSession, Options, RunError, run_with_io};
pub use reading::Reading;
pub use sentence::{Parsed, RAW_SENTENCE_LEN, RawLine, checksum, parse};
pub use session::{Event, RawMode, Session, SessionConfig};
pub use transport::{Transport, TransportError};
