pub mod breakpoint;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod log;
pub mod module;
pub mod protocol;
pub mod session;
pub mod transport;

pub use cancel::CancellationToken;
pub use config::DebuggerConfig;
pub use error::DebuggerError;
pub use facade::Facade;
pub use module::preload;
pub use session::{SessionGuard, WaitOutcome};
