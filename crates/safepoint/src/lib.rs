pub mod error;
pub mod instrumentation;
pub mod mock;
pub mod runtime;
pub mod sync;
pub mod utils;

pub use error::{Result, SafepointError};
pub use instrumentation::{Instrumentation, InstrumentationLevel};
pub use runtime::{RuntimeBuilder, RuntimeContext};
