pub mod dump;
pub mod import;
pub mod logging;
pub mod store;

pub mod util {
    pub mod env;
}

pub use import::{EngineConfig, ImportEngine, StartOutcome, StatusReport, TickOutcome};
