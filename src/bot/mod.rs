pub mod engine;
pub mod functions;
pub mod pending;
pub mod prompt;

#[cfg(test)]
mod tests;

pub use engine::{BotEngine, EngineOptions, ListingRules};
pub use functions::{BotFunction, FunctionError, FunctionOutcome, Refusal, Role};
pub use pending::{PendingQueues, PhotoAdded};
