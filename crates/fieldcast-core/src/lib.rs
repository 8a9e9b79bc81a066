mod cancel;
mod config;
mod defaults;
mod failure;

pub use cancel::{note_termination_signal, CancelToken};
pub use config::{TimeoutConfig, UpdateConfig};
pub use defaults::{generator_default, is_generator_default, GENERATOR_ENVIRONMENT_DEFAULTS};
pub use failure::{failure, failure_code, FailureCode};

#[cfg(test)]
mod tests;
