mod coordinator;
mod manager;
mod unit_file;

pub use coordinator::{ServiceLifecycleCoordinator, ServicePhase, ServiceSnapshot};
pub use manager::{ServiceManager, SystemdManager};
pub use unit_file::{
    custom_environment_lines, environment_assignments, generate_unit, splice_custom_lines,
    UnitSpec,
};

#[cfg(test)]
mod tests;
