//! Core traits for Strata security modules

use crate::StrataResult;

/// Lifecycle state of a security module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleState {
    /// Created but not yet initialized, or shut down
    #[default]
    Stopped,
    /// Initialized and serving requests
    Running,
}

impl ModuleState {
    /// Whether the module accepts requests
    pub fn is_running(self) -> bool {
        self == ModuleState::Running
    }
}

/// Security module interface
///
/// All Strata modules implement this trait to provide unified management.
pub trait SecurityModule: Send + Sync {
    /// Unique module identifier
    fn id(&self) -> &'static str;

    /// Module version
    fn version(&self) -> &'static str;

    /// Module description
    fn description(&self) -> &'static str;

    /// Current lifecycle state
    fn state(&self) -> ModuleState;

    /// Initialize the module
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails
    fn init(&mut self) -> StrataResult<()> {
        Ok(())
    }

    /// Shutdown the module
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&mut self) -> StrataResult<()> {
        Ok(())
    }
}
