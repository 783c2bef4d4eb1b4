// Process module - Supervisor abstraction and process plumbing

pub mod limits;
pub mod monitor;
pub mod native;
pub mod runner;
pub mod supervisor;

pub use monitor::{ProcessMonitor, ProcessUsage};
pub use native::NativeSupervisor;
pub use runner::{CommandOutcome, CommandSpec, ProcessRunner, ShellRunner};
pub use supervisor::{Supervisor, UnitDescriptor, UnitExit, UnitStatus};
