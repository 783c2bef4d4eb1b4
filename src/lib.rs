// Library exports for the hostplane control plane

pub mod allocator;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod mock;
pub mod model;
pub mod plane;
pub mod process;
pub mod services;
pub mod sites;
pub mod state;
pub mod stats;

pub use error::{HostplaneError, Result};
pub use plane::{Collaborators, ControlPlane};
