//! Bootstrapper for a self-hosted devpi package index.
//!
//! The `sauber-devpi` binary starts `devpi-server`, waits until it answers
//! its status endpoint, then provisions two users and one index per user
//! through the `devpi` client. The pieces are exposed here so they can be
//! driven and tested individually: [`launcher`] owns the server process,
//! [`readiness`] polls it, and [`provision`] runs the idempotent sequence
//! against any [`client::IndexClient`].

pub mod badges;
pub mod client;
pub mod command;
pub mod config;
pub mod launcher;
pub mod provision;
pub mod readiness;
pub mod util;

pub use client::{ClientError, DevpiCli, IndexClient, IndexPath, IndexState};
pub use config::{BootstrapConfig, ConfigError, Password, ServeArgs, Target};
pub use launcher::{LaunchError, ServerHandle, ServerOptions};
pub use provision::{
    ActiveContext, ProvisionError, ProvisionReport, Step, provision,
};
