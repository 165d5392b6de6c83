/*!
# Background

config-manager is a hardened HTTP agent for remote, auditable management of a
declared set of configuration files and the services those files belong to.

An external controller (CI/CD, orchestrator, admin tooling) talks to a narrow
REST surface to read and atomically rewrite registered files, roll back to
timestamped backups, and invoke a whitelisted set of service-control actions.
No shell access is ever granted: every action maps to a fixed argument vector
decided at registration time, and every subprocess runs without shell
interpolation.

The agent is configured by two JSON files next to the binary: `global.json`
(listen address, auth token, IP admission, path roots, backup policy) and
`configs.json` (the registry of managed entries).  The registry can be
replaced or reloaded at runtime through the `/raw/configs` routes.
*/

#[macro_use]
extern crate log;

pub mod actions;
pub mod backup;
pub mod error;
pub mod exec;
pub mod filewrite;
pub mod pathguard;
pub mod registry;
pub mod server;
pub mod settings;

pub use error::Error;
