//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                                      |
//! |--------------|--------------------------------------------------------|
//! | `run`        | `Start`, `Resume`, `Status`, `Cancel`, `Remediate`    |
//! | `gates`      | `Gates`                                               |
//! | `invariants` | `Invariants`, `Learn`                                 |
//! | `config`     | `Config`                                              |
//!
//! Every handler returns the process exit code.

pub mod config;
pub mod gates;
pub mod invariants;
pub mod run;

pub use config::cmd_config;
pub use gates::cmd_gates;
pub use invariants::{cmd_invariants, cmd_learn};
pub use run::{cmd_cancel, cmd_remediate, cmd_resume, cmd_start, cmd_status};
