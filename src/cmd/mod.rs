//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled      |
//! |----------|-----------------------|
//! | `run`    | `Run`, `Resume`       |
//! | `phase`  | `Status`, `Phases`    |
//! | `config` | `Config`              |

pub mod config;
pub mod phase;
pub mod run;

pub use config::cmd_config;
pub use phase::{cmd_phases, cmd_status};
pub use run::{cmd_resume, cmd_run};
