//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                          |
//! |----------|-----------------------------------------------------------|
//! | `plan`   | `Validate`, `Init`, `Status`, `Next`, `Normalize`, `Clean`, `Plans` |
//! | `check`  | `Check`                                                   |
//! | `config` | `Config`                                                  |
//! | `run`    | `Run`                                                     |

pub mod check;
pub mod config;
pub mod plan;
pub mod run;

pub use check::cmd_check;
pub use config::cmd_config;
pub use plan::{cmd_clean, cmd_init, cmd_next, cmd_normalize, cmd_plans, cmd_status, cmd_validate};
pub use run::cmd_run;
