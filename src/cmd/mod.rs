//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                          |
//! |----------|-------------------------------------------|
//! | `run`    | `Start`, `Recon`, `Resume`                |
//! | `runs`   | `List`, `Status`, `Events`, `Purge`       |
//! | `cache`  | `Cache`                                   |
//! | `config` | `Config`                                  |

pub mod cache;
pub mod config;
pub mod run;
pub mod runs;

pub use cache::cmd_cache;
pub use config::cmd_config;
pub use run::{cmd_recon, cmd_resume, cmd_start};
pub use runs::{cmd_events, cmd_list, cmd_purge, cmd_status};
