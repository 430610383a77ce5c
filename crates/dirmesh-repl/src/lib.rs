#![warn(missing_docs)]

//! Multi-master replication engine: logical clocks, per-value conflict
//! resolution, assured acknowledgments and relay selection for a directory
//! replica mesh.

pub mod assured;
pub mod domain;
pub mod error;
pub mod fullsync;
pub mod history;
pub mod link;
pub mod monitor;
pub mod resolver;
pub mod selector;
pub mod stamp;
pub mod state;
pub mod status;
pub mod topology;
pub mod wire;
