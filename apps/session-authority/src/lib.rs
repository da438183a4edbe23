//! Local session authority: creates sessions, tracks their service slots through
//! startup, and runs the broadcast and shutdown protocols.

pub mod authority;
pub mod config;
pub mod routes;
pub mod state;
pub mod upstream;
