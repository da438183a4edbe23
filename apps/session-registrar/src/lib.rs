pub mod config;
pub mod registrar;
pub mod routes;
pub mod state;
