pub mod broadcast;
pub mod collaborators;
pub mod encounter;
pub mod engine;
pub mod error;
pub mod locks;
pub mod logging;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod supervisor;
