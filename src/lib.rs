/// Encounter Sync - real-time combat encounter synchronization
///
/// Core library providing the encounter state machine, subscription
/// broadcasting, persistence write-back and session supervision for
/// multiplayer tabletop RPG sessions.

pub mod config;
pub mod core;
pub mod database;

#[cfg(test)]
mod tests;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
