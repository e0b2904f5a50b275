//! Persistence Module
//!
//! Storage contracts and the asynchronous write-back of encounter events.

pub mod store;
pub mod synchronizer;

pub use store::{EncounterStore, SessionStatus, SessionStatusStore, StoreError, StoreResult};
pub use synchronizer::{PersistenceSynchronizer, SyncListener};

#[cfg(test)]
pub use store::{MockEncounterStore, MockSessionStatusStore};
