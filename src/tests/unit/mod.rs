//! Unit tests that drive the engine through its request boundary

mod authorization_tests;
mod broadcast_tests;
mod engine_tests;
mod session_lifecycle_tests;
