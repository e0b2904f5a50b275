//! Crate-internal test suites
//!
//! Shared fixtures live in `common`, mockall builders in `mocks`. Inline
//! `#[cfg(test)]` modules next to the code cover single components; the
//! suites here drive several components together.


mod database;
mod unit;
