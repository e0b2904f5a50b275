//! Database Tests
//!
//! Exercise the SQLite store against real temporary database files.

mod migrations;
