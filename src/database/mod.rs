//! Database Module - Anrufliste
//!
//! SQLite-Datenbank (rusqlite, bundled) für die Historie beendeter Calls.

mod call_log;

pub use call_log::{CallLog, CallRecord, DatabaseError};
