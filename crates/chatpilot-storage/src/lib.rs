//! Persistence for accounts, conversations, patterns and execution history.

pub mod db;
pub mod patterns;
