//! Shared helpers for the binary and library

pub mod logger;
