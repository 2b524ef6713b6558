//! gostalker - a debugger backend for Go programs controlled through a
//! remote debugging stub speaking the Gdb Remote Serial Protocol.
//!
//! The [`debugger`] module hosts the run-control engine, [`protocol`] the
//! RSP client it is built on, and [`launch`] the helpers that spawn
//! lldb-server or debugserver for local targets. Symbol loading and
//! goroutine decoding are supplied by the embedding application through
//! [`debugger::BinaryInfo`].

pub mod debugger;
pub mod launch;
pub mod protocol;
