//! Brazier is a terminal chat client for locally hosted LLM runtimes.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns conversation state, streaming orchestration, the chat
//!   controller state machine, and configuration.
//! - [`store`] persists sessions and turns in a local SQLite file.
//! - [`api`] defines the wire payloads exchanged with the runtime's HTTP API.
//! - [`ui`] runs the interactive terminal loop that reads user actions and
//!   renders streamed replies.
//! - [`cli`] parses command-line arguments and dispatches subcommands.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`], which initializes and dispatches into
//! [`core::controller`] and [`ui`] for interactive sessions.

pub mod api;
pub mod cli;
pub mod core;
pub mod store;
pub mod ui;
pub mod utils;
