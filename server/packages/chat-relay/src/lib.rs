//! Chat relay core: sessions, queueing and streaming over the Claude CLI.

mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

pub mod cli;
pub mod config;
pub mod history;
pub mod router;
pub mod session;
pub mod session_manager;
pub mod stream_event;
pub mod subscriber;

pub use build_version::VERSION;
