pub mod cli;
pub mod config;
pub mod events;
pub mod git;
pub mod identity;
pub mod launch;
pub mod logging;
pub mod monitor;
pub mod paths;
pub mod pip;
pub mod probe;
pub mod process;
pub mod repo;
pub mod session;
pub mod sockets;
pub mod sys;
pub mod tui;
pub mod update;
pub mod versions;
