//! C3 — SSHClient. Re-exports the submodules that together implement
//! spec.md §4.3: connection setup and channel pumping (`client`), the
//! failure taxonomy (`error`), and channel/PTY setup helpers (`channel`).

pub mod channel;
pub mod client;
pub mod error;

pub use client::{
    ConnectOutcome, ExecHandle, ExecResult, HostKeyPolicy, InteractiveCallback, PromptItem,
    ShellHandle, SshClient,
};
pub use error::SshError;
