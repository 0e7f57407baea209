pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Vessel — a minimal OCI-compatible Linux container runtime.
#[derive(Parser, Debug)]
#[command(name = "vessel", version, about)]
pub struct Cli {
    /// Root directory for container state (default: /run/vessel for root,
    /// ~/.vessel otherwise).
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a default config.json into the bundle directory.
    Spec {
        /// Path to the bundle directory.
        #[arg(long, short, default_value = ".")]
        bundle: PathBuf,
    },

    /// Create a container from an OCI bundle without starting it.
    Create {
        /// Container ID. Must be unique and a single path component.
        id: String,

        /// Path to the bundle directory containing config.json and the rootfs.
        #[arg(long, short, default_value = ".")]
        bundle: PathBuf,

        /// File to write the container init PID to.
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Unix socket that receives the PTY master fd when the spec
        /// requests a terminal.
        #[arg(long)]
        console_socket: Option<PathBuf>,
    },

    /// Start the user command of a created container.
    Start {
        /// Container ID.
        id: String,
    },

    /// Create and start a container in one step.
    Run {
        /// Container ID.
        id: String,

        /// Path to the bundle directory containing config.json and the rootfs.
        #[arg(long, short, default_value = ".")]
        bundle: PathBuf,

        /// File to write the container init PID to.
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Unix socket that receives the PTY master fd when the spec
        /// requests a terminal.
        #[arg(long)]
        console_socket: Option<PathBuf>,

        /// Return immediately instead of waiting for the container to exit.
        #[arg(long, short)]
        detach: bool,
    },

    /// Print the state of a container as JSON.
    State {
        /// Container ID.
        id: String,
    },

    /// Send a signal to a container's init process.
    Kill {
        /// Container ID.
        id: String,

        /// Signal to send: a number (9), a name (KILL) or a full name
        /// (SIGKILL).
        #[arg(default_value = "SIGTERM")]
        signal: String,
    },

    /// Delete a container and its on-disk state.
    Delete {
        /// Container ID.
        id: String,

        /// Kill a running container instead of refusing to delete it.
        #[arg(long, short)]
        force: bool,
    },

    /// List containers.
    List,

    /// Execute a command inside a running container.
    Exec {
        /// Container ID.
        id: String,

        /// The command (and arguments) to execute. Everything after `--`.
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Internal: container init process. Do not invoke directly.
    #[command(hide = true)]
    Init,

    /// Internal: namespace-joining exec helper. Do not invoke directly.
    #[command(hide = true)]
    ExecInit {
        /// The command (and arguments) to execute.
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

/// Parse CLI arguments. Called from `main`.
pub fn parse() -> Cli {
    Cli::parse()
}
