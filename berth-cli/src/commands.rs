use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the daemon process
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Start a container
    Start {
        name: String,
        /// Return the operation id without waiting for completion
        #[arg(long)]
        detach: bool,
    },
    /// Stop a container (runs pre_stop scripts first)
    Stop {
        name: String,
        #[arg(long)]
        detach: bool,
    },
    /// Restart a container
    Restart {
        name: String,
        #[arg(long)]
        detach: bool,
    },
    /// Stop a container and remove it with its image and owned volumes
    Cleanup {
        name: String,
        #[arg(long)]
        detach: bool,
    },

    /// Operate on a named group of containers
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },

    /// Stop every managed container
    StopAll {
        #[arg(long)]
        detach: bool,
    },
    /// Restart every managed container
    RestartAll {
        #[arg(long)]
        detach: bool,
    },
    /// Stop and remove every managed container
    CleanupAll {
        #[arg(long)]
        detach: bool,
    },

    /// List managed containers and their states
    Ps,

    /// Show the full status of an operation
    Status {
        /// Operation id returned by a lifecycle command
        operation_id: String,
    },

    /// Request best-effort cancellation of an operation
    Cancel {
        operation_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum GroupCommands {
    /// Start all members of a group, in declared order
    Start {
        group: String,
        #[arg(long)]
        detach: bool,
    },
    /// Stop all members of a group
    Stop {
        group: String,
        #[arg(long)]
        detach: bool,
    },
    /// Live state of each group member
    Status { group: String },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Detach and run in the background
        #[arg(short, long)]
        detach: bool,
    },
    /// Stop the daemon
    Stop,
    /// Show daemon liveness information
    Status,
}
