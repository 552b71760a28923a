use std::{io, net::SocketAddr, path::PathBuf};

/// Problems with the command line itself, reported before anything starts.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("Too many arguments! Expected at most one directory, got {count}.")]
    TooManyArguments { count: usize },
}

/// Anything that stops the server from coming up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cannot serve {}: {source}", path.display())]
    InvalidDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}
