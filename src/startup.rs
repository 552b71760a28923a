use std::{
    net::{SocketAddr, TcpListener},
    path::{Path, PathBuf},
};

use actix_web::{dev::Server, web};
use anyhow::Context;
use futures_util::future;
use notify::RecommendedWatcher;

use crate::{
    config::ServerConfiguration,
    error::StartupError,
    files::{self, ClientOptions},
    internal_scope::build_internal_scope,
    reload::{Broadcaster, ReloadGate},
    ui::{self, UiState},
    watcher,
};

const BROADCAST_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub broadcaster: Broadcaster,
    pub client: ClientOptions,
    pub log_connections: bool,
}

impl AppState {
    pub fn new(root: PathBuf, config: &ServerConfiguration, broadcaster: Broadcaster) -> Self {
        Self {
            root,
            broadcaster,
            client: ClientOptions::from_config(config),
            log_connections: config.logging().log_connections,
        }
    }
}

/// The running pair of servers plus the watcher feeding them.
pub struct Application {
    server: Server,
    ui_server: Server,
    local_addr: SocketAddr,
    ui_addr: SocketAddr,
    _watcher: Option<RecommendedWatcher>,
    state: AppState,
}

impl Application {
    /// Validate the root, bind both listeners and start watching.
    ///
    /// Nothing is bound if the root is unusable.
    pub async fn build(config: &ServerConfiguration) -> anyhow::Result<Self> {
        let serve = config.serve();
        let root = resolve_root(&serve.root)?;

        let listener = bind_listener(SocketAddr::new(serve.bind_ip(), serve.port))?;
        let local_addr = listener.local_addr().context("failed to read bound address")?;
        let ui_listener = bind_listener(SocketAddr::new(serve.bind_ip(), serve.ui_port))?;
        let ui_addr = ui_listener
            .local_addr()
            .context("failed to read bound admin address")?;

        let broadcaster = Broadcaster::new(BROADCAST_CAPACITY);
        let state = AppState::new(root.clone(), config, broadcaster.clone());

        let watcher = if config.watch().enabled {
            let (watcher, tx, changes) = watcher::watch(&root, &config.watch().events)?;
            if !config.watch().ignore_initial {
                let sent = watcher::initial_scan(&root, &config.watch().events, &tx);
                tracing::debug!(files = sent, "reported existing files");
            }
            ReloadGate::new(root.clone(), config, broadcaster.clone()).spawn(changes);
            Some(watcher)
        } else {
            tracing::info!("file watching disabled");
            None
        };

        let server = run(listener, state.clone())?;
        let ui_state = UiState::new(config, broadcaster, local_url(local_addr), local_url(ui_addr));
        let ui_server = ui::run(ui_listener, ui_state)?;

        tracing::debug!(%local_addr, %ui_addr, root = %root.display(), "listeners bound");

        Ok(Self {
            server,
            ui_server,
            local_addr,
            ui_addr,
            _watcher: watcher,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn ui_port(&self) -> u16 {
        self.ui_addr.port()
    }

    pub fn root(&self) -> &Path {
        &self.state.root
    }

    pub fn primary_url(&self) -> String {
        local_url(self.local_addr)
    }

    pub fn ui_url(&self) -> String {
        local_url(self.ui_addr)
    }

    pub fn client_options(&self) -> &ClientOptions {
        &self.state.client
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.state.broadcaster
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        future::try_join(self.server, self.ui_server).await?;
        Ok(())
    }
}

pub fn local_url(addr: SocketAddr) -> String {
    format!("http://localhost:{}", addr.port())
}

/// Register the live routes and the static fallback on an app.
pub fn configure_app(cfg: &mut web::ServiceConfig) {
    cfg.service(build_internal_scope())
        .service(web::resource("/{tail:.*}").route(web::to(files::serve_file)));
}

fn run(listener: TcpListener, state: AppState) -> anyhow::Result<Server> {
    let shared_state = web::Data::new(state);

    let server = actix_web::HttpServer::new(move || {
        actix_web::App::new()
            .app_data(shared_state.clone())
            .configure(configure_app)
    })
    .listen(listener)?
    .run();

    Ok(server)
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr).map_err(|source| StartupError::Bind { addr, source })
}

/// Change into `directory`, if given, and return the absolute serving root.
///
/// The root is returned so later stages take it explicitly instead of
/// reading the working directory again.
pub fn enter_root(directory: Option<&Path>) -> Result<PathBuf, StartupError> {
    if let Some(dir) = directory {
        std::env::set_current_dir(dir).map_err(|source| StartupError::InvalidDirectory {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let cwd = std::env::current_dir().map_err(|source| StartupError::InvalidDirectory {
        path: PathBuf::from("."),
        source,
    })?;
    resolve_root(&cwd)
}

pub fn resolve_root(root: &Path) -> Result<PathBuf, StartupError> {
    let canonical = root
        .canonicalize()
        .map_err(|source| StartupError::InvalidDirectory {
            path: root.to_path_buf(),
            source,
        })?;

    if canonical.is_dir() {
        Ok(canonical)
    } else {
        Err(StartupError::NotADirectory { path: canonical })
    }
}
