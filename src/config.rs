use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;

use crate::error::UsageError;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_UI_PORT: u16 = 3001;
pub const DEFAULT_RELOAD_DEBOUNCE_MS: u64 = 500;

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "live-serve", version, about)]
pub struct CliArgs {
    #[arg(
        value_name = "DIRECTORY",
        help = "Directory to serve (defaults to the current directory)",
        long_help = "Directory to serve (defaults to the current directory).\n\n\
                     Put `--` before a directory whose name starts with `-`, \
                     e.g. `live-serve -- -v`."
    )]
    pub directories: Vec<PathBuf>,
    #[arg(
        short,
        long,
        conflicts_with = "quiet",
        help = "Log debug output, including every client connection"
    )]
    pub verbose: bool,
    #[arg(short, long, help = "Only log warnings and errors")]
    pub quiet: bool,
}

impl CliArgs {
    /// The directory to serve, if one was given.
    ///
    /// Clap accepts any number of positionals so the count can be checked here
    /// and reported with the short usage line instead of clap's own error.
    pub fn directory(&self) -> Result<Option<&Path>, UsageError> {
        match self.directories.as_slice() {
            [] => Ok(None),
            [dir] => Ok(Some(dir.as_path())),
            more => Err(UsageError::TooManyArguments { count: more.len() }),
        }
    }

    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "live_serve=debug,info"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

pub fn usage(program: &str) -> String {
    format!("Usage: {program} [directory]")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEvent {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServeOptions {
    pub root: PathBuf,
    /// `None` binds every interface.
    pub host: Option<IpAddr>,
    pub port: u16,
    pub ui_port: u16,
}

impl ServeOptions {
    pub fn bind_ip(&self) -> IpAddr {
        self.host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchOptions {
    pub enabled: bool,
    pub events: BTreeSet<WatchEvent>,
    /// Files already present at startup do not count as additions.
    pub ignore_initial: bool,
}

impl WatchOptions {
    pub fn accepts(&self, event: WatchEvent) -> bool {
        self.events.contains(&event)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserOptions {
    pub open: bool,
    pub browser: Option<String>,
    pub start_path: Option<String>,
    pub reload_on_restart: bool,
    pub reload_delay_ms: u64,
    pub reload_debounce_ms: u64,
    pub reload_throttle_ms: u64,
    pub notify: bool,
    pub inject_changes: bool,
    pub inject_notification: bool,
}

impl BrowserOptions {
    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }

    pub fn reload_throttle(&self) -> Duration {
        Duration::from_millis(self.reload_throttle_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    pub log_connections: bool,
    pub log_file_changes: bool,
    pub log_snippet: bool,
    /// Append a cache-busting query to injected stylesheet URLs.
    pub timestamps: bool,
}

/// Everything the server needs, frozen before the first socket is bound.
///
/// Fields are private: the only way to obtain one is through
/// [`ServerConfiguration::builder`], and the accessors hand out shared
/// references, so nothing can change it once the server holds it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfiguration {
    serve: ServeOptions,
    watch: WatchOptions,
    browser: BrowserOptions,
    logging: LogOptions,
}

impl ServerConfiguration {
    pub fn builder(root: impl Into<PathBuf>) -> ServerConfigurationBuilder {
        ServerConfigurationBuilder::new(root.into())
    }

    pub fn serve(&self) -> &ServeOptions {
        &self.serve
    }

    pub fn watch(&self) -> &WatchOptions {
        &self.watch
    }

    pub fn browser(&self) -> &BrowserOptions {
        &self.browser
    }

    pub fn logging(&self) -> &LogOptions {
        &self.logging
    }
}

/// Starts from the defaults; every setter overrides one field.
#[derive(Debug, Clone)]
pub struct ServerConfigurationBuilder {
    config: ServerConfiguration,
}

impl ServerConfigurationBuilder {
    fn new(root: PathBuf) -> Self {
        Self {
            config: ServerConfiguration {
                serve: ServeOptions {
                    root,
                    host: None,
                    port: DEFAULT_PORT,
                    ui_port: DEFAULT_UI_PORT,
                },
                watch: WatchOptions {
                    enabled: true,
                    events: BTreeSet::from([WatchEvent::Add, WatchEvent::Change]),
                    ignore_initial: true,
                },
                browser: BrowserOptions {
                    open: false,
                    browser: None,
                    start_path: None,
                    reload_on_restart: true,
                    reload_delay_ms: 0,
                    reload_debounce_ms: DEFAULT_RELOAD_DEBOUNCE_MS,
                    reload_throttle_ms: 0,
                    notify: true,
                    inject_changes: true,
                    inject_notification: false,
                },
                logging: LogOptions {
                    log_connections: false,
                    log_file_changes: true,
                    log_snippet: true,
                    timestamps: true,
                },
            },
        }
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.serve.host = Some(host);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.serve.port = port;
        self
    }

    pub fn ui_port(mut self, port: u16) -> Self {
        self.config.serve.ui_port = port;
        self
    }

    pub fn watch(mut self, enabled: bool) -> Self {
        self.config.watch.enabled = enabled;
        self
    }

    pub fn watch_events(mut self, events: impl IntoIterator<Item = WatchEvent>) -> Self {
        self.config.watch.events = events.into_iter().collect();
        self
    }

    pub fn ignore_initial(mut self, ignore: bool) -> Self {
        self.config.watch.ignore_initial = ignore;
        self
    }

    pub fn open_browser(mut self, open: bool) -> Self {
        self.config.browser.open = open;
        self
    }

    pub fn browser(mut self, name: impl Into<String>) -> Self {
        self.config.browser.browser = Some(name.into());
        self
    }

    pub fn start_path(mut self, path: impl Into<String>) -> Self {
        self.config.browser.start_path = Some(path.into());
        self
    }

    pub fn reload_on_restart(mut self, reload: bool) -> Self {
        self.config.browser.reload_on_restart = reload;
        self
    }

    pub fn reload_delay_ms(mut self, ms: u64) -> Self {
        self.config.browser.reload_delay_ms = ms;
        self
    }

    pub fn reload_debounce_ms(mut self, ms: u64) -> Self {
        self.config.browser.reload_debounce_ms = ms;
        self
    }

    pub fn reload_throttle_ms(mut self, ms: u64) -> Self {
        self.config.browser.reload_throttle_ms = ms;
        self
    }

    pub fn notify(mut self, notify: bool) -> Self {
        self.config.browser.notify = notify;
        self
    }

    pub fn inject_changes(mut self, inject: bool) -> Self {
        self.config.browser.inject_changes = inject;
        self
    }

    pub fn inject_notification(mut self, inject: bool) -> Self {
        self.config.browser.inject_notification = inject;
        self
    }

    pub fn log_connections(mut self, log: bool) -> Self {
        self.config.logging.log_connections = log;
        self
    }

    pub fn log_file_changes(mut self, log: bool) -> Self {
        self.config.logging.log_file_changes = log;
        self
    }

    pub fn log_snippet(mut self, log: bool) -> Self {
        self.config.logging.log_snippet = log;
        self
    }

    pub fn timestamps(mut self, timestamps: bool) -> Self {
        self.config.logging.timestamps = timestamps;
        self
    }

    pub fn build(self) -> ServerConfiguration {
        self.config
    }
}
