use std::borrow::Cow;

use owo_colors::OwoColorize;
use tokio::task;

use crate::{
    config::{ServerConfiguration, usage},
    error::UsageError,
    files,
    startup::Application,
};

enum ValueTone {
    Primary,
    Success,
    Warning,
    Danger,
    Accent,
    Muted,
}

/// Name the binary was invoked as, for the usage line.
pub fn program_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .map(std::path::Path::new)
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from(env!("CARGO_PKG_NAME")))
}

pub fn print_usage_error(error: &UsageError, program: &str) {
    eprintln!("{error}");
    eprintln!("{}", usage(program));
}

pub fn print_startup_summary(config: &ServerConfiguration, app: &Application) {
    let title = "LIVE SERVE";
    let border = "=".repeat(title.len() + 8);

    println!("{}", border.clone().bright_black());
    println!("  {}", title.cyan().bold());
    println!("{}", border.bright_black());

    let base_dir = Cow::Owned(app.root().display().to_string());
    let watching = if config.watch().enabled {
        let events = config
            .watch()
            .events
            .iter()
            .map(|event| format!("{event:?}").to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(", ");
        Cow::Owned(format!(
            "{events} (debounce {} ms)",
            config.browser().reload_debounce_ms
        ))
    } else {
        Cow::Borrowed("disabled")
    };
    let inject = if config.browser().inject_changes {
        Cow::Borrowed("CSS injected without reload")
    } else {
        Cow::Borrowed("Full page reloads")
    };
    let browser = if config.browser().open {
        Cow::Borrowed("Auto-open on start")
    } else {
        Cow::Borrowed("Manual")
    };

    let mut rows: Vec<(&str, Cow<'_, str>, ValueTone)> = vec![
        ("Local", Cow::Owned(app.primary_url()), ValueTone::Primary),
        ("UI", Cow::Owned(app.ui_url()), ValueTone::Muted),
        ("Base Dir", base_dir, ValueTone::Accent),
        (
            "Watching",
            watching,
            if config.watch().enabled {
                ValueTone::Success
            } else {
                ValueTone::Danger
            },
        ),
        ("Changes", inject, ValueTone::Warning),
        ("Browser", browser, ValueTone::Accent),
        (
            "Exit",
            Cow::Borrowed("Press Ctrl+C to stop"),
            ValueTone::Accent,
        ),
    ];

    if let Some(host) = config.serve().host {
        rows.insert(
            1,
            (
                "Bound",
                Cow::Owned(format!("{host}:{}", app.port())),
                ValueTone::Muted,
            ),
        );
    }

    let label_width = rows
        .iter()
        .map(|(label, _, _)| label.len())
        .max()
        .unwrap_or(0)
        + 1;

    for (label, value, tone) in rows {
        let padded_label = format!("{label:<label_width$}:", label_width = label_width);
        let colored_label = format!("{}", padded_label.bright_blue().bold());
        let colored_value = colorize(value.as_ref(), tone);

        println!("  {} {}", colored_label, colored_value);
    }

    println!();
    if config.logging().log_snippet {
        match files::client_snippet(app.client_options()) {
            Ok(snippet) => {
                println!(
                    "  {}",
                    "Pages served elsewhere can live reload with:"
                        .bright_black()
                        .italic()
                );
                println!(
                    "  {}",
                    snippet
                        .replace(
                            files::CLIENT_SCRIPT_PATH,
                            &format!("{}{}", app.primary_url(), files::CLIENT_SCRIPT_PATH)
                        )
                        .bright_black()
                );
                println!();
            }
            Err(error) => tracing::warn!(%error, "failed to render client snippet"),
        }
    }
    println!(
        "  {}",
        "Leave this terminal open to keep the live server running."
            .bright_black()
            .italic()
    );
    println!();
}

fn colorize(value: &str, tone: ValueTone) -> String {
    match tone {
        ValueTone::Primary => value.bold().bright_white().to_string(),
        ValueTone::Success => value.bold().bright_green().to_string(),
        ValueTone::Warning => value.to_string().bright_yellow().to_string(),
        ValueTone::Danger => value.bold().bright_red().to_string(),
        ValueTone::Accent => value.to_string().bright_cyan().to_string(),
        ValueTone::Muted => value.to_string().dimmed().to_string(),
    }
}

/// URL the browser should be opened at, honouring the configured start path.
pub fn open_url(config: &ServerConfiguration, app: &Application) -> String {
    let base = app.primary_url();
    match config.browser().start_path.as_deref() {
        Some(path) if !path.is_empty() => {
            format!("{base}/{}", path.trim_start_matches('/'))
        }
        _ => base,
    }
}

pub fn launch_browser(url: String, browser: Option<String>) {
    task::spawn(async move {
        let opened = task::spawn_blocking(move || match browser {
            Some(app) => open::with(url, app),
            None => open::that(url),
        })
        .await;

        match opened {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(%error, "failed to open browser");
            }
            Err(error) => {
                tracing::warn!(%error, "browser task join error");
            }
        }
    });
}
