use anyhow::Context;
use clap::Parser;
use log::info;

use monitor::backend::BackendKind;
use monitor::cli::{Cli, Settings};
use monitor::input::InputSource;
use monitor::session::{Monitor, SessionOptions};
use monitor::{logger, terminal};

/// Entry point for the host-side monitor.
///
/// Resolves settings (CLI over optional TOML config), connects the selected
/// debug backend, attaches to the channel, and runs the polling loop until
/// the firmware asks us to leave, the input source ends, or a signal
/// arrives. Exit code 0 on a clean shutdown, 1 on connect or fatal runtime
/// failure.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(cli).context("invalid configuration")?;

    // Keep logger alive for the duration of the process.
    let _logger = logger::init_logger(&settings.log_spec)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    terminal::install_shutdown_handler().context("failed to install signal handlers")?;

    info!(
        "connecting to {} backend at {}:{}",
        match settings.kind {
            BackendKind::Openocd => "openocd",
            BackendKind::Gdb => "gdb",
        },
        settings.host,
        settings.port
    );
    let backend = settings
        .kind
        .connect(&settings.host, settings.port)
        .with_context(|| {
            format!(
                "failed to connect to the debug server at {}:{}",
                settings.host, settings.port
            )
        })?;

    let opts = SessionOptions {
        snapshot: settings.snapshot,
        blocking: settings.blocking,
        show_time: settings.show_time,
        interval: settings.interval,
    };
    let mut session =
        Monitor::connect(backend, settings.addr, opts).context("failed to attach to the channel")?;

    if let Some(path) = &settings.input_file {
        session.set_input(
            InputSource::from_file(path, false)
                .with_context(|| format!("cannot open input file {}", path.display()))?,
        );
    } else if let Some(path) = &settings.init_script {
        session.set_input(
            InputSource::from_file(path, true)
                .with_context(|| format!("cannot open init script {}", path.display()))?,
        );
    }

    let result = session.run();
    session.disconnect();
    result.context("monitor loop failed")?;

    info!("clean shutdown");
    Ok(())
}
