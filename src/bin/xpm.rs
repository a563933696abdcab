use anyhow::Context;
use tracing_subscriber::EnvFilter;
use xpm_core::Settings;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let settings_path = match std::env::args_os().nth(1) {
        Some(path) => path.into(),
        None => Settings::default_path()?,
    };
    let settings = Settings::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    let manager = settings.open_manager().context("opening plugins folder")?;

    let plugins = manager.scan()?;
    println!(
        "Installed plugins in {}: {}",
        manager.plugins_root().path().display(),
        plugins.len()
    );
    for plugin in &plugins {
        println!("  {:<40} {}", plugin.name, plugin.state);
    }

    Ok(())
}
