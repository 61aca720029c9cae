use dreamqueue_core::config::{AppConfig, ModeConfig};

fn main() -> anyhow::Result<()> {
    dreamqueue_core::init_tracing();

    let config = AppConfig::load("config/app.toml").unwrap_or_else(|err| {
        tracing::warn!(%err, "failed to load config/app.toml, falling back to defaults");
        AppConfig::default()
    });

    let mode_config = ModeConfig::load(&config.modes_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    if let Err(err) = runtime.block_on(dreamqueue_core::run(config, mode_config)) {
        tracing::error!(%err, "server exited with an error");
        std::process::exit(1);
    }

    Ok(())
}
