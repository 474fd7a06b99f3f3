//! binary bootstrap: settings, logging, ctrl-c, engine loop
use {
    crate::{
        display::ConsoleDisplay,
        engine::Engine,
        events::EventBus,
        settings::SettingsStore,
    },
    color_eyre::eyre::Context,
    std::sync::Arc,
    tracing::info,
};

pub mod logging;

/// run the engine headless against the console display
///
/// # Errors
///
/// returns an error if settings, logging, or engine initialisation fail;
/// runtime failures degrade to an error placeholder instead
pub async fn run() -> color_eyre::Result<()> {
    let settings = SettingsStore::load()?;
    logging::setup(&settings.get().logging)?;

    let events = Arc::new(EventBus::new());
    let display = Arc::new(ConsoleDisplay::default());
    let mut engine = Engine::new(settings, display, events);

    engine.initialize().context("engine initialisation failed")?;
    engine.start().await.context("engine start failed")?;

    let handle = engine.handle();
    ctrlc::set_handler(move || {
        handle.stop(true);
    })
    .context("failed to set ctrl-c handler")?;

    info!(
        "{} v{} running, ctrl-c to exit",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    engine.run().await;
    Ok(())
}
