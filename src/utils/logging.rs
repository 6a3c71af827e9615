use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber for the host binary.
pub fn setup_logging(level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
