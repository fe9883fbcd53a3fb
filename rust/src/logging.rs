/// Logging initialization.
///
/// Installs a `tracing-subscriber` fmt layer on stderr and, when `data_dir` is
/// writable, a second plain-text layer appending to `<data_dir>/courier.log`.
/// `RUST_LOG` overrides the default filter. Safe to call more than once.
pub fn init_logging(data_dir: &std::path::Path) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "courier_core=debug,nostr_relay_pool=info,info".into());

    let _ = std::fs::create_dir_all(data_dir);
    let file_layer = if let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join("courier.log"))
    {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn creates_log_file_and_tolerates_reinit() {
        let dir = tempfile::tempdir().unwrap();
        super::init_logging(dir.path());
        super::init_logging(dir.path());
        tracing::info!("logging initialized");
        assert!(dir.path().join("courier.log").exists());
    }
}
