use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();
    fmt().with_env_filter(filter).init();

    let config = filedepot::config::Config::from_env()?;

    // Startup banner at info level so something always prints at default
    // verbosity.
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "filedepot",
        "filedepot starting: RUST_LOG='{}', http_port={}, file_root='{}', data_dir='{}', audit_log='{}', max_s3_connections={}",
        rust_log,
        config.http_port,
        config.file_root.display(),
        config.data_dir.display(),
        config.audit_log_path.display(),
        config.max_s3_connections,
    );

    filedepot::server::run(config).await
}
