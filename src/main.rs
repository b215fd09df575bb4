use dirnode_agreement::{
    logger, start_server, AgreementConfig, AgreementCoordinator, AgreementSink, HttpTransport,
    StaticDirectory,
};
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Downstream consumer of the agreed value. The real directory layer
/// stores it as the new shared round token; the standalone binary just
/// makes it visible.
struct LogSink;

impl AgreementSink for LogSink {
    fn use_agreement(&self, value: i64) {
        info!(value, "new common random available");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logger::init_logger_detailed();

    let args: Vec<String> = env::args().collect();
    let node_id = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "node-0".to_string());
    let port: u16 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(8440);
    let start_now = args.iter().any(|a| a == "--start-now");

    let config = AgreementConfig::from_env()?;
    let fleet = env::var("AGREEMENT_FLEET")
        .unwrap_or_else(|_| format!("{}=127.0.0.1:{}", node_id, port));

    info!(%node_id, port, "starting directory node agreement service");

    let directory = Arc::new(StaticDirectory::parse(&fleet));
    let transport = Arc::new(HttpTransport::default());
    let coordinator = AgreementCoordinator::new(
        node_id.clone(),
        config,
        transport,
        directory,
        Arc::new(LogSink),
    );

    let server_coordinator = coordinator.clone();
    thread::spawn(move || {
        actix_rt::System::new().block_on(async move {
            if let Err(e) = start_server(port, server_coordinator).await {
                error!(%e, "agreement HTTP server terminated");
            }
        });
    });

    // Give the server a moment to bind before announcing ourselves.
    tokio::time::sleep(Duration::from_millis(500)).await;

    coordinator.start();
    if start_now {
        coordinator.start_protocol_by_operator();
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
