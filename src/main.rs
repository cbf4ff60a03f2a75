use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use chairbook::clock::SystemClock;
use chairbook::config::Config;
use chairbook::notify::{LogNotifier, NotificationDispatcher};
use chairbook::policy::CancellationPolicy;
use chairbook::registry::SlotRegistry;
use chairbook::service::SchedulingService;
use chairbook::validator::ReservationValidator;
use chairbook::{compactor, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    chairbook::observability::init(config.metrics_port)?;

    let tls_acceptor =
        chairbook::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    std::fs::create_dir_all(&config.data_dir)?;

    let registry = Arc::new(SlotRegistry::open(config.wal_path(), config.storage_timeout)?);
    tokio::spawn(compactor::run_compactor(registry.clone(), config.compact_threshold));

    let (notifications, _notify_worker) = NotificationDispatcher::spawn(Arc::new(LogNotifier));
    let service = Arc::new(
        SchedulingService::new(
            registry,
            Arc::new(SystemClock::new(config.utc_offset)),
            ReservationValidator::new(config.booking_rules()),
            CancellationPolicy::new(config.cancel_lead),
            notifications,
        )
        .with_owner_email(config.owner_email.clone()),
    );

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("chairbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  utc_offset: {}", config.utc_offset);
    info!(
        "  cooldown: {} days, cancel lead: {} min",
        config.cooldown_days,
        config.cancel_lead.num_minutes()
    );
    info!(
        "  calendar: {}",
        config.calendar.as_ref().map_or("any time".to_string(), |c| format!(
            "{} slots, {:?}",
            c.times.len(),
            c.open_days
        ))
    );
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(chairbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(chairbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(chairbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let svc = service.clone();
                let pw = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, svc, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(chairbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("chairbook stopped");
    Ok(())
}
