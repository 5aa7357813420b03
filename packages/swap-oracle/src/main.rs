//! HTLC Swap Oracle
//!
//! Off-chain coordinator driving two-phase hash-time-locked atomic swaps
//! between an Asset chain and a Payment chain. Escrow contracts on each
//! chain emit time requests; the oracle answers them, pairs the two legs
//! of each swap by their shared trade id, enforces the timeout-inversion
//! guard, and drives both legs to a symmetric refunded state on failure.
//!
//! # Architecture
//!
//! One event pump per chain feeds a per-trade dispatcher; handlers run the
//! swap state machine and submit callbacks through a nonce-managed
//! submitter. A periodic sweeper fires confirmation-phase and
//! execution-phase timeouts. A read-only HTTP surface exposes health,
//! status, and a payment-verification audit hook.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::WrapErr;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use swap_oracle::chain::{ChainClient, ChainRole};
use swap_oracle::clock::SystemClock;
use swap_oracle::config::Config;
use swap_oracle::coordinator::{ChainSide, SwapCoordinator};
use swap_oracle::dispatcher::TradeDispatcher;
use swap_oracle::evm::EvmChainClient;
use swap_oracle::nonce::NonceManager;
use swap_oracle::pump::EventPump;
use swap_oracle::runlog::RunLog;
use swap_oracle::server::{self, AppState, Metrics, OracleStats, SharedMetrics, SharedStats};
use swap_oracle::submitter::Submitter;
use swap_oracle::sweeper::TimeoutSweeper;
use swap_oracle::verifier::PaymentVerifier;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    let runlog = init_logging(&config.log_dir)?;

    info!("Starting HTLC Swap Oracle");
    info!(
        oracle_id = %config.oracle_id,
        asset_rpc = %config.asset_rpc_url,
        payment_rpc = %config.payment_rpc_url,
        asset_escrow = %config.asset_contract_address,
        payment_escrow = %config.payment_contract_address,
        server_port = config.server_port,
        log_file = %runlog.path().display(),
        "Configuration loaded"
    );

    let asset_client = Arc::new(EvmChainClient::new(
        &config.asset_rpc_url,
        &config.asset_contract_address,
        &config.asset_signer_key,
    )?);
    let payment_client = Arc::new(EvmChainClient::new(
        &config.payment_rpc_url,
        &config.payment_contract_address,
        &config.payment_signer_key,
    )?);

    // Both chains must answer before the oracle starts; a signer that
    // cannot reach its chain is a fatal startup error.
    let asset_head = startup_probe(asset_client.as_ref(), ChainRole::Asset).await?;
    let payment_head = startup_probe(payment_client.as_ref(), ChainRole::Payment).await?;

    let stats: SharedStats = Arc::new(RwLock::new(OracleStats {
        oracle_id: config.oracle_id.clone(),
        ..Default::default()
    }));
    let metrics: SharedMetrics = Arc::new(Metrics::new());

    let make_side = |role: ChainRole, client: Arc<dyn ChainClient>| {
        let nonces = Arc::new(NonceManager::new(client.signer_address()));
        ChainSide::new(
            role,
            Submitter::new(
                role,
                client,
                nonces,
                config.callback_gas_limit,
                config.submit_max_retries,
            ),
        )
    };

    let coordinator = Arc::new(SwapCoordinator::new(
        make_side(ChainRole::Asset, asset_client.clone()),
        make_side(ChainRole::Payment, payment_client.clone()),
        Arc::new(SystemClock),
        Arc::clone(&stats),
        Arc::clone(&metrics),
    ));
    let dispatcher = Arc::new(TradeDispatcher::new(Arc::clone(&coordinator)));

    let asset_pump = EventPump::new(
        ChainRole::Asset,
        asset_client.clone(),
        Arc::clone(&dispatcher),
        config.event_poll_interval,
        asset_head,
        Arc::clone(&stats),
        Arc::clone(&metrics),
    );
    let payment_pump = EventPump::new(
        ChainRole::Payment,
        payment_client.clone(),
        Arc::clone(&dispatcher),
        config.event_poll_interval,
        payment_head,
        Arc::clone(&stats),
        Arc::clone(&metrics),
    );
    let sweeper = TimeoutSweeper::new(Arc::clone(&coordinator), config.sweep_interval);

    let verifier = Arc::new(
        PaymentVerifier::new(
            payment_client.clone(),
            payment_client.contract_address(),
            config.verifier_confirmation_table.clone(),
        )
        .with_observers(Arc::clone(&stats), Arc::clone(&metrics)),
    );

    let app_state = AppState {
        stats: Arc::clone(&stats),
        metrics: Arc::clone(&metrics),
        coordinator: Arc::clone(&coordinator),
        asset_client: asset_client.clone(),
        payment_client: payment_client.clone(),
        verifier,
        log_file: Some(runlog.path().to_path_buf()),
        expose_logs: config.expose_logs,
        api_token: config.status_api_token.as_deref().map(Arc::from),
        start_time: Instant::now(),
    };

    let bind_address = config.server_bind_address.clone();
    let server_port = config.server_port;
    let rate_per_second = config.rate_limit_per_second;
    let rate_burst_size = config.rate_limit_burst_size;
    tokio::spawn(async move {
        if let Err(e) = server::start_server(
            &bind_address,
            server_port,
            rate_per_second,
            rate_burst_size,
            app_state,
        )
        .await
        {
            error!(error = %e, "Status server error");
        }
    });

    // One shutdown channel per long-running task
    let (shutdown_asset_tx, shutdown_asset_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_payment_tx, shutdown_payment_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_sweeper_tx, shutdown_sweeper_rx) = tokio::sync::mpsc::channel::<()>(1);

    tokio::spawn(async move {
        shutdown_requested().await;
        let _ = shutdown_asset_tx.send(()).await;
        let _ = shutdown_payment_tx.send(()).await;
        let _ = shutdown_sweeper_tx.send(()).await;
    });

    let (asset_result, payment_result, sweeper_result) = tokio::join!(
        asset_pump.run(shutdown_asset_rx),
        payment_pump.run(shutdown_payment_rx),
        sweeper.run(shutdown_sweeper_rx),
    );
    asset_result?;
    payment_result?;
    sweeper_result?;

    // In-flight trade handlers get a bounded grace period to finish.
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let busy: usize = [ChainRole::Asset, ChainRole::Payment]
                .iter()
                .map(|role| coordinator.store(*role).processing_count())
                .sum();
            if busy == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_ok();

    if !drained {
        for role in [ChainRole::Asset, ChainRole::Payment] {
            warn!(
                chain = role.label(),
                active_trades = ?coordinator.store(role).active_trade_ids(),
                "Shutdown grace period expired with handlers still in flight"
            );
        }
    }

    info!("HTLC Swap Oracle stopped");
    Ok(())
}

/// Verify a chain answers both the head query and the signer's nonce
/// lookup; returns the current head for the pump's starting cursor.
async fn startup_probe(client: &EvmChainClient, role: ChainRole) -> eyre::Result<u64> {
    let head = client
        .block_number()
        .await
        .wrap_err_with(|| format!("{} chain unreachable", role.label()))?;
    let nonce = client
        .transaction_count(client.signer_address())
        .await
        .wrap_err_with(|| format!("{} chain rejected signer nonce lookup", role.label()))?;

    info!(
        chain = role.label(),
        head,
        signer = %client.signer_address(),
        nonce,
        "Chain reachable"
    );
    Ok(head)
}

fn init_logging(log_dir: &Path) -> eyre::Result<RunLog> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let runlog = RunLog::create(log_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_oracle=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(runlog.clone()),
        )
        .with(filter)
        .init();

    Ok(runlog)
}

/// Resolves once the process is asked to stop: Ctrl+C anywhere, SIGTERM
/// on unix (what container runtimes send).
async fn shutdown_requested() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation cannot fail");

        tokio::select! {
            _ = signal::ctrl_c() => info!("Interrupt received, stopping oracle tasks"),
            _ = sigterm.recv() => info!("SIGTERM received, stopping oracle tasks"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Interrupt received, stopping oracle tasks");
    }
}
