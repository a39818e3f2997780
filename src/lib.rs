pub mod bridge;
pub mod cli;
pub mod io;
mod logging;
pub mod settings;

use clap::Parser;
use std::process::ExitCode;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info};

use bridge::{BridgeLoop, BridgeOptions, BridgeStats};
use cli::Args;
use io::{BridgeError, BusChannel, MqttBroker};
use settings::BridgeConfig;

/// Clean shutdown
pub const EXIT_SUCCESS: u8 = 0;
/// Bad arguments or configuration file
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// CAN adapter could not be opened or went away
pub const EXIT_ADAPTER_ERROR: u8 = 2;
/// Broker connection could not be established
pub const EXIT_BROKER_ERROR: u8 = 3;
/// Anything else
pub const EXIT_RUNTIME_ERROR: u8 = 4;

/// Process exit code for a fatal error.
pub fn exit_code(error: &BridgeError) -> u8 {
    match error {
        BridgeError::Config(_) => EXIT_CONFIG_ERROR,
        BridgeError::AdapterOpen { .. } | BridgeError::AdapterRead { .. } => EXIT_ADAPTER_ERROR,
        BridgeError::BrokerConnect { .. } => EXIT_BROKER_ERROR,
        _ => EXIT_RUNTIME_ERROR,
    }
}

/// Resolves on SIGINT/SIGTERM (Ctrl+C elsewhere).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, stopping after current cycle"),
            _ = sigterm.recv() => info!("received SIGTERM, stopping after current cycle"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C, stopping after current cycle");
    }

    Ok(())
}

/// Raise `stop` once `signal` resolves. If the handler could not be
/// installed the bridge keeps running and can only be killed.
async fn stop_on_signal<F>(signal: F, stop: Arc<AtomicBool>)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => stop.store(true, Ordering::Relaxed),
        Err(e) => error!("failed to install signal handler, running without graceful stop: {}", e),
    }
}

/// Open both channels and run the bridge until a stop signal or a fatal error.
pub async fn serve(config: BridgeConfig) -> Result<BridgeStats, BridgeError> {
    let mut bus = io::open_bus(&config.bus)?;

    let broker = match MqttBroker::connect(&config.broker).await {
        Ok(broker) => broker,
        Err(e) => {
            bus.close().await;
            return Err(e);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    tokio::spawn(stop_on_signal(wait_for_shutdown_signal(), stop.clone()));

    let mut bridge = BridgeLoop::new(bus, broker, BridgeOptions::from(&config.bridge));
    bridge.run(stop).await
}

/// Command-line entry point.
pub fn run() -> ExitCode {
    let args = Args::parse();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("  Hint: Use --help for usage information");
            return ExitCode::from(exit_code(&e));
        }
    };

    if let Err(e) = logging::init(args.verbose, args.log_dir.as_deref()) {
        eprintln!("Error: {}", e);
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(_) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&BridgeError::config("bad topic")), EXIT_CONFIG_ERROR);
        assert_eq!(
            exit_code(&BridgeError::adapter_open("socketcan(can0)", "No such device")),
            EXIT_ADAPTER_ERROR
        );
        assert_eq!(
            exit_code(&BridgeError::adapter_read("socketcan(can0)", "Network is down")),
            EXIT_ADAPTER_ERROR
        );
        assert_eq!(
            exit_code(&BridgeError::broker_connect("mqtts://api.savvycan.com:8883", "timeout")),
            EXIT_BROKER_ERROR
        );
        let io_err = std::io::Error::other("boom");
        assert_eq!(exit_code(&BridgeError::from(io_err)), EXIT_RUNTIME_ERROR);
    }

    #[tokio::test]
    async fn test_stop_raised_on_signal() {
        let stop = Arc::new(AtomicBool::new(false));
        stop_on_signal(async { Ok::<(), std::io::Error>(()) }, stop.clone()).await;
        assert!(stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_signal_handler_failure_keeps_running() {
        let stop = Arc::new(AtomicBool::new(false));
        let failed = async { Err::<(), _>(std::io::Error::other("signal driver unavailable")) };
        stop_on_signal(failed, stop.clone()).await;
        assert!(!stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_serve_unknown_bus_type_fails_before_connecting() {
        let mut config = BridgeConfig::default();
        config.bus.bus_type = "kvaser".to_string();
        let err = serve(config).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_ADAPTER_ERROR);
    }

    #[tokio::test]
    async fn test_serve_unreachable_broker() {
        let mut config = BridgeConfig::default();
        config.bus.bus_type = "virtual".to_string();
        config.broker.host = "127.0.0.1".to_string();
        config.broker.port = 1;
        config.broker.connect_timeout_ms = 2000;
        let err = serve(config).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_BROKER_ERROR);
    }
}
