mod config;
mod connections;
mod credentials;
mod dispatcher;
mod logging;
mod platforms;
mod queue;
mod server;
mod session;
mod shutdown;
mod storage;
mod supervisor;
mod utils;
mod validation;
mod wire;
mod worker;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use config::AppConfig;
use connections::ConnectionRegistry;
use dispatcher::{Dispatcher, DispatcherSettings};
use logging::{LogLevel, Logger, LoggerConfig};
use platforms::{builtin_handler, PlatformRegistry};
use serde_json::json;
use server::{InboundFrame, TcpServer};
use session::SessionContext;
use shutdown::{ShutdownHooks, ShutdownSequence};
use storage::StorageFacade;
use supervisor::ListenerSupervisor;
use utils::runtime::{adjust_open_file_limit, ensure_posix_or_exit};
use utils::startup_banner::print_startup_banner;
use validation::{SchemaValidator, ValidationGateway};

const MAIN_LOOP_PAUSE: Duration = Duration::from_millis(5);

/// Client-facing half of the instance: TCP transport plus dispatcher.
struct Gateway {
    server: Arc<TcpServer>,
    dispatcher: Dispatcher,
}

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });
    let base_logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });

    let session = Arc::new(SessionContext::generate().unwrap_or_else(|error| {
        eprintln!("session bootstrap error: {error}");
        process::exit(2);
    }));
    let logger = base_logger.for_session(session.session_id());
    adjust_open_file_limit(&logger);

    let platforms = PlatformRegistry::from_config(&app_config.host.platforms).unwrap_or_else(|error| {
        eprintln!("configuration error: {error}");
        process::exit(2);
    });
    let spawn_listener = !platforms.worker_platforms().is_empty()
        && app_config.host.listener_control.program.is_some();
    if !platforms.has_dispatcher() && !spawn_listener {
        eprintln!(
            "configuration error: host.platforms has no dispatcher role and host.listener_control.program is unset; nothing to run"
        );
        process::exit(2);
    }

    let storage = Arc::new(StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    }));
    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::boot"),
        "Session initialized",
        Some(json!({
            "platforms": platforms.entries(),
            "storage_engine": storage.engine().as_str(),
            "storage_path": storage.data_path().display().to_string(),
            "keyspace": session.keyspace_prefix(),
        })),
    );

    let mut gateway = if platforms.has_dispatcher() {
        match start_gateway(&app_config, &session, &storage, platforms.clone(), &logger) {
            Ok(gateway) => Some(gateway),
            Err(error) => {
                eprintln!("dispatcher initialization error: {error}");
                process::exit(1);
            }
        }
    } else {
        None
    };

    let mut supervisor = if spawn_listener {
        match ListenerSupervisor::spawn(
            &app_config.host.listener_control,
            session.session_id(),
            logger.clone(),
        ) {
            Ok(supervisor) => Some(supervisor),
            Err(error) => {
                eprintln!("listener-control startup error: {error}");
                if let Some(gateway) = gateway.as_mut() {
                    let _ = gateway.dispatcher.shutdown();
                }
                let _ = storage.purge_prefix(&session.keyspace_prefix());
                process::exit(1);
            }
        }
    } else {
        None
    };

    let exit_code = loop {
        if shutdown_hooks.is_triggered() {
            logger.info(
                Some("main::shutdown"),
                "Shutdown signal received, starting graceful shutdown",
            );
            break 0;
        }

        if let Some(listener) = supervisor.as_mut() {
            match listener.poll() {
                Ok(Some(code)) => {
                    logger.log(
                        LogLevel::Error,
                        Some("main::supervisor"),
                        "Listener-control subprocess closed; shutting down",
                        Some(json!({ "code": code })),
                    );
                    break 1;
                }
                Ok(None) => {}
                Err(error) => {
                    logger.error(Some("main::supervisor"), &error.to_string());
                    break 1;
                }
            }
        }

        if let Some(gateway) = gateway.as_ref() {
            pump_connections(gateway, &logger);
        }
        thread::sleep(MAIN_LOOP_PAUSE);
    };

    shut_down(&app_config, &session, &storage, gateway, supervisor, &logger);
    process::exit(exit_code);
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn start_gateway(
    app_config: &AppConfig,
    session: &Arc<SessionContext>,
    storage: &Arc<StorageFacade>,
    platforms: PlatformRegistry,
    logger: &Logger,
) -> Result<Gateway, String> {
    let server = Arc::new(TcpServer::from_app_config(app_config).map_err(|error| error.to_string())?);
    let bound_addr = server
        .local_addr()
        .map_err(|error| format!("failed to read local address: {error}"))?;
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} started non-blocking TCP server",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "tls_enabled": app_config.server.tls_enabled,
            "max_envelope_size_bytes": app_config.wire.max_envelope_size_bytes,
        })),
    );

    let registry: Arc<dyn ConnectionRegistry> = server.clone();
    let handlers = platforms
        .worker_platforms()
        .into_iter()
        .map(builtin_handler)
        .collect::<Vec<_>>();
    let mut dispatcher = Dispatcher::new(
        Arc::clone(session),
        Arc::clone(storage),
        platforms,
        registry,
        ValidationGateway::new(Arc::new(SchemaValidator), logger.clone()),
        DispatcherSettings::from_app_config(app_config),
        logger.clone(),
    );
    for handler in handlers {
        dispatcher.register_handler(handler);
    }
    dispatcher.start().map_err(|error| error.to_string())?;

    Ok(Gateway { server, dispatcher })
}

fn pump_connections(gateway: &Gateway, logger: &Logger) {
    loop {
        match gateway.server.try_accept_persistent() {
            Ok(Some(connection)) => {
                gateway.dispatcher.on_connected(connection.id());
                logger.log(
                    LogLevel::Info,
                    Some("main::server"),
                    "Accepted client connection",
                    Some(json!({
                        "connection_id": connection.id(),
                        "peer_addr": connection.peer_addr().to_string(),
                        "connections": gateway.dispatcher.connection_count(),
                    })),
                );
            }
            Ok(None) => break,
            Err(error) => {
                logger.warn(Some("main::server"), &error.to_string());
                break;
            }
        }
    }

    for connection in gateway.server.connections() {
        let batch = connection.read_available();
        for frame in batch.frames {
            match frame {
                InboundFrame::Envelope(envelope) => {
                    gateway.dispatcher.on_envelope(connection.id(), &envelope);
                }
                InboundFrame::Invalid { reason } => {
                    gateway.dispatcher.on_invalid_frame(connection.id(), &reason);
                }
            }
        }

        if batch.closed {
            gateway.server.drop_connection(connection.id());
            gateway.dispatcher.on_disconnected(connection.id());
            logger.log(
                LogLevel::Info,
                Some("main::server"),
                "Client connection closed",
                Some(json!({
                    "connection_id": connection.id(),
                    "connections": gateway.dispatcher.connection_count(),
                })),
            );
        }
    }
}

fn shut_down(
    app_config: &AppConfig,
    session: &SessionContext,
    storage: &StorageFacade,
    gateway: Option<Gateway>,
    mut supervisor: Option<ListenerSupervisor>,
    logger: &Logger,
) {
    let grace = Duration::from_millis(app_config.host.shutdown_grace_ms);
    let (server, mut dispatcher) = gateway
        .map(|gateway| (gateway.server, gateway.dispatcher))
        .unzip();

    ShutdownSequence::new(logger.clone())
        .step("dispatcher", || {
            if let Some(dispatcher) = dispatcher.as_mut() {
                if let Err(error) = dispatcher.shutdown() {
                    logger.error(Some("main::shutdown"), &error.to_string());
                }
            }
        })
        .step("purge", || match storage.purge_prefix(&session.keyspace_prefix()) {
            Ok(removed) => logger.log(
                LogLevel::Info,
                Some("main::shutdown"),
                "Session keyspace purged",
                Some(json!({ "removed_keys": removed })),
            ),
            Err(error) => logger.error(
                Some("main::shutdown"),
                &format!("failed to purge session keyspace: {error}"),
            ),
        })
        .step("listener-control", || {
            let Some(listener) = supervisor.as_mut() else {
                return;
            };
            if let Err(error) = listener.request_terminate() {
                logger.warn(Some("main::shutdown"), &error.to_string());
            }
            match listener.wait_for_exit(grace) {
                Ok(Some(code)) => logger.log(
                    LogLevel::Info,
                    Some("main::shutdown"),
                    "Listener-control subprocess stopped",
                    Some(json!({ "code": code })),
                ),
                Ok(None) => logger.warn(
                    Some("main::shutdown"),
                    "Listener-control subprocess still running after SIGINT",
                ),
                Err(error) => logger.warn(Some("main::shutdown"), &error.to_string()),
            }
        })
        .step("connections", || {
            if let Some(server) = server.as_ref() {
                server.shutdown_all_connections();
            }
        })
        .step("flush", || {
            if let Err(error) = storage.flush() {
                logger.error(
                    Some("main::shutdown"),
                    &format!("storage flush failed: {error}"),
                );
            }
        })
        .run(
            grace,
            Box::new(|| {
                eprintln!("graceful shutdown exceeded the grace period; forcing exit");
                process::exit(1);
            }),
        );

    logger.info(Some("main::shutdown"), "Shutdown completed");
}
