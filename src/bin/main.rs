use helmd::{
    cli::{self, Commands},
    error::ApiError,
    health::ServiceHealth,
    ipc::{self, ControlCommand, ControlError, ControlResponse, StartMode},
    orchestrator::Orchestrator,
    runtime,
    supervisor::ServiceStatus,
};
use std::{
    env,
    error::Error,
    os::unix::net::UnixListener,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    let args = cli::parse_args();
    init_logging(&args);

    if let Some(root) = &args.install_root {
        runtime::init(PathBuf::from(root));
    }

    let result = match args.command {
        Commands::Serve { bind } => run_daemon(bind),
        Commands::Start { name, mode } => run_start(name, mode.map(Into::into)),
        Commands::Stop { name } => run_stop(name),
        Commands::Restart { name, mode } => run_restart(name, mode.map(Into::into)),
        Commands::Status { name, json } => run_status(name, json),
        Commands::List => run_list(),
    };

    if let Err(err) = result {
        error!("{err}");
        process::exit(1);
    }
}

fn init_logging(args: &cli::Cli) {
    let default_directive = args
        .log_level
        .map(|level| level.as_str().to_string())
        .or_else(|| env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(&default_directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_mode(explicit: Option<StartMode>) -> StartMode {
    explicit.unwrap_or_else(|| {
        if env::var("DEV_MODE").map(|v| v == "true" || v == "1").unwrap_or(false) {
            StartMode::Development
        } else {
            StartMode::Production
        }
    })
}

/// Runs the resident orchestrator: boots every subsystem, serves the control
/// API, answers the Unix control socket, and runs the health-monitor loop
/// until interrupted.
fn run_daemon(bind: String) -> Result<(), Box<dyn Error>> {
    runtime::ensure_directories()?;
    ipc::cleanup_socket()?;

    info!("bootstrapping orchestrator state");
    let orchestrator = Orchestrator::bootstrap()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let control_handle = {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || run_control_loop(orchestrator, shutdown))
    };

    let health_handle = {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || run_health_loop(orchestrator, shutdown))
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(serve_api(orchestrator.clone(), bind, shutdown.clone()))?;

    shutdown.store(true, Ordering::SeqCst);
    if let Err(err) = control_handle.join() {
        warn!("control loop thread panicked: {err:?}");
    }
    if let Err(err) = health_handle.join() {
        warn!("health monitor thread panicked: {err:?}");
    }

    info!("shutting down managed services");
    orchestrator.supervisor.shutdown_all()?;
    ipc::cleanup_socket()?;
    Ok(())
}

async fn serve_api(
    orchestrator: Orchestrator,
    bind: String,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    let ctx = helmd::api::ApiContext::new(orchestrator);
    let router = helmd::api::build_router(ctx);

    let addr: std::net::SocketAddr = bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
            }
        })
        .await?;
    Ok(())
}

/// Accepts control-channel connections on the Unix socket and dispatches
/// each command against the shared orchestrator state.
fn run_control_loop(orchestrator: Orchestrator, shutdown: Arc<AtomicBool>) {
    let path = ipc::socket_path();
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind control socket at {}: {err}", path.display());
            return;
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        error!("failed to make control socket non-blocking: {err}");
        return;
    }

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!("failed to set control stream blocking: {err}");
                    continue;
                }
                let command = match ipc::read_command(&mut stream) {
                    Ok(command) => command,
                    Err(err) => {
                        warn!("malformed control command: {err}");
                        continue;
                    }
                };
                if matches!(command, ControlCommand::Shutdown) {
                    shutdown.store(true, Ordering::SeqCst);
                    let _ = ipc::write_response(&mut stream, &ControlResponse::Ok);
                    break;
                }
                let response = handle_control_command(&orchestrator, command);
                if let Err(err) = ipc::write_response(&mut stream, &response) {
                    warn!("failed to write control response: {err}");
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(SHUTDOWN_POLL_INTERVAL);
            }
            Err(err) => {
                warn!("control socket accept failed: {err}");
            }
        }
    }
}

fn handle_control_command(orchestrator: &Orchestrator, command: ControlCommand) -> ControlResponse {
    let outcome = match command {
        ControlCommand::Start { service, mode } => orchestrator
            .start_service(&service, mode)
            .map(|status| ControlResponse::Status(vec![status])),
        ControlCommand::Stop { service } => orchestrator
            .stop_service(&service)
            .map(|status| ControlResponse::Status(vec![status])),
        ControlCommand::Restart { service, mode } => orchestrator
            .restart_service(&service, mode)
            .map(|status| ControlResponse::Status(vec![status])),
        ControlCommand::Status { service: Some(name) } => orchestrator
            .supervisor
            .status(&name)
            .map(|status| ControlResponse::Status(vec![status]))
            .map_err(ApiError::from),
        ControlCommand::Status { service: None } => {
            orchestrator.status_all().map(ControlResponse::Status)
        }
        ControlCommand::Health { service: Some(name) } => orchestrator
            .health_one(&name)
            .map(|health| ControlResponse::Health(vec![health])),
        ControlCommand::Health { service: None } => {
            Ok(ControlResponse::Health(orchestrator.health_tick()))
        }
        ControlCommand::List => Ok(ControlResponse::List(orchestrator.supervisor.list())),
        ControlCommand::Shutdown => Ok(ControlResponse::Ok),
    };

    outcome.unwrap_or_else(|err| ControlResponse::Error(err.to_string()))
}

/// Runs the periodic health probe tick and, once a day, the log retention
/// sweep, until told to stop.
fn run_health_loop(orchestrator: Orchestrator, shutdown: Arc<AtomicBool>) {
    let mut last_retention = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        let tick: Vec<ServiceHealth> = orchestrator.health_tick();
        for service in &tick {
            if let Some(health) = service.health {
                if !matches!(health, helmd::health::HealthState::Healthy) {
                    warn!(service = %service.name, ?health, "service health degraded");
                }
            }
        }

        if last_retention.elapsed() >= RETENTION_SWEEP_INTERVAL {
            match orchestrator.enforce_log_retention() {
                Ok(deleted) => info!(deleted, "log retention sweep complete"),
                Err(err) => warn!("log retention sweep failed: {err}"),
            }
            last_retention = Instant::now();
        }

        sleep_with_shutdown_check(helmd::constants::DEFAULT_HEALTH_INTERVAL, &shutdown);
    }
}

fn sleep_with_shutdown_check(total: Duration, shutdown: &Arc<AtomicBool>) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(SHUTDOWN_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Sends a control command to the resident daemon, falling back to a
/// direct, non-resident bootstrap (which re-adopts any already-running
/// processes from their pidfiles) when no daemon is listening.
fn with_daemon_or_direct<F>(command: ControlCommand, direct: F) -> Result<ControlResponse, Box<dyn Error>>
where
    F: FnOnce(&Orchestrator) -> Result<ControlResponse, ApiError>,
{
    match ipc::send_command(&command) {
        Ok(response) => Ok(response),
        Err(ControlError::NotAvailable) => {
            let orchestrator = Orchestrator::bootstrap()?;
            Ok(direct(&orchestrator)?)
        }
        Err(err) => Err(err.into()),
    }
}

fn run_start(name: Option<String>, mode: Option<StartMode>) -> Result<(), Box<dyn Error>> {
    let mode = resolve_mode(mode);
    match name {
        Some(service) => {
            let response = with_daemon_or_direct(
                ControlCommand::Start { service: service.clone(), mode },
                |orchestrator| orchestrator.start_service(&service, mode).map(|s| ControlResponse::Status(vec![s])),
            )?;
            print_response(response)?;
        }
        None => {
            let orchestrator = Orchestrator::bootstrap()?;
            orchestrator.supervisor.start_all(mode)?;
            print_bare_statuses(&orchestrator.status_all()?);
        }
    }
    Ok(())
}

fn run_stop(name: Option<String>) -> Result<(), Box<dyn Error>> {
    match name {
        Some(service) => {
            let response = with_daemon_or_direct(
                ControlCommand::Stop { service: service.clone() },
                |orchestrator| orchestrator.stop_service(&service).map(|s| ControlResponse::Status(vec![s])),
            )?;
            print_response(response)?;
        }
        None => {
            let orchestrator = Orchestrator::bootstrap()?;
            orchestrator.supervisor.shutdown_all()?;
            print_bare_statuses(&orchestrator.status_all()?);
        }
    }
    Ok(())
}

fn run_restart(name: Option<String>, mode: Option<StartMode>) -> Result<(), Box<dyn Error>> {
    let mode = resolve_mode(mode);
    match name {
        Some(service) => {
            let response = with_daemon_or_direct(
                ControlCommand::Restart { service: service.clone(), mode },
                |orchestrator| orchestrator.restart_service(&service, mode).map(|s| ControlResponse::Status(vec![s])),
            )?;
            print_response(response)?;
        }
        None => {
            let orchestrator = Orchestrator::bootstrap()?;
            orchestrator.supervisor.shutdown_all()?;
            orchestrator.supervisor.start_all(mode)?;
            print_bare_statuses(&orchestrator.status_all()?);
        }
    }
    Ok(())
}

fn run_status(name: Option<String>, json: bool) -> Result<(), Box<dyn Error>> {
    let status_response = with_daemon_or_direct(
        ControlCommand::Status { service: name.clone() },
        |orchestrator| -> Result<ControlResponse, ApiError> {
            match &name {
                Some(n) => orchestrator
                    .supervisor
                    .status(n)
                    .map(|s| ControlResponse::Status(vec![s]))
                    .map_err(ApiError::from),
                None => orchestrator.status_all().map(ControlResponse::Status),
            }
        },
    )?;
    let health_response = with_daemon_or_direct(
        ControlCommand::Health { service: name.clone() },
        |orchestrator| -> Result<ControlResponse, ApiError> {
            match &name {
                Some(n) => orchestrator.health_one(n).map(|h| ControlResponse::Health(vec![h])),
                None => Ok(ControlResponse::Health(orchestrator.health_tick())),
            }
        },
    )?;

    let statuses = match status_response {
        ControlResponse::Status(statuses) => statuses,
        ControlResponse::Error(message) => return Err(message.into()),
        _ => Vec::new(),
    };
    let healths = match health_response {
        ControlResponse::Health(healths) => healths,
        ControlResponse::Error(message) => return Err(message.into()),
        _ => Vec::new(),
    };

    if json {
        let combined: Vec<_> = statuses
            .iter()
            .map(|status| {
                let health = healths.iter().find(|h| h.name == status.name);
                serde_json::json!({
                    "name": status.name,
                    "state": status.state,
                    "health": health.and_then(|h| h.health),
                    "pid": status.pid,
                    "port": status.port,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&combined)?);
    } else {
        print_statuses(statuses, &healths);
    }
    Ok(())
}

fn run_list() -> Result<(), Box<dyn Error>> {
    let response = with_daemon_or_direct(ControlCommand::List, |orchestrator| {
        Ok::<_, ApiError>(ControlResponse::List(orchestrator.supervisor.list()))
    })?;

    match response {
        ControlResponse::List(mut names) => {
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
        ControlResponse::Error(message) => return Err(message.into()),
        _ => {}
    }
    Ok(())
}

fn print_response(response: ControlResponse) -> Result<(), Box<dyn Error>> {
    match response {
        ControlResponse::Status(statuses) => {
            print_bare_statuses(&statuses);
            Ok(())
        }
        ControlResponse::Error(message) => Err(message.into()),
        _ => Ok(()),
    }
}

fn print_bare_statuses(statuses: &[ServiceStatus]) {
    for status in statuses {
        let pid = status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let port = status.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{} {:?} {} {}", status.name, status.state, pid, port);
    }
}

/// Prints one line per service: `name status health pid port` (spec.md §6).
fn print_statuses(statuses: Vec<ServiceStatus>, healths: &[ServiceHealth]) {
    for status in statuses {
        let health = healths
            .iter()
            .find(|h| h.name == status.name)
            .and_then(|h| h.health)
            .map(|h| format!("{h:?}").to_lowercase())
            .unwrap_or_else(|| "-".to_string());
        let pid = status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let port = status.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{} {:?} {} {} {}",
            status.name,
            status.state,
            health,
            pid,
            port
        );
    }
}
