use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shark_modbus::simulator::demo_catalog;
use shark_modbus::{
    progress_channel, spawn_retrieval, unique_path, CallbackLogger, FormatTag, HistoricLog, InMemoryCatalog,
    LoggingMode, MeterConfig, MeterError, MeterSession, ModbusClient, RegisterCatalog, RetrievalEvent,
    RetrievalStatus, SimulatedMeter,
};

#[derive(Parser)]
#[command(name = "shark_log")]
#[command(about = "Read registers and retrieve historic logs from a Shark power meter", version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Modbus device address
    #[arg(long, global = true)]
    slave: Option<u8>,
    /// Talk to the built-in simulated meter instead of the network
    #[arg(long, global = true)]
    simulate: bool,
    /// Hex dump every Modbus frame
    #[arg(long, global = true)]
    trace: bool,
    /// Print every request and response: raw, interpreted or both
    #[arg(long, global = true, value_name = "MODE")]
    frames: Option<LoggingMode>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the meter's name, serial number and model
    Identify,
    /// Read and decode a run of registers
    Poll {
        /// First register (1-based)
        #[arg(long, default_value_t = 9)]
        register: u32,
        #[arg(long, default_value_t = 8)]
        count: u16,
        #[arg(long, default_value = "ASCII")]
        format: FormatTag,
    },
    /// Retrieve a historic log into a delimited file
    Retrieve {
        /// Historic log 1-6
        #[arg(long)]
        log: HistoricLog,
        /// Register catalog (JSON or YAML)
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Output directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the status block of every historic log
    Logs,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// What the operator can do about a failed command
fn failure_hint(error: &MeterError) -> Option<&'static str> {
    if error.is_contention() {
        Some("another client is using the meter's log interface; try again once it is released")
    } else if error.is_transport_error() {
        Some("check the meter address, port and network path")
    } else if error.is_protocol_error() {
        Some("the meter rejected the request; check the slave id and meter model")
    } else if error.is_recoverable() {
        Some("the meter was slow to respond; retrying may succeed")
    } else {
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let result = run_cli(Cli::parse()).await;

    if let Err(e) = &result {
        let hint = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<MeterError>())
            .and_then(failure_hint);
        if let Some(hint) = hint {
            error!("{}: {}", e, hint);
        }
    }
    result
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {

    let mut config = match &cli.config {
        Some(path) => MeterConfig::from_file(path)?,
        None => MeterConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(slave) = cli.slave {
        config.slave_id = slave;
    }
    config.packet_logging |= cli.trace;
    if cli.frames.is_some() {
        config.frame_log = cli.frames;
    }
    config.validate()?;

    if cli.simulate {
        let meter = SimulatedMeter::demo(95);
        meter.set_slave_id(config.slave_id);
        let mut session = MeterSession::new();
        session.attach(meter, config.slave_id).await?;
        run(cli.command, &config, session, true).await
    } else {
        let mut session: MeterSession = MeterSession::new()
            .with_timeout(config.timeout())
            .with_packet_logging(config.packet_logging);
        if let Some(mode) = config.frame_log {
            let mut logger = CallbackLogger::console();
            logger.set_mode(mode);
            session = session.with_logger(logger);
        }
        session
            .connect(config.slave_id, &config.host, config.port)
            .await
            .with_context(|| format!("connecting to {}:{}", config.host, config.port))?;
        run(cli.command, &config, session, false).await
    }
}

async fn run<C>(command: Commands, config: &MeterConfig, mut session: MeterSession<C>, simulated: bool) -> anyhow::Result<()>
where
    C: ModbusClient + 'static,
{
    match command {
        Commands::Identify => {
            if let Some(identity) = session.identity() {
                println!("Name:   {}", identity.name);
                println!("Serial: {}", identity.serial);
                println!("Model:  {}", identity.model);
            }
            session.disconnect().await?;
        }
        Commands::Poll { register, count, format } => {
            for polled in session.poll_registers(register, count, format).await? {
                let value = polled.cell.map(|cell| cell.to_string()).unwrap_or_default();
                println!("{:>6}  0x{:04X}  {}", polled.register, polled.raw, value);
            }
            session.disconnect().await?;
        }
        Commands::Logs => {
            for log in HistoricLog::ALL {
                let status = session.read_log_status(log).await?;
                let owner = match status.holder() {
                    Some(holder) => format!("held by {}", holder),
                    None => "available".to_string(),
                };
                println!(
                    "{}: {}/{} records, {} bytes/record, {} .. {}, {}",
                    log,
                    status.records_used,
                    status.capacity,
                    status.record_size_bytes,
                    status.first_timestamp,
                    status.last_timestamp,
                    owner
                );
            }
            session.disconnect().await?;
        }
        Commands::Retrieve { log, catalog, out } => {
            let catalog: Arc<dyn RegisterCatalog> = match catalog.or_else(|| config.catalog.clone()) {
                Some(path) => Arc::new(
                    InMemoryCatalog::from_path(&path)
                        .with_context(|| format!("loading catalog {}", path.display()))?,
                ),
                None if simulated => Arc::new(demo_catalog()),
                None => bail!("a register catalog is required (--catalog or `catalog:` in the config file)"),
            };
            let out_dir = out.unwrap_or_else(|| config.output_dir.clone());
            retrieve(session, catalog, log, config, out_dir).await?;
        }
    }

    Ok(())
}

async fn retrieve<C>(
    session: MeterSession<C>,
    catalog: Arc<dyn RegisterCatalog>,
    log: HistoricLog,
    config: &MeterConfig,
    out_dir: PathBuf,
) -> anyhow::Result<()>
where
    C: ModbusClient + 'static,
{
    let delimiter = config.delimiter_byte()?;
    let session = Arc::new(Mutex::new(session));
    let token = CancellationToken::new();

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancelling retrieval");
            ctrl_c_token.cancel();
        }
    });

    let (progress, mut events) = progress_channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RetrievalEvent::LogEngaged { log, status } => {
                    info!("{} engaged: {} records of {} bytes", log, status.records_used, status.record_size_bytes)
                }
                RetrievalEvent::LayoutResolved { fields, warnings } => {
                    info!("{} fields per record", fields);
                    for warning in warnings {
                        warn!("Skipped {}", warning);
                    }
                }
                RetrievalEvent::WindowRead { total_rows, percent, .. } => {
                    info!("{} records ({:.1}%)", total_rows, percent)
                }
                _ => {}
            }
        }
    });

    let handle = spawn_retrieval(
        session.clone(),
        catalog,
        log,
        config.retrieval.clone(),
        Some(progress),
        token,
    )?;
    let result = handle.await?;
    // Dropping the last sender closes the progress channel
    let _ = reporter.await;
    let export = result?;

    if !out_dir.exists() {
        std::fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    }
    let path = unique_path(&out_dir, &format!("historic_{}", log.number()), "csv");
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    export.table.write_delimited(file, delimiter)?;

    match export.status {
        RetrievalStatus::Completed => info!("Wrote {} records to {}", export.table.len(), path.display()),
        RetrievalStatus::Cancelled => warn!(
            "Retrieval cancelled; wrote {} records to {}",
            export.table.len(),
            path.display()
        ),
    }

    session.lock().await.disconnect().await?;
    Ok(())
}
