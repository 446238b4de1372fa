//! Rigcon CLI - Command-line interface
//!
//! Headless access to serial devices: port discovery, AT commands, Modbus
//! register access and workflow runs.

use clap::{Parser, Subcommand, ValueEnum};
use rigcon_core::cli::{init_tracing, print_exit_codes, CliResult, ExitCodes};
use rigcon_core::config::{self, AppConfig};
use rigcon_core::core::protocol::{AtClient, FunctionCode, ModbusClient};
use rigcon_core::core::simulator::DeviceTemplates;
use rigcon_core::core::transport::{ConnectionHandle, SerialConfig, SerialParity, Transport};
use rigcon_core::core::variables::Value;
use rigcon_core::core::workflow::{
    ConfirmationResponse, ExecutionEvent, ExecutionRegistry, JsonLinesRecorder, StartRequest, WorkflowDefinition,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Port name under which the simulated bench device is registered
const SIMULATED_PORT: &str = "sim://bench";

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Modbus register table
#[derive(Debug, Clone, Copy, ValueEnum)]
enum RegisterTable {
    /// Holding registers (0x03)
    Holding,
    /// Input registers (0x04)
    Input,
}

impl From<RegisterTable> for FunctionCode {
    fn from(table: RegisterTable) -> Self {
        match table {
            RegisterTable::Holding => FunctionCode::ReadHoldingRegisters,
            RegisterTable::Input => FunctionCode::ReadInputRegisters,
        }
    }
}

/// Rigcon CLI
#[derive(Parser, Debug)]
#[command(
    name = "rigcon",
    author = "Rigcon Team",
    version,
    about = "Serial device control and commissioning workflows",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "RIGCON_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Talk to a built-in simulated device instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Serial options shared by device commands
#[derive(clap::Args, Debug, Clone)]
struct PortArgs {
    /// Serial port (e.g., COM3, /dev/ttyUSB0); auto-detected when omitted
    #[arg(short, long, env = "RIGCON_PORT")]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Parity (none, odd, even)
    #[arg(long)]
    parity: Option<SerialParity>,

    /// Read timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Find a likely device port and the baud rate it answers at
    Detect {
        /// Port to probe; auto-detected when omitted
        #[arg(short, long)]
        port: Option<String>,

        /// Bytes sent at each candidate rate
        #[arg(long, default_value = "AT\r\n")]
        probe: String,
    },

    /// Send one AT command and print the reply
    At {
        #[command(flatten)]
        port: PortArgs,

        /// Command (the AT prefix is optional)
        command: String,

        /// Reply timeout in milliseconds
        #[arg(long, default_value = "1000")]
        wait_ms: u64,
    },

    /// Read Modbus RTU registers
    ModbusRead {
        #[command(flatten)]
        port: PortArgs,

        /// Slave id
        #[arg(short, long, default_value = "1")]
        slave: u8,

        /// First register address
        #[arg(long)]
        start: u16,

        /// Number of registers
        #[arg(short, long, default_value = "1")]
        count: u16,

        /// Register table
        #[arg(long, value_enum, default_value_t = RegisterTable::Holding)]
        table: RegisterTable,
    },

    /// Write Modbus RTU holding registers
    ModbusWrite {
        #[command(flatten)]
        port: PortArgs,

        /// Slave id
        #[arg(short, long, default_value = "1")]
        slave: u8,

        /// First register address
        #[arg(long)]
        start: u16,

        /// Values to write
        #[arg(required = true)]
        values: Vec<u16>,
    },

    /// Run a workflow file (.json, .yaml, .toml)
    Run {
        #[command(flatten)]
        port: PortArgs,

        /// Workflow definition
        file: PathBuf,

        /// Variable override (name=value), repeatable
        #[arg(long = "var", value_parser = parse_variable)]
        variables: Vec<(String, Value)>,

        /// Workstation id attached to the run
        #[arg(long)]
        workstation: Option<String>,

        /// Operator id attached to the run
        #[arg(long)]
        operator: Option<String>,

        /// Answer every confirmation with its first option
        #[arg(short = 'y', long)]
        yes: bool,

        /// Append the finished execution to this JSON-lines file
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Check a workflow file without running it
    Validate {
        /// Workflow definition
        file: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the exit code table
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_variable(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("variable name is empty".to_string());
    }
    let value = match value.trim() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        v => v.parse::<f64>().map_or_else(|_| Value::from(v), Value::Number),
    };
    Ok((name.to_string(), value))
}

/// Shared state for one invocation
struct App {
    cli: Cli,
    config: AppConfig,
    config_path: Option<PathBuf>,
    transport: Transport,
}

impl App {
    fn emit(&self, value: &serde_json::Value, text: impl FnOnce() -> String) {
        match self.cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value).unwrap_or_default()),
            OutputFormat::Text => println!("{}", text()),
        }
    }

    fn serial_config(&self, args: &PortArgs, port: &str) -> SerialConfig {
        let mut config = self.config.serial.to_config(port);
        if let Some(baud) = args.baud {
            config.baud_rate = baud;
        }
        if let Some(parity) = args.parity {
            config.parity = parity;
        }
        if let Some(timeout) = args.timeout_ms {
            config.timeout_ms = timeout;
        }
        config
    }

    /// Open the port named by `args`, the config, auto-detection or the simulator
    async fn open(&self, args: &PortArgs) -> Result<ConnectionHandle, CliResult> {
        if self.cli.simulate {
            let config = self.serial_config(args, SIMULATED_PORT);
            let handle = self
                .transport
                .connect_link(config, Box::new(DeviceTemplates::bench_device()))
                .await?;
            return Ok(handle);
        }

        let port = match args.port.clone().or_else(|| self.config.serial.port.clone()) {
            Some(port) => port,
            None => self
                .transport
                .auto_detect_port()
                .await?
                .ok_or_else(|| CliResult::error(ExitCodes::DEVICE_NOT_FOUND, "No serial ports found"))?,
        };
        let config = self.serial_config(args, &port);
        if !self.cli.quiet {
            eprintln!("Connecting to {}...", config.describe());
        }
        Ok(self.transport.connect(config).await?)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => AppConfig::load_from(path).map(|c| (c, Some(path.clone()))),
        None => AppConfig::load().map(|c| (c, config::config_file())),
    };
    let (config, config_path) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            let result = CliResult::from(e);
            eprintln!("Error: {}", result.message().unwrap_or_default());
            return result.to_exit_code();
        }
    };

    let _guard = match init_tracing(&config.logging, cli.verbose, cli.log_json) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e}");
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };
    debug!("Rigcon v{} starting", rigcon_core::VERSION);

    let transport = match Transport::new(config.transport.clone()) {
        Ok(transport) => transport,
        Err(e) => {
            let result = CliResult::from(e);
            eprintln!("Error: {}", result.message().unwrap_or_default());
            return result.to_exit_code();
        }
    };

    let app = App {
        cli,
        config,
        config_path,
        transport,
    };

    let result = dispatch(&app).await;
    if let Err(e) = app.transport.disconnect(None).await {
        warn!("Disconnect failed: {}", e);
    }

    match &result {
        CliResult::Success(Some(msg)) if !app.cli.quiet => eprintln!("{msg}"),
        CliResult::Error(_, msg) => eprintln!("Error: {msg}"),
        CliResult::Success(_) => {}
    }
    result.to_exit_code()
}

async fn dispatch(app: &App) -> CliResult {
    let outcome = match &app.cli.command {
        Commands::ListPorts { detailed } => list_ports(app, *detailed).await,
        Commands::Detect { port, probe } => detect(app, port.as_deref(), probe).await,
        Commands::At {
            port,
            command,
            wait_ms,
        } => send_at(app, port, command, *wait_ms).await,
        Commands::ModbusRead {
            port,
            slave,
            start,
            count,
            table,
        } => modbus_read(app, port, *slave, *start, *count, *table).await,
        Commands::ModbusWrite {
            port,
            slave,
            start,
            values,
        } => modbus_write(app, port, *slave, *start, values).await,
        Commands::Run {
            port,
            file,
            variables,
            workstation,
            operator,
            yes,
            record,
        } => {
            let options = RunOptions {
                variables: variables.clone(),
                workstation: workstation.clone(),
                operator: operator.clone(),
                auto_confirm: *yes,
                record: record.clone(),
            };
            run_workflow(app, port, file, options).await
        }
        Commands::Validate { file } => validate(app, file),
        Commands::Config { action } => config_action(app, action),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    };
    outcome.unwrap_or_else(|e| e)
}

type CommandResult = Result<CliResult, CliResult>;

async fn list_ports(app: &App, detailed: bool) -> CommandResult {
    let ports = app.transport.list_ports().await?;

    if ports.is_empty() && app.cli.format == OutputFormat::Text {
        if !app.cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(CliResult::success());
    }

    app.emit(&serde_json::to_value(&ports).unwrap_or_default(), || {
        ports
            .iter()
            .map(|p| {
                if detailed {
                    format!("{:<16} {} [{}] {}", p.device, p.description, p.hwid, p.manufacturer)
                } else {
                    p.device.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    });
    Ok(CliResult::success())
}

async fn detect(app: &App, port: Option<&str>, probe: &str) -> CommandResult {
    let port = match port {
        Some(port) => port.to_string(),
        None => app
            .transport
            .auto_detect_port()
            .await?
            .ok_or_else(|| CliResult::error(ExitCodes::DEVICE_NOT_FOUND, "No serial ports found"))?,
    };

    let probe = probe.replace("\\r", "\r").replace("\\n", "\n");
    let baud = app
        .transport
        .auto_detect_baud(&port, &app.config.serial.baud_candidates, probe.as_bytes())
        .await?;

    app.emit(&serde_json::json!({ "port": port, "baud_rate": baud }), || match baud {
        Some(baud) => format!("{port} @ {baud} baud"),
        None => format!("{port}: no answer at any candidate rate"),
    });

    match baud {
        Some(_) => Ok(CliResult::success()),
        None => Err(CliResult::error(ExitCodes::TIMEOUT, format!("{port} did not answer the probe"))),
    }
}

async fn send_at(app: &App, args: &PortArgs, command: &str, wait_ms: u64) -> CommandResult {
    let handle = app.open(args).await?;
    let client = AtClient::new(app.transport.clone(), app.config.engine.at_max_response);
    let exchange = client
        .send_and_collect(handle, command, Duration::from_millis(wait_ms))
        .await?;

    app.emit(&serde_json::to_value(&exchange).unwrap_or_default(), || exchange.response.clone());

    if exchange.response.is_empty() {
        return Err(CliResult::error(ExitCodes::TIMEOUT, format!("No reply to {}", exchange.command)));
    }
    Ok(CliResult::success())
}

async fn modbus_read(
    app: &App,
    args: &PortArgs,
    slave: u8,
    start: u16,
    count: u16,
    table: RegisterTable,
) -> CommandResult {
    let handle = app.open(args).await?;
    let client = ModbusClient::new(
        app.transport.clone(),
        Duration::from_millis(app.config.engine.modbus_timeout_ms),
    );
    let values = client.read_registers(handle, slave, start, count, table.into()).await?;

    let json = serde_json::json!({ "slave": slave, "start": start, "values": values });
    app.emit(&json, || {
        values
            .iter()
            .zip(u32::from(start)..)
            .map(|(value, address)| format!("{address:>5}  {value:>5}  0x{value:04X}"))
            .collect::<Vec<_>>()
            .join("\n")
    });
    Ok(CliResult::success())
}

async fn modbus_write(app: &App, args: &PortArgs, slave: u8, start: u16, values: &[u16]) -> CommandResult {
    let handle = app.open(args).await?;
    let client = ModbusClient::new(
        app.transport.clone(),
        Duration::from_millis(app.config.engine.modbus_timeout_ms),
    );
    client.write_registers(handle, slave, start, values).await?;
    Ok(CliResult::success_with_message(format!(
        "Wrote {} register(s) at {} on slave {}",
        values.len(),
        start,
        slave
    )))
}

struct RunOptions {
    variables: Vec<(String, Value)>,
    workstation: Option<String>,
    operator: Option<String>,
    auto_confirm: bool,
    record: Option<PathBuf>,
}

async fn run_workflow(app: &App, args: &PortArgs, file: &Path, options: RunOptions) -> CommandResult {
    let definition = WorkflowDefinition::from_path(file)?;
    let handle = app.open(args).await?;

    let mut registry = ExecutionRegistry::new(
        app.transport.clone(),
        app.config.engine.clone(),
        app.config.registry.clone(),
    );
    if let Some(path) = &options.record {
        registry = registry.with_recorder(Arc::new(JsonLinesRecorder::open(path)?));
    }
    let registry = Arc::new(registry);

    let mut request = StartRequest::default().handle(handle);
    for (name, value) in options.variables {
        request = request.variable(&name, value);
    }
    if let Some(ws) = &options.workstation {
        request = request.workstation(ws);
    }
    if let Some(op) = &options.operator {
        request = request.operator(op);
    }

    // Subscribe to the whole hub before starting so no early event is missed
    let mut events = registry.events().subscribe();
    let id = registry.start_execution(definition, request)?;
    info!("Started execution {}", id);

    let interrupt = CancellationToken::new();
    let on_signal = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || on_signal.cancel()) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    let watcher = {
        let registry = registry.clone();
        let id = id.clone();
        let format = app.cli.format;
        let quiet = app.cli.quiet;
        let auto_confirm = options.auto_confirm;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = interrupt.cancelled() => {
                        if let Err(e) = registry.cancel(&id) {
                            debug!("Cancel after interrupt: {}", e);
                        }
                        return;
                    }
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        if event.execution_id() != id {
                            continue;
                        }
                        if !quiet {
                            print_event(&event, format);
                        }
                        if let ExecutionEvent::ConfirmationRequest { step_id, message, options, .. } = event {
                            let response = if auto_confirm {
                                ConfirmationResponse::confirm(options.first().map_or("yes", String::as_str))
                            } else {
                                prompt_confirmation(message, options).await
                            };
                            if let Err(e) = registry.submit_confirmation(&id, &step_id, response) {
                                warn!("{}", e);
                            }
                        }
                    }
                }
            }
        })
    };

    let snapshot = registry.wait(&id).await?;
    watcher.abort();

    if app.cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
    }
    Ok(CliResult::from_execution(&snapshot))
}

fn print_event(event: &ExecutionEvent, format: OutputFormat) {
    if format == OutputFormat::Json {
        if let Ok(line) = serde_json::to_string(event) {
            eprintln!("{line}");
        }
        return;
    }
    match event {
        ExecutionEvent::Log { entry, .. } => {
            let step = entry.step_id.as_deref().map(|s| format!("[{s}] ")).unwrap_or_default();
            eprintln!(
                "{} {:>7} {}{}",
                entry.timestamp.format("%H:%M:%S%.3f"),
                format!("{:?}", entry.level).to_uppercase(),
                step,
                entry.message
            );
        }
        ExecutionEvent::Status { status, message, .. } => {
            eprintln!("-- {status}{}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default());
        }
        ExecutionEvent::ConfirmationRequest { step_name, .. } => {
            eprintln!("-- confirmation requested by '{step_name}'");
        }
    }
}

/// Ask on the terminal; an empty answer picks the first option, "n" rejects
async fn prompt_confirmation(message: String, options: Vec<String>) -> ConfirmationResponse {
    let answer = tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{message}");
        if !options.is_empty() {
            let _ = write!(stderr, " [{}]", options.join("/"));
        }
        let _ = write!(stderr, " > ");
        let _ = stderr.flush();

        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok().map(|_| (line, options))
    })
    .await
    .ok()
    .flatten();

    let Some((line, options)) = answer else {
        return ConfirmationResponse::reject();
    };
    let line = line.trim();
    if line.eq_ignore_ascii_case("n") || line.eq_ignore_ascii_case("no") {
        return ConfirmationResponse::reject();
    }
    if line.is_empty() {
        return ConfirmationResponse::confirm(options.first().map_or("yes", String::as_str));
    }
    match options.iter().find(|o| o.eq_ignore_ascii_case(line)) {
        Some(option) => ConfirmationResponse::confirm(option),
        None => ConfirmationResponse {
            confirmed: true,
            user_input: Some(line.to_string()),
            ..ConfirmationResponse::default()
        },
    }
}

fn validate(app: &App, file: &Path) -> CommandResult {
    let definition = WorkflowDefinition::from_path(file)?;
    let json = serde_json::json!({
        "id": definition.id,
        "name": definition.name,
        "steps": definition.step_count(),
    });
    app.emit(&json, || {
        format!(
            "{} ({}): {} steps, valid",
            definition.name,
            definition.id,
            definition.step_count()
        )
    });
    Ok(CliResult::success())
}

fn config_action(app: &App, action: &ConfigAction) -> CommandResult {
    match action {
        ConfigAction::Show => {
            let text = app.config.to_toml()?;
            app.emit(&serde_json::to_value(&app.config).unwrap_or_default(), || text.clone());
            Ok(CliResult::success())
        }
        ConfigAction::Path => {
            let path = app
                .config_path
                .as_ref()
                .ok_or_else(|| CliResult::error(ExitCodes::CONFIG_ERROR, "No config directory on this platform"))?;
            println!("{}", path.display());
            Ok(CliResult::success())
        }
        ConfigAction::Init { force } => {
            let path = app
                .config_path
                .clone()
                .ok_or_else(|| CliResult::error(ExitCodes::CONFIG_ERROR, "No config directory on this platform"))?;
            if path.exists() && !force {
                return Err(CliResult::error(
                    ExitCodes::CONFIG_ERROR,
                    format!("{} already exists (use --force)", path.display()),
                ));
            }
            AppConfig::default().save_to(&path)?;
            Ok(CliResult::success_with_message(format!("Wrote {}", path.display())))
        }
    }
}
