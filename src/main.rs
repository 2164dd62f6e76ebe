//! CDMA connection controller simulator

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use cdma_connection::{
    config::ControllerConfig,
    core::{
        run_event_loop, CallControlEvent, CallDirection, CdmaConnection, ConnectionContext,
        ConnectionOptions, ConnectionState,
    },
    interfaces::{
        CallState, NetworkConnection, SimulatedConnection, SimulatedPhone, SimulatedTonePlayer,
    },
    services::{EmergencyNumbers, SystemSettings},
    utils::setup_logging,
    Result,
};

/// Simulated network latency for burst DTMF confirmations
const BURST_CONFIRM_DELAY: Duration = Duration::from_millis(150);

#[derive(Parser)]
#[command(name = "cdma-connection-sim")]
#[command(about = "CDMA call signaling and timing controller simulator")]
#[command(version = cdma_connection::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Override the call waiting timeout
    #[arg(long, env = "CDMA_CALL_WAITING_TIMEOUT_MS")]
    call_waiting_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario against the simulated radio
    Simulate {
        #[arg(value_enum)]
        scenario: Scenario,

        /// Print the final connection snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Rapid key presses over a circuit switched call
    BurstDtmf,
    /// Waiting call left unanswered
    CallWaitingMissed,
    /// Waiting call answered before the timeout
    CallWaitingAnswered,
    /// Dial an emergency number until the far end answers
    EmergencyDial,
    /// Repeated line control records on an active call
    LineControl,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli)?;
    let _log_guard = setup_logging(&config.logging)?;

    info!("Starting {} v{}", cdma_connection::NAME, cdma_connection::VERSION);
    info!("Description: {}", cdma_connection::DESCRIPTION);

    match &cli.command {
        Commands::Simulate { scenario, json } => run_scenario(&config, *scenario, *json).await,
        Commands::ValidateConfig => validate_configuration(&config),
        Commands::GenerateConfig { output } => generate_default_config(output.clone()),
    }
}

fn load_configuration(cli: &Cli) -> Result<ControllerConfig> {
    let mut config = if let Some(config_path) = &cli.config {
        ControllerConfig::load_from_file(config_path)?
    } else {
        match ControllerConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => ControllerConfig::default_config(),
        }
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(timeout_ms) = cli.call_waiting_timeout_ms {
        config.call_waiting.timeout_ms = timeout_ms;
    }

    config.validate()?;
    Ok(config)
}

/// Simulated radio plus one running controller
struct Simulation {
    phone: Arc<SimulatedPhone>,
    player: Arc<SimulatedTonePlayer>,
    leg: Arc<SimulatedConnection>,
    connection: Arc<Mutex<CdmaConnection>>,
    event_loop: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl Simulation {
    fn start(
        config: &ControllerConfig,
        phone: Arc<SimulatedPhone>,
        leg: Arc<SimulatedConnection>,
        direction: CallDirection,
    ) -> Result<Self> {
        let player = Arc::new(SimulatedTonePlayer::default());
        let context = ConnectionContext {
            settings: Arc::new(SystemSettings::from_config(&config.dtmf)),
            emergency_numbers: Arc::new(EmergencyNumbers::from_config(&config.emergency)),
            emergency_tone_player: Some(player.clone()),
        };

        let original: Arc<dyn NetworkConnection> = leg.clone();
        let mut connection = CdmaConnection::new(
            Some(original),
            context,
            ConnectionOptions::from_config(config, direction),
        )?;

        let events = connection
            .take_event_receiver()
            .ok_or_else(|| cdma_connection::Error::internal("Failed to get event receiver"))?;
        let mut listener_rx = connection
            .take_listener_receiver()
            .ok_or_else(|| cdma_connection::Error::internal("Failed to get listener receiver"))?;

        let connection = Arc::new(Mutex::new(connection));
        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&connection), events));
        let listener = tokio::spawn(async move {
            while let Some(event) = listener_rx.recv().await {
                handle_call_control_event(event);
            }
        });

        Ok(Self {
            phone,
            player,
            leg,
            connection,
            event_loop,
            listener,
        })
    }

    async fn finish(self, json: bool) -> Result<()> {
        let snapshot = {
            let mut connection = self.connection.lock().await;
            let snapshot = connection.snapshot();
            connection.close();
            snapshot
        };
        self.event_loop
            .await
            .map_err(|e| cdma_connection::Error::internal(format!("Event loop failed: {}", e)))?;
        // Dropping the controller closes its listener channel.
        drop(self.connection);
        let _ = self.listener.await;

        println!();
        println!("{}", "Network actions".bold().blue());
        for action in self.phone.actions() {
            println!("  {}", action);
        }

        println!();
        if json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            println!("{}", "Connection".bold().blue());
            println!("  {}: {}", "Id".bold(), snapshot.id);
            println!("  {}: {}", "State".bold(), colored_state(snapshot.state));
            if let Some(cause) = snapshot.disconnect_cause {
                println!("  {}: {}", "Cause".bold(), cause.description());
            }
            println!("  {}: {}", "Queued tones".bold(), snapshot.queued_tones);
            println!(
                "  {}: {}",
                "Connect time corrected".bold(),
                snapshot.connection_time_reset
            );
        }
        Ok(())
    }
}

fn colored_state(state: ConnectionState) -> ColoredString {
    let label = state.to_string();
    match state {
        ConnectionState::Active => label.green(),
        ConnectionState::Dialing | ConnectionState::Ringing => label.yellow(),
        ConnectionState::Holding => label.cyan(),
        ConnectionState::Disconnected => label.red(),
        ConnectionState::New => label.normal(),
    }
}

fn handle_call_control_event(event: CallControlEvent) {
    match event {
        CallControlEvent::StateChanged {
            connection_id,
            state,
        } => {
            println!("📞 {} {}", connection_id, colored_state(state));
        }
        CallControlEvent::Disconnected {
            connection_id,
            cause,
        } => {
            println!("✗ {} disconnected: {}", connection_id, cause.description().red());
        }
        CallControlEvent::Closed { connection_id } => {
            println!("✓ {} closed", connection_id);
        }
    }
}

async fn run_scenario(config: &ControllerConfig, scenario: Scenario, json: bool) -> Result<()> {
    println!("{} {:?}", "Scenario".bold().blue(), scenario);

    match scenario {
        Scenario::BurstDtmf => burst_dtmf(config, json).await,
        Scenario::CallWaitingMissed => call_waiting_missed(config, json).await,
        Scenario::CallWaitingAnswered => call_waiting_answered(config, json).await,
        Scenario::EmergencyDial => emergency_dial(config, json).await,
        Scenario::LineControl => line_control(config, json).await,
    }
}

async fn burst_dtmf(config: &ControllerConfig, json: bool) -> Result<()> {
    let phone = Arc::new(SimulatedPhone::with_confirm_delay(0, BURST_CONFIRM_DELAY));
    let leg = Arc::new(SimulatedConnection::outgoing("5550100", Some(phone.clone())));
    leg.set_state(CallState::Active);
    let sim = Simulation::start(config, phone, leg, CallDirection::Outgoing)?;

    for digit in "18005550199#".chars() {
        let connection = sim.connection.lock().await;
        connection.play_tone(digit)?;
        connection.stop_tone();
    }

    // Let every queued flush be confirmed.
    while sim.connection.lock().await.snapshot().tone_confirmation_pending {
        tokio::time::sleep(BURST_CONFIRM_DELAY).await;
    }

    println!(
        "{} {} burst[s] for 12 key presses",
        "✓".green(),
        sim.phone.burst_sends().len()
    );
    sim.finish(json).await
}

async fn call_waiting_missed(config: &ControllerConfig, json: bool) -> Result<()> {
    let phone = Arc::new(SimulatedPhone::new(0));
    let leg = Arc::new(SimulatedConnection::waiting("5550123", Some(phone.clone())));
    let sim = Simulation::start(config, phone, leg, CallDirection::Incoming)?;

    println!(
        "Waiting {} ms for the call waiting timeout",
        config.call_waiting.timeout_ms
    );
    tokio::time::sleep(config.call_waiting.timeout() + Duration::from_millis(100)).await;

    println!("{} hangups sent: {}", "✓".green(), sim.leg.hangups());
    sim.finish(json).await
}

async fn call_waiting_answered(config: &ControllerConfig, json: bool) -> Result<()> {
    let phone = Arc::new(SimulatedPhone::new(0));
    let leg = Arc::new(SimulatedConnection::waiting("5550123", Some(phone.clone())));
    let sim = Simulation::start(config, phone, leg, CallDirection::Incoming)?;

    tokio::time::sleep(config.call_waiting.timeout() / 2).await;
    {
        let mut connection = sim.connection.lock().await;
        connection.answer();
        sim.leg.set_state(CallState::Active);
        connection.update_state();
    }
    tokio::time::sleep(config.call_waiting.timeout()).await;

    println!("{} hangups sent: {}", "✓".green(), sim.leg.hangups());
    sim.finish(json).await
}

async fn emergency_dial(config: &ControllerConfig, json: bool) -> Result<()> {
    let number = config
        .emergency
        .numbers
        .first()
        .cloned()
        .ok_or_else(|| cdma_connection::Error::invalid_state("No emergency numbers configured"))?;
    let phone = Arc::new(SimulatedPhone::new(0));
    let leg = Arc::new(SimulatedConnection::outgoing(
        &format!("tel:{}", number),
        Some(phone.clone()),
    ));
    let sim = Simulation::start(config, phone, leg, CallDirection::Outgoing)?;

    println!("Emergency tone playing while dialing: {}", sim.player.is_playing());
    tokio::time::sleep(Duration::from_millis(500)).await;
    {
        let mut connection = sim.connection.lock().await;
        sim.leg.set_state(CallState::Active);
        connection.update_state();
    }
    println!("Emergency tone playing once answered: {}", sim.player.is_playing());

    sim.finish(json).await
}

async fn line_control(config: &ControllerConfig, json: bool) -> Result<()> {
    let phone = Arc::new(SimulatedPhone::new(0));
    let leg = Arc::new(SimulatedConnection::outgoing("5550100", Some(phone.clone())));
    leg.set_state(CallState::Active);
    let sim = Simulation::start(config, phone, leg, CallDirection::Outgoing)?;

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        sim.phone.broadcast_line_control_info();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!(
        "{} connect time corrected {} time[s] for 3 records",
        "✓".green(),
        sim.leg.time_resets()
    );
    sim.finish(json).await
}

fn validate_configuration(config: &ControllerConfig) -> Result<()> {
    info!("Validating configuration...");

    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!(
        "  DTMF Tone Type: {}",
        config
            .dtmf
            .tone_type
            .map(|t| format!("{:?}", t))
            .unwrap_or_else(|| "platform default".to_string())
    );
    println!("  Call Waiting Timeout: {} ms", config.call_waiting.timeout_ms);
    println!("  Mute Allowed: {}", config.connection.allow_mute);
    println!("  Emergency Numbers: {}", config.emergency.numbers.join(", "));

    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = ControllerConfig::default_config();
    let toml_content = toml::to_string_pretty(&config).map_err(|e| {
        cdma_connection::Error::internal(format!("Failed to serialize config: {}", e))
    })?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}
