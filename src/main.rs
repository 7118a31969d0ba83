use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use printhost::{
    init_logging, list_ports, BuildProgress, Connector, FileSource, Machine, MachineConfig,
    MachineListener, MachineState, MachineStatusSnapshot, SerialConnector, VirtualConnector,
    VirtualPrinter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long to wait for the handshake before giving up
const CONNECT_WAIT: Duration = Duration::from_secs(30);

/// Print progress every this many lines
const PROGRESS_STEP: u64 = 100;

#[derive(Parser, Debug)]
#[command(name = "printhost", version, about = "Drive a RepRap-style printer from the command line")]
struct Cli {
    /// Machine configuration file (.toml or .json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    /// Talk to an in-process virtual printer instead of a serial port
    #[arg(long = "virtual", global = true)]
    use_virtual: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports that look like printer boards
    Ports,
    /// Stream a G-code file to the printer
    Build { file: PathBuf },
    /// Write the instructions a build would send to a local file
    Capture { file: PathBuf, output: PathBuf },
    /// Store a G-code file on the printer's SD card
    Upload { file: PathBuf, name: String },
    /// Print a file already stored on the SD card
    Play { name: String },
    /// Send a single instruction
    Send { instruction: String },
}

/// Reports machine events on stdout
struct ConsoleListener;

impl MachineListener for ConsoleListener {
    fn on_state_changed(
        &self,
        _previous: MachineState,
        current: MachineState,
        message: Option<&str>,
    ) {
        match message {
            Some(message) => println!("[{}] {}", current, message),
            None => println!("[{}]", current),
        }
    }

    fn on_progress(&self, progress: &BuildProgress) {
        if progress.lines_processed > 0 && progress.lines_processed % PROGRESS_STEP == 0 {
            println!("{}", progress);
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MachineConfig> {
    let config = match path {
        Some(path) => MachineConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => match MachineConfig::default_config_path() {
            Ok(path) => MachineConfig::load_or_default(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            Err(_) => MachineConfig::default(),
        },
    };
    Ok(config)
}

/// A build, stop or failure has run its course
fn settled(snapshot: &MachineStatusSnapshot) -> bool {
    if snapshot.state.has_build() || snapshot.state == MachineState::Stopping {
        return false;
    }
    if snapshot.state.is_error() {
        return true;
    }
    snapshot.message.as_deref().is_some_and(|m| {
        m.starts_with("Build ") || m.starts_with("Playback of") || m.starts_with("Connection lost")
    })
}

fn wait_settled(machine: &Machine) -> MachineStatusSnapshot {
    loop {
        if let Some(snapshot) = machine.wait_for_state(settled, Duration::from_secs(60)) {
            return snapshot;
        }
    }
}

fn connect(machine: &Machine, port: Option<&str>) -> anyhow::Result<()> {
    machine.connect(port)?;
    let snapshot = machine
        .wait_for_state(
            |s| {
                s.state == MachineState::Ready
                    || (s.state == MachineState::Disconnected && s.message.is_some())
            },
            CONNECT_WAIT,
        )
        .context("timed out waiting for the printer")?;
    if snapshot.state != MachineState::Ready {
        bail!(
            "{}",
            snapshot.message.unwrap_or_else(|| "not connected".to_string())
        );
    }
    Ok(())
}

/// Stop the build and switch heaters off on Ctrl-C
fn stop_on_interrupt(machine: Arc<Machine>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                tracing::warn!("Interrupted, stopping the machine");
                if let Err(e) = machine.stop_all() {
                    tracing::error!("Stop failed: {}", e);
                }
            }
        })?;
    Ok(())
}

fn finish(machine: &Machine, snapshot: MachineStatusSnapshot) -> anyhow::Result<()> {
    machine.shutdown()?;
    match snapshot.message.as_deref() {
        Some("Build finished") => Ok(()),
        Some(message) => bail!("{}", message),
        None => bail!("machine stopped in state {}", snapshot.state),
    }
}

fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    if let Command::Ports = cli.command {
        let ports = list_ports()?;
        if ports.is_empty() {
            println!("No printer ports found");
        }
        for port in ports {
            println!("{}\t{}", port.port_name, port.description);
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let connector: Arc<dyn Connector> = if cli.use_virtual {
        Arc::new(VirtualConnector::new(VirtualPrinter::new()))
    } else {
        Arc::new(SerialConnector)
    };

    let machine = Arc::new(Machine::new(config, connector)?);
    machine.subscribe(Arc::new(ConsoleListener));
    stop_on_interrupt(Arc::clone(&machine))?;
    let port = cli.port.as_deref();

    match cli.command {
        Command::Ports => Ok(()),
        Command::Build { file } => {
            let source = FileSource::open(&file)?;
            connect(&machine, port)?;
            machine.build(Box::new(source))?;
            let snapshot = wait_settled(&machine);
            finish(&machine, snapshot)
        }
        Command::Capture { file, output } => {
            let source = FileSource::open(&file)?;
            machine.build_to_file(Box::new(source), output)?;
            let snapshot = wait_settled(&machine);
            finish(&machine, snapshot)
        }
        Command::Upload { file, name } => {
            let source = FileSource::open(&file)?;
            connect(&machine, port)?;
            machine.build_to_remote(Box::new(source), &name)?;
            let snapshot = wait_settled(&machine);
            finish(&machine, snapshot)
        }
        Command::Play { name } => {
            connect(&machine, port)?;
            machine.build_remote(&name)?;
            let snapshot = wait_settled(&machine);
            finish(&machine, snapshot)
        }
        Command::Send { instruction } => {
            connect(&machine, port)?;
            machine.run_command(&instruction)?;
            machine.disconnect()?;
            let snapshot = machine
                .wait_for_state(|s| s.state == MachineState::Disconnected, CONNECT_WAIT)
                .context("timed out waiting for the printer")?;
            let tool = snapshot.tool;
            println!(
                "T:{:.1} /{:.1} B:{:.1} /{:.1}",
                tool.temperature,
                tool.target_temperature,
                tool.platform_temperature,
                tool.platform_target_temperature
            );
            machine.shutdown()?;
            Ok(())
        }
    }
}
