use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use touchtest::acquisition::{spawn_acquisition, AcquisitionConfig};
use touchtest::csv_log::{FrameLogger, ResultLogger};
use touchtest::native::mock::MockController;
use touchtest::native::{InterfaceKind, StreamOptions};
use touchtest::production::limits::load_limits;
use touchtest::production::runner::{spawn_production, BatchOptions};
use touchtest::production::{TestKind, TestPlan};
use touchtest::report::{frame_len, FrameStats, ReportKind};
use touchtest::script::{self, CommandScript, RawCommand};
use touchtest::settings::Settings;
use touchtest::worker::{CancelToken, HandoffMode};
use touchtest::{DeviceSession, Result, TouchError};

#[derive(Parser)]
#[command(name = "touchtest", about = "Synaptics RMI4 / TouchComm diagnostics")]
struct Cli {
    /// Device node (/dev/rmiN or /dev/tcmN); discovered when omitted
    #[arg(short, long, global = true)]
    node: Option<PathBuf>,

    /// Treat the node as RMI4
    #[arg(long, global = true, conflicts_with = "tcm")]
    rmi: bool,

    /// Treat the node as TouchComm
    #[arg(long, global = true)]
    tcm: bool,

    /// Use a simulated controller instead of hardware
    #[arg(long, global = true, value_enum)]
    mock: Option<MockKind>,

    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum MockKind {
    Rmi,
    Tcm,
    TddiRmi,
    TddiTcm,
}

#[derive(Subcommand)]
enum Command {
    /// Identify the controller
    Identify,

    /// Read registers (RMI: ADDR LEN) or response bytes (TCM: LEN)
    Read {
        #[arg(required = true, num_args = 1..=2)]
        args: Vec<String>,
    },

    /// Write registers (RMI: ADDR BYTE...) or send a command (TCM: CMD [BYTE...])
    Write {
        #[arg(required = true, num_args = 1..)]
        args: Vec<String>,
    },

    /// Stream delta or raw images
    Report {
        #[arg(value_enum)]
        kind: ReportKind,

        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,

        /// Let up to N frames queue instead of waiting on each one
        #[arg(long)]
        buffered: Option<usize>,

        /// Log every frame to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Show a live heatmap window
        #[arg(long)]
        view: bool,

        /// Keep touch reporting on while streaming
        #[arg(long)]
        touch: bool,

        #[arg(long)]
        no_sleep: bool,

        #[arg(long)]
        rezero: bool,
    },

    /// Run the production test batch
    Test {
        /// Run only these tests (e.g. noise full_raw)
        #[arg(long, num_args = 1..)]
        only: Vec<String>,

        /// Limits file; its values cannot be overridden by settings
        #[arg(long)]
        limits: Option<PathBuf>,

        /// Log item results to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,

        #[arg(long)]
        no_sleep: bool,

        #[arg(long)]
        rezero: bool,
    },

    /// Run a read/write/wait command script
    Script {
        path: PathBuf,

        /// Save the transcript here
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("touchtest", level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        log::error!("{}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let mut session = open_session(&cli, &settings)?;

    match cli.command {
        Command::Identify => identify(&mut session),
        Command::Read { args } => raw_command(&mut session, "read", &args),
        Command::Write { args } => raw_command(&mut session, "write", &args),
        Command::Report {
            kind,
            frames,
            buffered,
            csv,
            view,
            touch,
            no_sleep,
            rezero,
        } => {
            let options = StreamOptions {
                touch_enabled: touch || settings.session.touch_enabled,
                no_sleep: no_sleep || settings.session.no_sleep,
                rezero: rezero || settings.session.rezero,
            };
            let config = AcquisitionConfig {
                kind,
                options,
                handoff: buffered.map_or(HandoffMode::Synchronous, HandoffMode::Buffered),
                max_frames: frames,
            };
            stream(session, config, csv.as_deref(), view)
        }
        Command::Test {
            only,
            limits,
            csv,
            no_sleep,
            rezero,
        } => {
            let options = BatchOptions {
                no_sleep: no_sleep || settings.session.no_sleep,
                rezero: rezero || settings.session.rezero,
            };
            let limits = limits.or_else(|| settings.production.limits_file.clone());
            production(session, &settings, &only, limits.as_deref(), csv.as_deref(), options)
        }
        Command::Script { path, save } => run_script(&mut session, &path, save.as_deref()),
    }
}

fn open_session(cli: &Cli, settings: &Settings) -> Result<DeviceSession> {
    if let Some(mock) = cli.mock {
        let controller = match mock {
            MockKind::Rmi => MockController::new(InterfaceKind::Rmi),
            MockKind::Tcm => MockController::new(InterfaceKind::Tcm),
            MockKind::TddiRmi => MockController::tddi(InterfaceKind::Rmi),
            MockKind::TddiTcm => MockController::tddi(InterfaceKind::Tcm),
        };
        log::info!("using a simulated controller");
        return Ok(DeviceSession::from_device("mock", Box::new(controller)));
    }

    let node = cli.node.as_deref().or(settings.device.node.as_deref());
    let (rmi, tcm) = match (cli.rmi, cli.tcm, settings.device.interface) {
        (false, false, Some(InterfaceKind::Rmi)) => (true, false),
        (false, false, Some(InterfaceKind::Tcm)) => (false, true),
        (rmi, tcm, _) => (rmi, tcm),
    };
    DeviceSession::open(node, rmi, tcm)
}

fn identify(session: &mut DeviceSession) -> Result<()> {
    let info = session.identify()?.clone();
    println!("interface:    {}", session.kind());
    println!("variant:      {}", if session.is_tddi() { "TDDI" } else { "discrete" });
    println!("device id:    {}", info.device_id);
    println!("firmware id:  {}", info.firmware_id);
    println!("config id:    {}", info.config_id);
    println!("image:        {} rows x {} cols", info.image_rows, info.image_cols);
    println!("buttons:      {}", info.button_count);
    println!("force:        {}", info.force_electrode_count);
    println!("hybrid:       {}", info.has_hybrid);
    session.close();
    Ok(())
}

fn raw_command(session: &mut DeviceSession, verb: &str, args: &[String]) -> Result<()> {
    let mut tokens = vec![verb];
    tokens.extend(args.iter().map(String::as_str));
    let op = script::parse_tokens(session.kind(), &tokens)
        .map_err(|msg| TouchError::parse("<command line>", 1, msg))?;
    let single = CommandScript {
        interface: session.kind(),
        commands: vec![RawCommand {
            interface: session.kind(),
            op,
        }],
    };
    let transcript = script::run(&single, session)?;
    print!("{}", transcript);
    session.close();
    Ok(())
}

fn stream(
    mut session: DeviceSession,
    config: AcquisitionConfig,
    csv: Option<&Path>,
    view: bool,
) -> Result<()> {
    let cancel = interrupt_token()?;
    let info = session.identify()?.clone();
    let mut logger = match csv {
        Some(_) if view => {
            log::warn!("--csv is ignored with --view");
            None
        }
        Some(path) => Some(FrameLogger::create(
            path,
            info.image_rows,
            info.image_cols,
            frame_len(&info),
        )?),
        None => None,
    };

    let acquisition = spawn_acquisition(session, config, cancel);
    let mut stats = FrameStats::default();

    let outcome = if view {
        let (frames, handle) = acquisition.split();
        let title = format!("touchtest - {:?} ({})", config.kind, info.device_id);
        let shown = touchtest::view::run_viewer(frames, &title);
        let outcome = handle.stop()?;
        shown?;
        outcome
    } else {
        let mut write_err = None;
        while let Some(frame) = acquisition.frames().recv() {
            stats.update(&frame);
            if let Some((lo, hi)) = frame.range() {
                println!("frame {:>6}  min {:>6}  max {:>6}", frame.index, lo, hi);
            }
            if let Some(log) = logger.as_mut() {
                if let Err(e) = log.write(&frame) {
                    write_err = Some(e);
                    break;
                }
            }
        }
        let outcome = acquisition.stop()?;
        if let Some(e) = write_err {
            return Err(e);
        }
        outcome
    };

    if let Some(log) = logger {
        log.finish()?;
    }
    if stats.frames > 0 {
        println!("{} frames, largest per-cell swing {}", stats.frames, stats.peak_to_peak());
    }

    let mut session = outcome.session;
    session.close();
    match outcome.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn production(
    mut session: DeviceSession,
    settings: &Settings,
    only: &[String],
    limits: Option<&Path>,
    csv: Option<&Path>,
    options: BatchOptions,
) -> Result<()> {
    let cancel = interrupt_token()?;
    session.identify()?;
    let mut plan = TestPlan::for_session(&session)?;

    // Limits file first so its values lock out the settings file.
    if let Some(path) = limits {
        load_limits(&mut plan, path)?;
    }
    settings.apply_to_plan(&mut plan)?;
    if !only.is_empty() {
        let kinds = only
            .iter()
            .map(|key| {
                TestKind::from_key(key)
                    .ok_or_else(|| TouchError::Config(format!("unknown test {:?}", key)))
            })
            .collect::<Result<Vec<_>>>()?;
        plan.enable_only(&kinds)?;
    }

    let mut logger = csv.map(ResultLogger::create).transpose()?;
    let run = spawn_production(session, plan, options, cancel);
    let outcome = run.drain(|item| {
        println!("{:>2}. {}", item.position + 1, item.line());
        match logger.as_mut() {
            Some(log) => log.write(item),
            None => Ok(()),
        }
    })?;
    let mut session = outcome.session;
    session.close();
    let report = outcome.report?;
    if let Some(log) = logger {
        log.finish(report.passed)?;
    }
    println!("Result: {}", if report.passed { "PASS" } else { "FAIL" });
    if !report.passed {
        process::exit(2);
    }
    Ok(())
}

/// Ctrl-C cancels the running worker instead of killing the process.
fn interrupt_token() -> Result<CancelToken> {
    let token = CancelToken::new();
    let handler = token.clone();
    ctrlc::set_handler(move || {
        log::warn!("interrupted, stopping");
        handler.cancel();
    })
    .map_err(|e| TouchError::Config(format!("cannot install the Ctrl-C handler: {}", e)))?;
    Ok(token)
}

fn run_script(session: &mut DeviceSession, path: &Path, save: Option<&Path>) -> Result<()> {
    let parsed = script::parse_file(path)?;
    let transcript = script::run(&parsed, session)?;
    print!("{}", transcript);
    if let Some(out) = save {
        script::save_transcript(out, &transcript)?;
        log::info!("transcript saved to {}", out.display());
    }
    session.close();
    Ok(())
}
