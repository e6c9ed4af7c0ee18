use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, Context};
use config::Settings;
use debugger::{
    Breakpoint, Controller, ControllerOptions, LaunchRequest, ProcessLauncher, WorkerCommand,
};
use state::{PerFile, StateManager};
use tracing_subscriber::filter::EnvFilter;

mod app;
mod command;

#[derive(Debug, Parser)]
#[command(name = "luadbg", about = "Step through Lua scripts")]
struct Args {
    /// Settings file (default: <config dir>/luadbg/config.toml)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Where breakpoints and arguments are remembered between runs
    #[clap(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Debug a script interactively
    Debug {
        script: PathBuf,

        /// Breakpoint as file:line, may be repeated
        #[clap(short, long)]
        breakpoints: Vec<Breakpoint>,

        /// Pause on the first line
        #[clap(long)]
        stop_on_entry: bool,

        /// Arguments passed to the script
        #[clap(last = true)]
        args: Vec<String>,
    },

    /// Run the debuggee side of a session over stdin and stdout
    #[command(hide = true)]
    Worker,
}

fn init_logging() {
    // stdout belongs to the user, or to the protocol in a worker
    if std::io::stderr().is_terminal() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .json()
            .try_init();
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install().context("installing color_eyre")?;
    init_logging();

    let args = Args::parse();
    match args.command {
        Commands::Worker => worker::serve().context("running worker"),
        Commands::Debug {
            script,
            breakpoints,
            stop_on_entry,
            args: script_args,
        } => {
            let settings = match &args.config {
                Some(path) => Settings::load(path),
                None => Settings::load_default(),
            }
            .context("loading settings")?;
            let state_path = args
                .state
                .or_else(StateManager::default_path)
                .ok_or_else(|| eyre::eyre!("cannot determine a location for the state file"))?;

            debug(
                &settings,
                &state_path,
                &script,
                breakpoints,
                stop_on_entry,
                script_args,
            )
        }
    }
}

#[tracing::instrument(skip(settings, breakpoints, script_args))]
fn debug(
    settings: &Settings,
    state_path: &Path,
    script: &Path,
    breakpoints: Vec<Breakpoint>,
    stop_on_entry: bool,
    script_args: Vec<String>,
) -> eyre::Result<()> {
    let script = script
        .canonicalize()
        .with_context(|| format!("opening script {}", script.display()))?;
    let mut state = StateManager::new(state_path).context("loading debugger state")?;
    let saved = state.for_script(&script).cloned().unwrap_or_default();

    let mut all_breakpoints = saved.breakpoints;
    for breakpoint in breakpoints {
        if !all_breakpoints.contains(&breakpoint) {
            all_breakpoints.push(breakpoint);
        }
    }
    let script_args = if script_args.is_empty() {
        saved.args
    } else {
        script_args
    };

    let command = match &settings.worker.program {
        Some(program) => WorkerCommand {
            program: program.clone(),
            args: settings.worker.args.clone(),
        },
        None => WorkerCommand::current_exe()?,
    };
    let options = ControllerOptions {
        poll_interval: settings.poll_interval(),
        join_timeout: settings.join_timeout(),
        worker: settings.worker_options(),
    };
    let mut controller = Controller::new(Box::new(ProcessLauncher::new(command)), options);
    controller.set_breakpoints(all_breakpoints);

    let mut request = LaunchRequest::new(&script);
    request.args = script_args.clone();
    request.stop_on_entry = stop_on_entry;
    controller.launch(request).context("starting debugger")?;
    match controller.worker_pid() {
        Some(pid) => println!("debugging {} (worker pid {pid})", script.display()),
        None => println!("debugging {}", script.display()),
    }

    let mut app = app::App::new(controller, script.clone(), settings.poll_interval());
    let result = app.run();

    state.update(PerFile {
        path: script,
        breakpoints: app.controller().breakpoints().to_vec(),
        args: script_args,
    });
    state.save().context("saving debugger state")?;
    result
}
