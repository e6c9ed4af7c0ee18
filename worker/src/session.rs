//! Runs one target script under the tracer.
use std::{collections::HashSet, path::Path, rc::Rc};

use eyre::WrapErr;
use mlua::{Lua, Table, Value, Variadic};
use transport::{Event, LaunchArguments};

use crate::{
    inspect,
    link::{Interrupt, Link},
    relay::Relay,
    tracer::{StepMode, Tracer},
};

/// How the debuggee run ended.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Quit,
    Exited(i32),
    Failed(String),
}

pub struct Session {
    link: Rc<Link>,
    arguments: LaunchArguments,
}

impl Session {
    pub fn new(link: Rc<Link>, arguments: LaunchArguments) -> Self {
        Self { link, arguments }
    }

    /// Run the script and report how it ended. Does not send `Finished`.
    #[tracing::instrument(skip(self), fields(script = %self.arguments.script.display()))]
    pub fn run(self) -> Outcome {
        let outcome = match self.execute() {
            Ok(()) => match self.link.interrupted() {
                None => Outcome::Completed,
                Some(Interrupt::Quit) => Outcome::Quit,
                Some(Interrupt::Exit(code)) => Outcome::Exited(code),
            },
            Err(e) => match self.link.interrupted() {
                Some(Interrupt::Quit) => Outcome::Quit,
                Some(Interrupt::Exit(code)) => Outcome::Exited(code),
                None => Outcome::Failed(format!("{e:#}")),
            },
        };
        tracing::debug!(?outcome, "debuggee stopped");
        self.report(&outcome);
        outcome
    }

    fn report(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed | Outcome::Quit => {}
            Outcome::Exited(code) => self.link.send(Event::StdOut {
                text: format!("Script terminated with exit code {code}\n"),
            }),
            Outcome::Failed(report) => self.link.send(Event::StdErr {
                text: format!("Unhandled error in debuggee:\n{report}\n"),
            }),
        }
    }

    fn execute(&self) -> eyre::Result<()> {
        let script = std::fs::canonicalize(&self.arguments.script)
            .wrap_err_with(|| format!("cannot open {}", self.arguments.script.display()))?;
        if let Some(dir) = &self.arguments.working_directory {
            std::env::set_current_dir(dir)
                .wrap_err_with(|| format!("changing directory to {}", dir.display()))?;
        }

        // SAFETY: the debug library is needed to read frames of the debuggee.
        // Only the worker's own prelude and the user's script run in this VM.
        let lua = unsafe { Lua::unsafe_new() };

        let relay = Rc::new(Relay::new(Rc::clone(&self.link)));
        relay.install(&lua).map_err(lua_error)?;
        self.install_exit(&lua).map_err(lua_error)?;
        prepend_search_path(&lua, &script).map_err(lua_error)?;
        install_args(&lua, &script, &self.arguments.args).map_err(lua_error)?;
        let baseline = global_names(&lua).map_err(lua_error)?;

        let mode = if self.arguments.stop_on_entry {
            StepMode::Step
        } else {
            StepMode::Continue
        };
        let tracer = Tracer::new(
            &lua,
            Rc::clone(&self.link),
            Rc::clone(&relay),
            self.arguments.options.clone(),
            baseline,
            mode,
        )
        .map_err(lua_error)?;
        tracer.seed(&self.arguments.breakpoints);
        let tracer = Rc::new(tracer);
        tracer.trace_coroutines(&lua).map_err(lua_error)?;

        let source = std::fs::read_to_string(&script)
            .wrap_err_with(|| format!("reading {}", script.display()))?;
        let main = lua
            .load(strip_shebang(&source))
            .set_name(format!("@{}", script.display()))
            .into_function()
            .map_err(lua_error)?;

        tracer.attach(&lua.current_thread());
        let result: mlua::Result<()> = main.call(Variadic::from_iter(self.arguments.args.clone()));
        lua.remove_hook();

        result.map_err(lua_error)
    }

    fn install_exit(&self, lua: &Lua) -> mlua::Result<()> {
        let os: Table = lua.globals().get("os")?;
        let link = Rc::clone(&self.link);
        let exit = lua.create_function(move |_, code: Value| -> mlua::Result<()> {
            let code = exit_code(&code)?;
            link.interrupt(Interrupt::Exit(code));
            Err(Interrupt::Exit(code).to_error())
        })?;
        os.set("exit", exit)
    }
}

/// Status for `os.exit(code)`. Out of range codes saturate.
fn exit_code(code: &Value) -> mlua::Result<i32> {
    match code {
        Value::Nil | Value::Boolean(true) => Ok(0),
        Value::Boolean(false) => Ok(1),
        Value::Integer(n) => Ok(i32::try_from(*n).unwrap_or(if *n < 0 {
            i32::MIN
        } else {
            i32::MAX
        })),
        // `as` saturates and maps NaN to 0
        Value::Number(n) => Ok(*n as i32),
        other => Err(mlua::Error::RuntimeError(format!(
            "bad argument #1 to 'exit' (number expected, got {})",
            other.type_name()
        ))),
    }
}

fn lua_error(e: mlua::Error) -> eyre::Report {
    eyre::eyre!(inspect::error_report(&e))
}

fn prepend_search_path(lua: &Lua, script: &Path) -> mlua::Result<()> {
    let Some(dir) = script.parent() else {
        return Ok(());
    };
    let package: Table = lua.globals().get("package")?;
    let path: String = package.get("path")?;
    package.set("path", format!("{}/?.lua;{path}", dir.display()))
}

fn install_args(lua: &Lua, script: &Path, args: &[String]) -> mlua::Result<()> {
    let table = lua.create_table()?;
    table.raw_set(0, script.display().to_string())?;
    for (i, arg) in args.iter().enumerate() {
        table.raw_set(i + 1, arg.as_str())?;
    }
    lua.globals().set("arg", table)
}

fn global_names(lua: &Lua) -> mlua::Result<HashSet<String>> {
    let mut names = HashSet::new();
    lua.globals().for_each(|key: Value, _: Value| {
        if let Value::String(s) = key {
            names.insert(String::from(s.to_string_lossy()));
        }
        Ok(())
    })?;
    Ok(names)
}

/// Keep line numbers intact while hiding a `#!` line from the compiler.
fn strip_shebang(source: &str) -> String {
    match source.strip_prefix('#') {
        Some(rest) => format!("--{rest}"),
        None => source.to_string(),
    }
}
