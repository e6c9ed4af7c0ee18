use std::str::FromStr;

/// Where a breakpoint command points: a bare line in the debugged script or
/// a full `file:line` specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Line(u32),
    Spec(String),
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Step,
    Next,
    Continue,
    Return,
    Quit,
    Print(String),
    Exec(String),
    Break(Target),
    Delete(Target),
    Backtrace,
    Vars,
    Breakpoints,
    Stop,
    Help,
    Empty,
}

pub const HELP: &str = "\
s, step          step into the next line
n, next          step over calls
c, continue      run until the next breakpoint
r, return        run until the current function returns
q, quit          end the session
p <expr>         evaluate an expression in the paused frame
e <code>         run statements in the paused frame
b [file:]line    add a breakpoint
d [file:]line    remove a breakpoint
bt               show the call stack
vars             show locals and globals
bps              list breakpoints
stop             kill the debuggee
help             show this message";

impl FromStr for ReplCommand {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (word, rest) = match s.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (s, ""),
        };

        let command = match word {
            "" => ReplCommand::Empty,
            "s" | "step" => ReplCommand::Step,
            "n" | "next" => ReplCommand::Next,
            "c" | "continue" => ReplCommand::Continue,
            "r" | "return" => ReplCommand::Return,
            "q" | "quit" => ReplCommand::Quit,
            "bt" | "backtrace" => ReplCommand::Backtrace,
            "vars" => ReplCommand::Vars,
            "bps" => ReplCommand::Breakpoints,
            "stop" => ReplCommand::Stop,
            "h" | "help" => ReplCommand::Help,
            "p" | "print" => {
                eyre::ensure!(!rest.is_empty(), "usage: p <expr>");
                ReplCommand::Print(rest.to_string())
            }
            "e" | "exec" => {
                eyre::ensure!(!rest.is_empty(), "usage: e <code>");
                ReplCommand::Exec(rest.to_string())
            }
            "b" | "break" => ReplCommand::Break(target(rest)?),
            "d" | "delete" => ReplCommand::Delete(target(rest)?),
            other => eyre::bail!("unknown command '{other}', try 'help'"),
        };
        if !matches!(
            command,
            ReplCommand::Print(_)
                | ReplCommand::Exec(_)
                | ReplCommand::Break(_)
                | ReplCommand::Delete(_)
        ) {
            eyre::ensure!(rest.is_empty(), "'{word}' takes no arguments");
        }
        Ok(command)
    }
}

fn target(rest: &str) -> eyre::Result<Target> {
    eyre::ensure!(!rest.is_empty(), "usage: b [file:]line");
    if rest.contains(':') {
        return Ok(Target::Spec(rest.to_string()));
    }
    let line: u32 = rest
        .parse()
        .map_err(|_| eyre::eyre!("invalid line number '{rest}'"))?;
    eyre::ensure!(line > 0, "line numbers start at 1");
    Ok(Target::Line(line))
}
