//! Routes the debuggee's standard streams over the channel.
//!
//! Output is forwarded as it is written. Reads become an
//! [`Event::InputRequest`] round trip that blocks the debuggee until the
//! host answers.
use std::{cell::RefCell, rc::Rc};

use mlua::{Function, Lua, MultiValue, Table, Value};
use transport::{Command, Event, HostMessage};

use crate::link::{Interrupt, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Out,
    Err,
}

/// Output collected while running interactive code.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Capture {
    pub stdout: String,
    pub stderr: String,
}

pub struct Relay {
    link: Rc<Link>,
    captures: RefCell<Vec<Capture>>,
    /// Trailing stdout text not yet terminated by a newline.
    prompt: RefCell<String>,
    /// Answered input not yet consumed by a read.
    pending: RefCell<String>,
}

impl Relay {
    pub fn new(link: Rc<Link>) -> Self {
        Self {
            link,
            captures: RefCell::new(Vec::new()),
            prompt: RefCell::new(String::new()),
            pending: RefCell::new(String::new()),
        }
    }

    pub fn write(&self, stream: Stream, text: &str) {
        if text.is_empty() {
            return;
        }
        if stream == Stream::Out {
            let mut prompt = self.prompt.borrow_mut();
            match text.rfind('\n') {
                Some(i) => {
                    prompt.clear();
                    prompt.push_str(&text[i + 1..]);
                }
                None => prompt.push_str(text),
            }
        }

        if let Some(capture) = self.captures.borrow_mut().last_mut() {
            match stream {
                Stream::Out => capture.stdout.push_str(text),
                Stream::Err => capture.stderr.push_str(text),
            }
            return;
        }

        let text = text.to_string();
        self.link.send(match stream {
            Stream::Out => Event::StdOut { text },
            Stream::Err => Event::StdErr { text },
        });
    }

    pub fn begin_capture(&self) {
        self.captures.borrow_mut().push(Capture::default());
    }

    pub fn end_capture(&self) -> Capture {
        self.captures.borrow_mut().pop().unwrap_or_default()
    }

    /// One request/response round trip. `None` is end of input.
    #[tracing::instrument(skip(self))]
    pub fn request_input(&self) -> Option<String> {
        if self.link.interrupted().is_some() {
            return None;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let prompt = std::mem::take(&mut *self.prompt.borrow_mut());
        self.link.send(Event::InputRequest {
            id: id.clone(),
            prompt,
        });

        loop {
            match self.link.recv() {
                Some(HostMessage::InputResponse { id: answered, text }) if answered == id => {
                    return text;
                }
                Some(HostMessage::InputResponse { id: stale, .. }) => {
                    tracing::warn!(%stale, "ignoring response to another input request");
                }
                Some(HostMessage::Command(Command::Quit)) => {
                    self.link.interrupt(Interrupt::Quit);
                    return None;
                }
                Some(HostMessage::Command(
                    command @ (Command::AddBreakpoint { .. } | Command::RemoveBreakpoint { .. }),
                )) => self.link.defer(command),
                Some(HostMessage::Command(command)) => {
                    tracing::warn!(?command, "ignoring command while waiting for input");
                }
                Some(HostMessage::Launch(_)) => {
                    tracing::warn!("ignoring launch arguments mid session");
                }
                Some(HostMessage::Finished) | None => {
                    self.link.interrupt(Interrupt::Quit);
                    return None;
                }
            }
        }
    }

    fn fill(&self) -> bool {
        match self.request_input() {
            Some(mut text) => {
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                self.pending.borrow_mut().push_str(&text);
                true
            }
            None => false,
        }
    }

    pub fn read_line(&self, keep_newline: bool) -> Option<String> {
        loop {
            {
                let mut pending = self.pending.borrow_mut();
                if let Some(end) = pending.find('\n') {
                    let mut line: String = pending.drain(..=end).collect();
                    if !keep_newline {
                        line.pop();
                    }
                    return Some(line);
                }
            }
            if !self.fill() {
                let rest = std::mem::take(&mut *self.pending.borrow_mut());
                return (!rest.is_empty()).then_some(rest);
            }
        }
    }

    pub fn read_all(&self) -> String {
        while self.fill() {}
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    pub fn read_chars(&self, count: usize) -> Option<String> {
        loop {
            let available = self.pending.borrow().chars().count();
            if available >= count.max(1) || !self.fill() {
                break;
            }
        }
        let mut pending = self.pending.borrow_mut();
        if pending.is_empty() {
            return None;
        }
        let end = pending
            .char_indices()
            .nth(count)
            .map_or(pending.len(), |(i, _)| i);
        Some(pending.drain(..end).collect())
    }

    pub fn read_number(&self) -> Option<Value> {
        let line = self.read_line(false)?;
        let text = line.trim();
        if let Ok(i) = text.parse::<i64>() {
            return Some(Value::Integer(i));
        }
        text.parse::<f64>().ok().map(Value::Number)
    }

    /// Replace `print` and the `io` stream functions with relaying ones.
    pub fn install(self: &Rc<Self>, lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        let tostring: Function = globals.get("tostring")?;
        let io: Table = globals.get("io")?;

        let relay = Rc::clone(self);
        let print_tostring = tostring.clone();
        let print = lua.create_function(move |_, args: MultiValue| {
            let mut line = String::new();
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    line.push('\t');
                }
                let text: mlua::String = print_tostring.call(arg.clone())?;
                line.push_str(&text.to_string_lossy());
            }
            line.push('\n');
            relay.write(Stream::Out, &line);
            Ok(())
        })?;
        globals.set("print", print)?;

        let stdout = self.output_file(lua, Stream::Out, tostring.clone())?;
        let stderr = self.output_file(lua, Stream::Err, tostring.clone())?;
        let stdin = self.input_file(lua)?;

        let relay = Rc::clone(self);
        let default_out = stdout.clone();
        let write = lua.create_function(move |_, args: MultiValue| {
            let text = concat_args(&tostring, args.iter(), "write")?;
            relay.write(Stream::Out, &text);
            Ok(default_out.clone())
        })?;
        io.set("write", write)?;

        let relay = Rc::clone(self);
        let read = lua.create_function(move |lua, formats: MultiValue| {
            relay.read_formats(lua, formats.iter())
        })?;
        io.set("read", read)?;
        io.set("flush", lua.create_function(|_, ()| Ok(()))?)?;

        io.set("stdout", stdout)?;
        io.set("stderr", stderr)?;
        io.set("stdin", stdin)?;
        Ok(())
    }

    fn output_file(self: &Rc<Self>, lua: &Lua, stream: Stream, tostring: Function) -> mlua::Result<Table> {
        let file = lua.create_table()?;
        let relay = Rc::clone(self);
        let write = lua.create_function(move |_, (this, args): (Value, MultiValue)| {
            let text = concat_args(&tostring, args.iter(), "write")?;
            relay.write(stream, &text);
            Ok(this)
        })?;
        file.set("write", write)?;
        file.set("flush", lua.create_function(|_, this: Value| Ok(this))?)?;
        file.set("close", lua.create_function(|_, _: MultiValue| Ok(true))?)?;
        file.set("setvbuf", lua.create_function(|_, _: MultiValue| Ok(true))?)?;
        Ok(file)
    }

    fn input_file(self: &Rc<Self>, lua: &Lua) -> mlua::Result<Table> {
        let file = lua.create_table()?;
        let relay = Rc::clone(self);
        let read = lua.create_function(move |lua, (_this, formats): (Value, MultiValue)| {
            relay.read_formats(lua, formats.iter())
        })?;
        file.set("read", read)?;
        file.set(
            "write",
            lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
                Err(mlua::Error::RuntimeError(
                    "cannot write to an input stream".to_string(),
                ))
            })?,
        )?;
        file.set("close", lua.create_function(|_, _: MultiValue| Ok(true))?)?;
        Ok(file)
    }

    fn read_formats<'a>(
        &self,
        lua: &Lua,
        formats: impl Iterator<Item = &'a Value>,
    ) -> mlua::Result<MultiValue> {
        let mut formats: Vec<Value> = formats.cloned().collect();
        if formats.is_empty() {
            formats.push(Value::Nil);
        }

        let mut results = Vec::new();
        for (i, format) in formats.into_iter().enumerate() {
            let value = match ReadFormat::parse(&format, i + 1)? {
                ReadFormat::Line { keep_newline } => match self.read_line(keep_newline) {
                    Some(line) => Value::String(lua.create_string(&line)?),
                    None => Value::Nil,
                },
                ReadFormat::Number => self.read_number().unwrap_or(Value::Nil),
                ReadFormat::All => Value::String(lua.create_string(self.read_all())?),
                ReadFormat::Count(n) => match self.read_chars(n) {
                    Some(text) => Value::String(lua.create_string(&text)?),
                    None => Value::Nil,
                },
            };
            let stop = value.is_nil();
            results.push(value);
            if stop {
                break;
            }
        }
        Ok(MultiValue::from_iter(results))
    }
}

enum ReadFormat {
    Line { keep_newline: bool },
    Number,
    All,
    Count(usize),
}

impl ReadFormat {
    fn parse(format: &Value, position: usize) -> mlua::Result<Self> {
        let invalid = || {
            mlua::Error::RuntimeError(format!("bad argument #{position} to 'read' (invalid format)"))
        };
        match format {
            Value::Nil => Ok(ReadFormat::Line {
                keep_newline: false,
            }),
            Value::Integer(n) => usize::try_from(*n).map(ReadFormat::Count).map_err(|_| invalid()),
            Value::Number(n) if *n >= 0.0 => Ok(ReadFormat::Count(*n as usize)),
            Value::String(s) => {
                let s = String::from(s.to_string_lossy());
                match s.trim_start_matches('*').chars().next() {
                    Some('l') => Ok(ReadFormat::Line {
                        keep_newline: false,
                    }),
                    Some('L') => Ok(ReadFormat::Line { keep_newline: true }),
                    Some('n') => Ok(ReadFormat::Number),
                    Some('a') => Ok(ReadFormat::All),
                    _ => Err(invalid()),
                }
            }
            _ => Err(invalid()),
        }
    }
}

fn concat_args<'a>(
    tostring: &Function,
    args: impl Iterator<Item = &'a Value>,
    name: &str,
) -> mlua::Result<String> {
    let mut out = String::new();
    for (i, arg) in args.enumerate() {
        match arg {
            Value::String(s) => out.push_str(&s.to_string_lossy()),
            Value::Integer(_) | Value::Number(_) => {
                let text: mlua::String = tostring.call(arg.clone())?;
                out.push_str(&text.to_string_lossy());
            }
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "bad argument #{} to '{name}' (string expected, got {})",
                    i + 1,
                    other.type_name()
                )))
            }
        }
    }
    Ok(out)
}
