//! Frame introspection for the paused debuggee.
//!
//! The heavy lifting happens in a small Lua prelude built on the `debug`
//! library. Every prelude entry point locates the paused frame by walking
//! up the stack past its own frames, so it must be called directly from
//! the line hook.
use mlua::{Function, Lua, MultiValue, Table, Value};

pub const CHUNK_NAME: &str = "=(debugger)";
pub const EVAL_CHUNK_NAME: &str = "=(eval)";

const PRELUDE: &str = r#"
local getinfo, getlocal, setlocal = debug.getinfo, debug.getlocal, debug.setlocal
local getupvalue, setupvalue = debug.getupvalue, debug.setupvalue
local setmetatable, rawequal, pairs, ipairs = setmetatable, rawequal, pairs, ipairs
local sub = string.sub
local G = _G

local SELF = "=(debugger)"

-- level of the paused frame, relative to the caller of target()
local function target()
  local level = 2
  while true do
    local info = getinfo(level, "S")
    if info == nil then return nil end
    if info.what ~= "C" and info.source ~= SELF then return level - 1 end
    level = level + 1
  end
end

-- visible variables of the frame `level` levels above the caller
local function scope(level)
  level = level + 1
  local order, slot, value = {}, {}, {}
  local info = getinfo(level, "f")
  local func = info and info.func
  if func then
    local i = 1
    while true do
      local name, v = getupvalue(func, i)
      if name == nil then break end
      if name ~= "_ENV" and name ~= "" then
        if slot[name] == nil then order[#order + 1] = name end
        slot[name] = { "upvalue", i }
        value[name] = v
      end
      i = i + 1
    end
  end
  local i = 1
  while true do
    local name, v = getlocal(level, i)
    if name == nil then break end
    if sub(name, 1, 1) ~= "(" then
      if slot[name] == nil then order[#order + 1] = name end
      slot[name] = { "local", i }
      value[name] = v
    end
    i = i + 1
  end
  return order, slot, value, func
end

local function frame_env(func)
  if func then
    local i = 1
    while true do
      local name, v = getupvalue(func, i)
      if name == nil then break end
      if name == "_ENV" then return v end
      i = i + 1
    end
  end
  return G
end

local M = {}

function M.locals()
  local level = target()
  local names, values = {}, {}
  if level == nil then return names, values, 0 end
  local order, _, value = scope(level)
  for i, name in ipairs(order) do
    names[i] = name
    values[i] = value[name]
  end
  return names, values, #order
end

function M.capture()
  local level = target()
  local order, slot, value, func = {}, {}, {}, nil
  if level ~= nil then
    order, slot, value, func = scope(level)
  end
  local fenv = frame_env(func)
  local current = {}
  for k, v in pairs(value) do current[k] = v end
  local env = setmetatable({}, {
    __index = function(_, k)
      if slot[k] ~= nil then return current[k] end
      return fenv[k]
    end,
    __newindex = function(_, k, v)
      if slot[k] ~= nil then current[k] = v else fenv[k] = v end
    end,
  })
  return env, { slot = slot, original = value, current = current }
end

function M.restore(binding)
  local level = target()
  if level == nil then return 0 end
  local func = getinfo(level, "f").func
  local written = 0
  for name, where in pairs(binding.slot) do
    local v = binding.current[name]
    if not rawequal(v, binding.original[name]) then
      if where[1] == "local" then
        setlocal(level, where[2], v)
      else
        setupvalue(func, where[2], v)
      end
      written = written + 1
    end
  end
  return written
end

function M.stack(limit)
  local level = target()
  local frames = {}
  if level == nil then return frames end
  while #frames < limit do
    local info = getinfo(level, "Sln")
    if info == nil then break end
    if info.what ~= "C" then
      local name = info.name
      if name == nil then
        name = info.what == "main" and "<main>" or "<anonymous>"
      end
      frames[#frames + 1] = { info.source, info.short_src, info.currentline, name }
    end
    level = level + 1
  end
  return frames
end

return M
"#;

/// A frame as reported by the prelude, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub source: String,
    pub short_src: String,
    pub line: u32,
    pub function: String,
}

pub struct Inspector {
    locals: Function,
    capture: Function,
    restore: Function,
    stack: Function,
}

impl Inspector {
    pub fn load(lua: &Lua) -> mlua::Result<Self> {
        let module: Table = lua.load(PRELUDE).set_name(CHUNK_NAME).call(())?;
        Ok(Self {
            locals: module.get("locals")?,
            capture: module.get("capture")?,
            restore: module.get("restore")?,
            stack: module.get("stack")?,
        })
    }

    /// Upvalues and locals of the paused frame, later names shadowing
    /// earlier ones.
    pub fn locals(&self) -> mlua::Result<Vec<(String, Value)>> {
        let (names, values, count): (Table, Table, usize) = self.locals.call(())?;
        (1..=count)
            .map(|i| Ok((names.raw_get(i)?, values.raw_get(i)?)))
            .collect()
    }

    pub fn stack(&self, limit: usize) -> mlua::Result<Vec<RawFrame>> {
        let frames: Table = self.stack.call(limit)?;
        let mut out = Vec::new();
        for i in 1..=frames.raw_len() {
            let frame: Table = frames.raw_get(i)?;
            let line: i64 = frame.raw_get(3)?;
            out.push(RawFrame {
                source: frame.raw_get(1)?,
                short_src: frame.raw_get(2)?,
                line: u32::try_from(line).unwrap_or(0),
                function: frame.raw_get(4)?,
            });
        }
        Ok(out)
    }

    /// Evaluate `expression` in the paused frame's scope. Falls back to
    /// running it as a statement when it does not parse as an expression.
    pub fn eval(&self, lua: &Lua, expression: &str) -> mlua::Result<MultiValue> {
        self.in_frame(lua, expression, Order::ExpressionFirst)
            .map(|(values, _)| values)
    }

    /// Run `code` in the paused frame's scope. Returns the values of a bare
    /// expression so that they can be echoed.
    pub fn exec(&self, lua: &Lua, code: &str) -> mlua::Result<Option<MultiValue>> {
        self.in_frame(lua, code, Order::StatementFirst)
            .map(|(values, was_expression)| was_expression.then_some(values))
    }

    fn in_frame(
        &self,
        lua: &Lua,
        code: &str,
        order: Order,
    ) -> mlua::Result<(MultiValue, bool)> {
        let (env, binding): (Table, Table) = self.capture.call(())?;
        let result = compile(lua, code, &env, order).and_then(|(function, was_expression)| {
            let values: MultiValue = function.call(())?;
            Ok((values, was_expression))
        });
        let written: usize = self.restore.call(binding)?;
        if written > 0 {
            tracing::debug!(written, "wrote variables back to the paused frame");
        }
        result
    }
}

#[derive(Clone, Copy)]
enum Order {
    ExpressionFirst,
    StatementFirst,
}

fn compile(lua: &Lua, code: &str, env: &Table, order: Order) -> mlua::Result<(Function, bool)> {
    let as_expression = || {
        lua.load(format!("return {code}"))
            .set_name(EVAL_CHUNK_NAME)
            .set_environment(env.clone())
            .into_function()
    };
    let as_statement = || {
        lua.load(code)
            .set_name(EVAL_CHUNK_NAME)
            .set_environment(env.clone())
            .into_function()
    };
    match order {
        Order::ExpressionFirst => match as_expression() {
            Ok(f) => Ok((f, true)),
            Err(_) => as_statement().map(|f| (f, false)),
        },
        Order::StatementFirst => match as_statement() {
            Ok(f) => Ok((f, false)),
            Err(statement_error) => as_expression()
                .map(|f| (f, true))
                .map_err(|_| statement_error),
        },
    }
}

/// One line description of a Lua failure, without chunk prefix or
/// traceback.
pub fn error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::SyntaxError { message, .. } => strip_location(message),
        mlua::Error::RuntimeError(message) => strip_location(strip_traceback(message)),
        mlua::Error::CallbackError { cause, .. } => error_message(cause),
        other => strip_traceback(&other.to_string()).to_string(),
    }
}

/// Full description including traceback, for stderr.
pub fn error_report(err: &mlua::Error) -> String {
    err.to_string()
}

fn strip_traceback(message: &str) -> &str {
    match message.find("\nstack traceback:") {
        Some(i) => &message[..i],
        None => message,
    }
}

fn strip_location(message: &str) -> String {
    let chunk = EVAL_CHUNK_NAME.trim_start_matches('=');
    if let Some(rest) = message.strip_prefix(chunk).and_then(|r| r.strip_prefix(':')) {
        if let Some((line, text)) = rest.split_once(": ") {
            if line.chars().all(|c| c.is_ascii_digit()) {
                return text.to_string();
            }
        }
    }
    message.to_string()
}
