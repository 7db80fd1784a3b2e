use crate::catalog::{ToolSpec, JOIN_TOOL};
use crate::completion::ToolCall;
use crate::graph::{ArgValue, GraphError, RawTask, TaskId, TemplatePart};
use regex::Regex;
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

pub const END_OF_PLAN: &str = "<END_OF_PLAN>";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanParseError {
    #[error("planner returned an empty plan")]
    EmptyResponse,
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("task {id} follows task {previous}; task ids must strictly increase")]
    NonIncreasingId { id: TaskId, previous: TaskId },
    #[error("task {task} calls unknown tool `{tool}`")]
    UnknownTool { task: TaskId, tool: String },
    #[error("task {task} calls `{tool}` with {found} argument(s), expected {expected}")]
    ArityMismatch {
        task: TaskId,
        tool: String,
        expected: usize,
        found: usize,
    },
    #[error("task {task} passes {found} for `{argument}` of `{tool}`, expected {expected}")]
    ArgumentType {
        task: TaskId,
        tool: String,
        argument: String,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn patterns() -> Option<&'static (Regex, Regex, Regex, Regex)> {
    static PATTERNS: OnceLock<Option<(Regex, Regex, Regex, Regex)>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let thought = Regex::new(r"^Thought\s*:\s*(.*)$").ok()?;
            let numbered = Regex::new(r"^\d+\s*\.").ok()?;
            let action =
                Regex::new(r"^(\d+)\s*\.\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$").ok()?;
            let reference = Regex::new(r"\$(\d+)").ok()?;
            Some((thought, numbered, action, reference))
        })
        .as_ref()
}

/// Parses planner text of the form
///
/// ```text
/// Thought: optional reasoning
/// 1. tool_name("literal", $0, [1, 2])
/// 2. join()<END_OF_PLAN>
/// ```
///
/// Prose lines are ignored; parsing stops at the first join.
pub fn parse_plan_text(text: &str) -> Result<Vec<RawTask>, PlanParseError> {
    let body = match text.find(END_OF_PLAN) {
        Some(end) => &text[..end],
        None => text,
    };
    if body.trim().is_empty() {
        return Err(PlanParseError::EmptyResponse);
    }
    let Some((thought_re, numbered_re, action_re, _)) = patterns() else {
        return Err(PlanParseError::Syntax {
            line: 0,
            reason: "plan patterns failed to compile".to_string(),
        });
    };

    let mut tasks: Vec<RawTask> = Vec::new();
    let mut pending_thought = None;
    for (index, line) in body.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(caps) = thought_re.captures(trimmed) {
            let thought = caps[1].trim();
            if !thought.is_empty() {
                pending_thought = Some(thought.to_string());
            }
            continue;
        }
        if !numbered_re.is_match(trimmed) {
            continue;
        }

        let caps = action_re
            .captures(trimmed)
            .ok_or_else(|| PlanParseError::Syntax {
                line: line_no,
                reason: format!("expected `N. tool(args)`, found `{trimmed}`"),
            })?;
        let id = caps[1].parse::<TaskId>().map_err(|_| PlanParseError::Syntax {
            line: line_no,
            reason: format!("task id `{}` is out of range", &caps[1]),
        })?;
        if let Some(previous) = tasks.last() {
            if id <= previous.id {
                return Err(PlanParseError::NonIncreasingId {
                    id,
                    previous: previous.id,
                });
            }
        }
        let args = parse_args(&caps[3]).map_err(|reason| PlanParseError::Syntax {
            line: line_no,
            reason,
        })?;
        let mut task = RawTask::new(id, &caps[2], args);
        task.thought = pending_thought.take();
        let is_join = task.is_join();
        tasks.push(task);
        if is_join {
            break;
        }
    }

    if tasks.is_empty() {
        return Err(PlanParseError::EmptyResponse);
    }
    Ok(tasks)
}

/// Converts structured tool calls into numbered tasks, appending a join
/// when the model did not request one.
pub fn tasks_from_tool_calls(calls: Vec<ToolCall>) -> Result<Vec<RawTask>, PlanParseError> {
    if calls.is_empty() {
        return Err(PlanParseError::EmptyResponse);
    }
    let mut tasks = Vec::with_capacity(calls.len() + 1);
    for (index, call) in calls.into_iter().enumerate() {
        let id = index as TaskId + 1;
        if call.name == JOIN_TOOL {
            tasks.push(RawTask::join(id));
            return Ok(tasks);
        }
        let args = call.arguments.into_iter().map(arg_from_json).collect();
        tasks.push(RawTask::new(id, &call.name, args));
    }
    let next = tasks.len() as TaskId + 1;
    tasks.push(RawTask::join(next));
    Ok(tasks)
}

/// Checks every non-join task against the tool subset the planner was
/// shown: the tool must exist, arity must match and literal arguments must
/// have the declared type.
pub fn validate_tasks(tasks: &[RawTask], tools: &[Arc<ToolSpec>]) -> Result<(), PlanParseError> {
    let empty = BTreeMap::new();
    for task in tasks.iter().filter(|task| !task.is_join()) {
        let spec = tools
            .iter()
            .find(|spec| spec.name == task.tool)
            .ok_or_else(|| PlanParseError::UnknownTool {
                task: task.id,
                tool: task.tool.clone(),
            })?;
        if task.args.len() != spec.arity() {
            return Err(PlanParseError::ArityMismatch {
                task: task.id,
                tool: task.tool.clone(),
                expected: spec.arity(),
                found: task.args.len(),
            });
        }
        for (arg, arg_spec) in task.args.iter().zip(spec.args.iter()) {
            let Ok(value) = arg.resolve(&empty) else {
                continue;
            };
            if value.is_null() || arg_spec.arg_type.accepts(&value) {
                continue;
            }
            return Err(PlanParseError::ArgumentType {
                task: task.id,
                tool: task.tool.clone(),
                argument: arg_spec.name.clone(),
                expected: arg_spec.arg_type.to_string(),
                found: value.to_string(),
            });
        }
    }
    Ok(())
}

fn arg_from_json(value: Value) -> ArgValue {
    match value {
        Value::String(text) => classify_string(text),
        Value::Array(items) => ArgValue::List(items.into_iter().map(arg_from_json).collect()),
        other => ArgValue::Literal(other),
    }
}

/// `"$3"` becomes a reference, `"call $3 now"` a template, anything else a
/// plain string literal.
fn classify_string(text: String) -> ArgValue {
    let Some((_, _, _, reference_re)) = patterns() else {
        return ArgValue::Literal(Value::String(text));
    };
    if !reference_re.is_match(&text) {
        return ArgValue::Literal(Value::String(text));
    }

    let mut parts = Vec::new();
    let mut cursor = 0;
    for caps in reference_re.captures_iter(&text) {
        let (Some(whole), Ok(id)) = (caps.get(0), caps[1].parse::<TaskId>()) else {
            continue;
        };
        if whole.start() > cursor {
            parts.push(TemplatePart::Text(text[cursor..whole.start()].to_string()));
        }
        parts.push(TemplatePart::Ref(id));
        cursor = whole.end();
    }
    if cursor < text.len() {
        parts.push(TemplatePart::Text(text[cursor..].to_string()));
    }

    match parts.as_slice() {
        [TemplatePart::Ref(id)] => ArgValue::Ref(*id),
        [] => ArgValue::Literal(Value::String(text)),
        _ => ArgValue::Template(parts),
    }
}

pub(crate) fn parse_args(raw: &str) -> Result<Vec<ArgValue>, String> {
    let mut parser = ArgParser::new(raw);
    let args = parser.sequence(None)?;
    parser.skip_ws();
    if let Some(ch) = parser.peek() {
        return Err(format!("unexpected `{ch}` at column {}", parser.pos + 1));
    }
    Ok(args)
}

struct ArgParser {
    chars: Vec<char>,
    pos: usize,
}

impl ArgParser {
    fn new(raw: &str) -> Self {
        Self {
            chars: raw.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// Comma-separated values up to `close` (or end of input when `None`).
    /// A trailing comma is allowed.
    fn sequence(&mut self, close: Option<char>) -> Result<Vec<ArgValue>, String> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match (self.peek(), close) {
                (None, None) => return Ok(items),
                (None, Some(close)) => return Err(format!("missing closing `{close}`")),
                (Some(ch), Some(close)) if ch == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => {}
            }

            items.push(self.value()?);
            self.skip_ws();
            match (self.peek(), close) {
                (Some(','), _) => {
                    self.pos += 1;
                }
                (None, None) => return Ok(items),
                (Some(ch), Some(close)) if ch == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                (Some(ch), _) => {
                    return Err(format!(
                        "expected `,` but found `{ch}` at column {}",
                        self.pos + 1
                    ))
                }
                (None, Some(close)) => return Err(format!("missing closing `{close}`")),
            }
        }
    }

    fn value(&mut self) -> Result<ArgValue, String> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let text = self.string(quote)?;
                Ok(classify_string(text))
            }
            Some('[') => {
                self.pos += 1;
                Ok(ArgValue::List(self.sequence(Some(']'))?))
            }
            Some('(') => {
                self.pos += 1;
                Ok(ArgValue::List(self.sequence(Some(')'))?))
            }
            Some('$') => {
                self.pos += 1;
                let digits = self.take_while(|ch| ch.is_ascii_digit());
                digits
                    .parse::<TaskId>()
                    .map(ArgValue::Ref)
                    .map_err(|_| format!("invalid reference `${digits}`"))
            }
            Some(ch) if ch == '-' || ch == '+' || ch == '.' || ch.is_ascii_digit() => {
                let raw = self.take_while(|ch| {
                    ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E' | '_')
                });
                number_literal(&raw.replace('_', ""))
            }
            Some(ch) if ch.is_alphabetic() || ch == '_' => {
                let word = self.take_while(|ch| ch.is_alphanumeric() || ch == '_');
                self.skip_ws();
                if self.peek() == Some('=') {
                    return Err(format!("named argument `{word}=` is not supported"));
                }
                match word.as_str() {
                    "True" | "true" => Ok(ArgValue::Literal(Value::Bool(true))),
                    "False" | "false" => Ok(ArgValue::Literal(Value::Bool(false))),
                    "None" | "null" => Ok(ArgValue::Literal(Value::Null)),
                    _ => Err(format!("unquoted text `{word}`; string arguments need quotes")),
                }
            }
            Some(ch) => Err(format!("unexpected `{ch}` at column {}", self.pos + 1)),
            None => Err("expected a value".to_string()),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, String> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(format!("unterminated string starting with {quote}")),
                Some(ch) if ch == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => return Err("dangling escape at end of arguments".to_string()),
                },
                Some(ch) => out.push(ch),
            }
        }
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

fn number_literal(raw: &str) -> Result<ArgValue, String> {
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(ArgValue::Literal(Value::Number(int.into())));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(|number| ArgValue::Literal(Value::Number(number)))
        .ok_or_else(|| format!("invalid number `{raw}`"))
}
