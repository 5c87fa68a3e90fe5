//! Inline expressions
//!
//! Catalog entries and `<eval>`/`<exec>` tags carry small expressions that
//! read and update session counters. They run in a closed `evalexpr`
//! context holding the counters, a few read-only locals and the helper
//! functions below; there is no access to the host.
//!
//! Helpers:
//! - `sequence(value, base, max, factor, n_bytes)`: triangle wave over
//!   `value`, printed as `n_bytes` spaced hex bytes
//! - `hex(value, digits)`: zero-padded upper-case hex
//! - `slice(string, start)`: suffix of `string` from character `start`
//! - `int(value)`: integer from a decimal string, float or boolean

use std::collections::HashMap;

use evalexpr::{
    eval_with_context_mut, Context, ContextWithMutableVariables, EvalexprError, EvalexprResult, Value,
};
use tracing::debug;

use crate::counters::{CounterValue, Counters};
use crate::error::{ElmError, ElmResult};

/// Read-only values visible to one evaluation
#[derive(Debug, Default, Clone)]
pub struct Locals<'a> {
    values: Vec<(&'a str, String)>,
}

impl<'a> Locals<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.values.push((name, value.into()));
        self
    }

    fn contains(&self, name: &str) -> bool {
        self.values.iter().any(|(n, _)| *n == name)
    }
}

/// Evaluation context over a snapshot of the counters
///
/// Assignments replace a variable whatever its previous type, so a counter
/// preset as `1` can later be set to `false`.
#[derive(Debug, Default)]
struct CounterContext {
    variables: HashMap<String, Value>,
}

impl CounterContext {
    fn new(counters: &Counters, locals: &Locals<'_>) -> Self {
        let mut variables: HashMap<String, Value> = counters
            .iter()
            .map(|(key, value)| (key.clone(), to_value(value)))
            .collect();
        for (name, value) in &locals.values {
            variables.insert((*name).to_string(), Value::String(value.clone()));
        }
        Self { variables }
    }
}

impl Context for CounterContext {
    fn get_value(&self, identifier: &str) -> Option<&Value> {
        self.variables.get(identifier)
    }

    fn call_function(&self, identifier: &str, argument: &Value) -> EvalexprResult<Value> {
        match identifier {
            "sequence" => sequence(argument),
            "hex" => hex_digits(argument),
            "slice" => slice(argument),
            "int" => to_int(argument),
            _ => Err(EvalexprError::FunctionIdentifierNotFound(identifier.to_string())),
        }
    }

    fn are_builtin_functions_disabled(&self) -> bool {
        false
    }

    fn set_builtin_functions_disabled(&mut self, disabled: bool) -> EvalexprResult<()> {
        if disabled {
            return Err(EvalexprError::BuiltinFunctionsCannotBeDisabled);
        }
        Ok(())
    }
}

impl ContextWithMutableVariables for CounterContext {
    fn set_value(&mut self, identifier: String, value: Value) -> EvalexprResult<()> {
        self.variables.insert(identifier, value);
        Ok(())
    }
}

/// Evaluate `expression`, writing assigned variables back to `counters`
///
/// Returns the printable result, `None` when the expression yields nothing.
pub fn evaluate(expression: &str, counters: &mut Counters, locals: &Locals<'_>) -> ElmResult<Option<String>> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Ok(None);
    }

    let mut context = CounterContext::new(counters, locals);
    let value = eval_with_context_mut(expression, &mut context).map_err(|e| ElmError::Expression {
        expression: expression.to_string(),
        message: e.to_string(),
    })?;

    for (name, value) in context.variables {
        if locals.contains(&name) {
            continue;
        }
        let Some(value) = to_counter(&value) else {
            continue;
        };
        if counters.get(&name) != Some(&value) {
            debug!(counter = %name, %value, "Counter updated by expression");
            counters.set(name, value);
        }
    }

    Ok(stringify(&value).filter(|s| !s.is_empty()))
}

fn to_value(value: &CounterValue) -> Value {
    match value {
        CounterValue::Bool(b) => Value::Boolean(*b),
        CounterValue::Int(i) => Value::Int(*i),
        CounterValue::Float(f) => Value::Float(*f),
        CounterValue::Str(s) => Value::String(s.clone()),
    }
}

fn to_counter(value: &Value) -> Option<CounterValue> {
    match value {
        Value::Boolean(b) => Some(CounterValue::Bool(*b)),
        Value::Int(i) => Some(CounterValue::Int(*i)),
        Value::Float(f) => Some(CounterValue::Float(*f)),
        Value::String(s) => Some(CounterValue::Str(s.clone())),
        Value::Tuple(_) | Value::Empty => None,
    }
}

/// Printable form; strings are not quoted
fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Empty => None,
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Tuple(items) => Some(items.iter().filter_map(stringify).collect::<Vec<_>>().join(" ")),
    }
}

fn sequence(argument: &Value) -> EvalexprResult<Value> {
    let args = argument.as_fixed_len_tuple(5)?;
    let value = args[0].as_number()?;
    let base = args[1].as_number()?;
    let max = args[2].as_number()?;
    let factor = args[3].as_number()?;
    let n_bytes = args[4].as_int()?;
    if max <= 0.0 || !(1..=8).contains(&n_bytes) {
        return Err(EvalexprError::CustomMessage(format!(
            "sequence: invalid max {} or byte count {}",
            max, n_bytes
        )));
    }
    let point = (factor * (max - (value + max).rem_euclid(max * 2.0)).abs()) as i64 + base as i64;
    let digits = (n_bytes * 2) as usize;
    let printed = format!("{:0width$X}", point.max(0), width = digits);
    let bytes: Vec<String> = printed
        .as_bytes()
        .chunks(2)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    Ok(Value::String(bytes.join(" ")))
}

fn hex_digits(argument: &Value) -> EvalexprResult<Value> {
    let args = argument.as_fixed_len_tuple(2)?;
    let value = args[0].as_int()?;
    let digits = args[1].as_int()?.clamp(0, 16) as usize;
    Ok(Value::String(format!("{:0width$X}", value, width = digits)))
}

fn slice(argument: &Value) -> EvalexprResult<Value> {
    let args = argument.as_fixed_len_tuple(2)?;
    let text = args[0].as_string()?;
    let start = args[1].as_int()?.max(0) as usize;
    Ok(Value::String(text.chars().skip(start).collect()))
}

fn to_int(argument: &Value) -> EvalexprResult<Value> {
    let value = match argument {
        Value::Int(i) => *i,
        Value::Float(f) => *f as i64,
        Value::Boolean(b) => i64::from(*b),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| EvalexprError::CustomMessage(format!("int: cannot parse {:?}", s)))?,
        other => return Err(EvalexprError::expected_int(other.clone())),
    };
    Ok(Value::Int(value))
}
