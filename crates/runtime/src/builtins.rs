//! The fixed `BUILTIN` dispatch table (spec §4.F, §6): `print`, `len`,
//! `type`, `tostring`, `tonumber`, `range`. Ids 0-5 are reserved for these;
//! a host extending the table via `Vm::register_builtin` starts at 6.

use std::rc::Rc;

use aql_core::{AqlError, RangeObj, TString, Thread, Value};

pub const PRINT: u8 = 0;
pub const LEN: u8 = 1;
pub const TYPE: u8 = 2;
pub const TOSTRING: u8 = 3;
pub const TONUMBER: u8 = 4;
pub const RANGE: u8 = 5;

pub fn dispatch(id: u8, thread: &mut Thread, args: &[Value]) -> Result<Value, AqlError> {
    match id {
        PRINT => builtin_print(thread, args),
        LEN => builtin_len(args),
        TYPE => builtin_type(args),
        TOSTRING => builtin_tostring(args),
        TONUMBER => builtin_tonumber(args),
        RANGE => builtin_range(args),
        other => Err(AqlError::runtime(format!("unknown builtin id {other}"))),
    }
}

/// Render a value the way `print`/`tostring` show it: strings unquoted,
/// everything else via `Value`'s `Debug` text (`Value`'s `Debug` impl is
/// already exactly this display form for non-string types).
pub fn display_value(v: &Value) -> String {
    match v {
        Value::Str(s) => s.as_str().to_string(),
        other => format!("{other:?}"),
    }
}

/// What `..`/`CONCAT` accepts: strings and numbers coerce, everything else
/// is a runtime error ("attempt to concatenate a X value").
pub fn concat_operand(v: &Value) -> Result<String, AqlError> {
    match v {
        Value::Str(s) => Ok(s.as_str().to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        other => Err(AqlError::runtime(format!("attempt to concatenate a {} value", other.type_name()))),
    }
}

fn builtin_print(_thread: &mut Thread, args: &[Value]) -> Result<Value, AqlError> {
    let line: Vec<String> = args.iter().map(display_value).collect();
    println!("{}", line.join("\t"));
    Ok(Value::Nil)
}

fn builtin_len(args: &[Value]) -> Result<Value, AqlError> {
    let v = args.first().unwrap_or(&Value::Nil);
    let n = match v {
        Value::Range(r) => r.len() as i64,
        other => other.len()?,
    };
    Ok(Value::Int(n))
}

fn builtin_type(args: &[Value]) -> Result<Value, AqlError> {
    let v = args.first().unwrap_or(&Value::Nil);
    Ok(Value::Str(TString::owned(v.type_name())))
}

fn builtin_tostring(args: &[Value]) -> Result<Value, AqlError> {
    let v = args.first().unwrap_or(&Value::Nil);
    Ok(Value::Str(TString::owned(display_value(v))))
}

fn builtin_tonumber(args: &[Value]) -> Result<Value, AqlError> {
    let v = args.first().unwrap_or(&Value::Nil);
    let result = match v {
        Value::Int(_) | Value::Float(_) => v.clone(),
        Value::Str(s) => {
            let trimmed = s.as_str().trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Value::Int(i)
            } else if let Ok(f) = trimmed.parse::<f64>() {
                Value::Float(f)
            } else {
                Value::Nil
            }
        }
        _ => Value::Nil,
    };
    Ok(result)
}

fn builtin_range(args: &[Value]) -> Result<Value, AqlError> {
    let as_int = |v: &Value| -> Result<i64, AqlError> {
        match v {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => {
                Value::float_to_int_exact(*f).ok_or_else(|| AqlError::runtime("'range' argument is not an integer"))
            }
            other => Err(AqlError::runtime(format!("'range' argument must be a number, got {}", other.type_name()))),
        }
    };
    let (start, stop, step) = match args.len() {
        1 => (0, as_int(&args[0])?, 1),
        2 => (as_int(&args[0])?, as_int(&args[1])?, 1),
        3 => (as_int(&args[0])?, as_int(&args[1])?, as_int(&args[2])?),
        n => return Err(AqlError::runtime(format!("'range' takes 1 to 3 arguments, got {n}"))),
    };
    Ok(Value::Range(Rc::new(RangeObj::new(start, stop, step)?)))
}
