//! Fixed helper library available to every script and transform invocation.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::error::ScriptError;
use crate::value::Value;

/// Dispatch a helper call by name. Returns `None` for unknown names so the
/// interpreter can fall through to module functions.
pub fn call(function: &Arc<str>, arguments: &[Value]) -> Option<Result<Value, ScriptError>> {
    let result = match function.as_ref() {
        "clamp" => clamp(function, arguments),
        "lerp" => lerp(function, arguments),
        "round" => round(function, arguments),
        "floor" => unary_math(function, arguments, f64::floor),
        "ceil" => unary_math(function, arguments, f64::ceil),
        "abs" => unary_math(function, arguments, f64::abs),
        "min" => fold_math(function, arguments, f64::min),
        "max" => fold_math(function, arguments, f64::max),
        "formatNumber" => format_number(function, arguments),
        "formatDate" => format_date(function, arguments),
        "colorRamp" => color_ramp(function, arguments),
        _ => return None,
    };
    Some(result)
}

fn number_argument(
    function: &Arc<str>,
    arguments: &[Value],
    index: usize,
    expected: usize,
) -> Result<f64, ScriptError> {
    let value = arguments.get(index).ok_or_else(|| ScriptError::Arity {
        function: function.clone(),
        expected,
        got: arguments.len(),
    })?;
    value
        .as_number()
        .ok_or_else(|| ScriptError::Type(format!("{function} expects numbers, got {value}")))
}

fn clamp(function: &Arc<str>, arguments: &[Value]) -> Result<Value, ScriptError> {
    let x = number_argument(function, arguments, 0, 3)?;
    let low = number_argument(function, arguments, 1, 3)?;
    let high = number_argument(function, arguments, 2, 3)?;
    Ok(Value::Number(x.max(low).min(high)))
}

fn lerp(function: &Arc<str>, arguments: &[Value]) -> Result<Value, ScriptError> {
    let a = number_argument(function, arguments, 0, 3)?;
    let b = number_argument(function, arguments, 1, 3)?;
    let t = number_argument(function, arguments, 2, 3)?;
    Ok(Value::Number(a + (b - a) * t))
}

fn round(function: &Arc<str>, arguments: &[Value]) -> Result<Value, ScriptError> {
    let x = number_argument(function, arguments, 0, 1)?;
    let digits = match arguments.get(1) {
        Some(value) => value
            .as_number()
            .ok_or_else(|| ScriptError::Type(format!("{function} digits must be a number")))?
            as i32,
        None => 0,
    };
    let factor = 10f64.powi(digits);
    Ok(Value::Number((x * factor).round() / factor))
}

fn unary_math(
    function: &Arc<str>,
    arguments: &[Value],
    apply: impl Fn(f64) -> f64,
) -> Result<Value, ScriptError> {
    if arguments.len() != 1 {
        return Err(ScriptError::Arity {
            function: function.clone(),
            expected: 1,
            got: arguments.len(),
        });
    }
    Ok(Value::Number(apply(number_argument(
        function, arguments, 0, 1,
    )?)))
}

fn fold_math(
    function: &Arc<str>,
    arguments: &[Value],
    apply: impl Fn(f64, f64) -> f64,
) -> Result<Value, ScriptError> {
    if arguments.is_empty() {
        return Err(ScriptError::Arity {
            function: function.clone(),
            expected: 1,
            got: 0,
        });
    }
    let mut accumulator = number_argument(function, arguments, 0, arguments.len())?;
    for index in 1..arguments.len() {
        accumulator = apply(
            accumulator,
            number_argument(function, arguments, index, arguments.len())?,
        );
    }
    Ok(Value::Number(accumulator))
}

fn format_number(function: &Arc<str>, arguments: &[Value]) -> Result<Value, ScriptError> {
    let x = number_argument(function, arguments, 0, 2)?;
    let digits = match arguments.get(1) {
        Some(value) => value
            .as_number()
            .ok_or_else(|| ScriptError::Type(format!("{function} digits must be a number")))?
            as usize,
        None => 2,
    };
    Ok(Value::text(format!("{x:.digits$}")))
}

fn format_date(function: &Arc<str>, arguments: &[Value]) -> Result<Value, ScriptError> {
    let millis = number_argument(function, arguments, 0, 2)? as i64;
    let format = match arguments.get(1) {
        Some(Value::Text(format)) => format.to_string(),
        Some(other) => {
            return Err(ScriptError::Type(format!(
                "{function} format must be text, got {other}"
            )));
        }
        None => "%Y-%m-%d %H:%M:%S".to_string(),
    };
    let timestamp = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ScriptError::Type(format!("{function}: invalid timestamp {millis}")))?;
    Ok(Value::text(timestamp.format(&format).to_string()))
}

/// Interpolate between color stops: `colorRamp(t, ["#004400", "#ffdd00"])`.
/// `t` is clamped to `0..=1` and mapped across the whole stop list.
fn color_ramp(function: &Arc<str>, arguments: &[Value]) -> Result<Value, ScriptError> {
    let t = number_argument(function, arguments, 0, 2)?.clamp(0.0, 1.0);
    let stops = match arguments.get(1) {
        Some(Value::List(stops)) if stops.len() >= 2 => stops,
        _ => {
            return Err(ScriptError::Type(format!(
                "{function} expects a list of at least two color stops"
            )));
        }
    };
    let mut colors = Vec::with_capacity(stops.len());
    for stop in stops {
        let text = stop
            .as_text()
            .ok_or_else(|| ScriptError::Type(format!("{function}: color stops must be text")))?;
        colors.push(parse_hex_color(text).ok_or_else(|| {
            ScriptError::Type(format!("{function}: malformed color stop {text}"))
        })?);
    }

    let scaled = t * (colors.len() - 1) as f64;
    let index = (scaled.floor() as usize).min(colors.len() - 2);
    let fraction = scaled - index as f64;
    let (r0, g0, b0) = colors[index];
    let (r1, g1, b1) = colors[index + 1];
    let mix = |a: u8, b: u8| -> u8 { (a as f64 + (b as f64 - a as f64) * fraction).round() as u8 };
    Ok(Value::text(format!(
        "#{:02x}{:02x}{:02x}",
        mix(r0, r1),
        mix(g0, g1),
        mix(b0, b1)
    )))
}

fn parse_hex_color(text: &str) -> Option<(u8, u8, u8)> {
    let hex = text.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helper(name: &str, arguments: &[Value]) -> Value {
        call(&Arc::from(name), arguments).unwrap().unwrap()
    }

    #[test]
    fn clamp_and_lerp() {
        assert_eq!(
            helper(
                "clamp",
                &[Value::Number(120.0), Value::Number(0.0), Value::Number(100.0)]
            ),
            Value::Number(100.0)
        );
        assert_eq!(
            helper(
                "lerp",
                &[Value::Number(0.0), Value::Number(10.0), Value::Number(0.25)]
            ),
            Value::Number(2.5)
        );
    }

    #[test]
    fn rounding_with_digits() {
        assert_eq!(
            helper("round", &[Value::Number(3.14159), Value::Number(2.0)]),
            Value::Number(3.14)
        );
    }

    #[test]
    fn number_formatting() {
        assert_eq!(
            helper("formatNumber", &[Value::Number(3.14159), Value::Number(1.0)]),
            Value::text("3.1")
        );
    }

    #[test]
    fn date_formatting() {
        assert_eq!(
            helper(
                "formatDate",
                &[Value::Number(0.0), Value::text("%Y-%m-%d")]
            ),
            Value::text("1970-01-01")
        );
    }

    #[test]
    fn color_ramp_midpoint() {
        let stops = Value::List(vec![Value::text("#000000"), Value::text("#ffffff")]);
        assert_eq!(
            helper("colorRamp", &[Value::Number(0.5), stops]),
            Value::text("#808080")
        );
    }

    #[test]
    fn unknown_helper_falls_through() {
        assert!(call(&Arc::from("nonsense"), &[]).is_none());
    }
}
