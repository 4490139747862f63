//! Custom-rule expression evaluator backing the `__custom__` alert module.
//!
//! Rules are boolean expressions written against a flat namespace of the
//! current position's fields and its sensor map, e.g.
//! `speed > 120 && sensors.fuel_level < 10`.

use evalexpr::{context_map, eval_boolean_with_context, HashMapContext, Value};

use crate::error::RuleError;
use crate::position::{NormalizedPosition, SensorValue};

fn sensor_to_eval_value(value: &SensorValue) -> Value {
    match value {
        SensorValue::Bool(b) => Value::Boolean(*b),
        SensorValue::Int(i) => Value::Int(*i),
        SensorValue::Float(f) => Value::Float(*f),
        SensorValue::Text(s) => Value::String(s.clone()),
    }
}

/// Builds the evaluation context a rule sees for a given position.
///
/// Top-level fields (`speed`, `latitude`, `longitude`, `altitude`,
/// `course`, `ignition`, `satellites`, `hdop`) are bound directly; sensor
/// values are bound dotted under `sensors.<name>` since they're an open
/// set the rule author names explicitly.
pub fn build_context(position: &NormalizedPosition) -> Result<HashMapContext, RuleError> {
    let mut context = context_map! {
        "latitude" => Value::Float(position.latitude),
        "longitude" => Value::Float(position.longitude),
        "valid_fix" => Value::Boolean(position.valid_fix),
    }
    .map_err(|e| RuleError::Eval(e.to_string()))?;

    if let Some(speed) = position.speed {
        context
            .set_value("speed".into(), Value::Float(speed))
            .map_err(|e| RuleError::Eval(e.to_string()))?;
    }
    if let Some(altitude) = position.altitude {
        context
            .set_value("altitude".into(), Value::Float(altitude))
            .map_err(|e| RuleError::Eval(e.to_string()))?;
    }
    if let Some(course) = position.course {
        context
            .set_value("course".into(), Value::Float(course))
            .map_err(|e| RuleError::Eval(e.to_string()))?;
    }
    if let Some(ignition) = position.ignition {
        context
            .set_value("ignition".into(), Value::Boolean(ignition))
            .map_err(|e| RuleError::Eval(e.to_string()))?;
    }
    if let Some(satellites) = position.satellites {
        context
            .set_value("satellites".into(), Value::Int(satellites as i64))
            .map_err(|e| RuleError::Eval(e.to_string()))?;
    }
    if let Some(hdop) = position.hdop {
        context
            .set_value("hdop".into(), Value::Float(hdop))
            .map_err(|e| RuleError::Eval(e.to_string()))?;
    }
    for (name, value) in &position.sensors {
        context
            .set_value(format!("sensors.{name}"), sensor_to_eval_value(value))
            .map_err(|e| RuleError::Eval(e.to_string()))?;
    }

    Ok(context)
}

/// Evaluates a custom rule expression against a position. Returns whether
/// the rule's condition currently holds.
pub fn evaluate_rule(expression: &str, position: &NormalizedPosition) -> Result<bool, RuleError> {
    use evalexpr::ContextWithMutableVariables;
    let context = build_context(position)?;
    eval_boolean_with_context(expression, &context).map_err(|e| RuleError::Eval(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample_position() -> NormalizedPosition {
        NormalizedPosition {
            imei: "123456789012345".to_string(),
            device_time: Utc::now(),
            server_time: Utc::now(),
            latitude: 10.0,
            longitude: 20.0,
            altitude: Some(100.0),
            speed: Some(130.0),
            course: Some(90.0),
            satellites: Some(8),
            hdop: Some(1.2),
            ignition: Some(true),
            sensors: HashMap::new(),
            valid_fix: true,
            raw_data: None,
        }
    }

    #[test]
    fn simple_speed_rule_evaluates_true() {
        let position = sample_position();
        assert!(evaluate_rule("speed > 120", &position).unwrap());
    }

    #[test]
    fn sensor_field_is_reachable_dotted() {
        let mut position = sample_position();
        position
            .sensors
            .insert("fuel_level".to_string(), SensorValue::Float(5.0));
        assert!(evaluate_rule("sensors.fuel_level < 10", &position).unwrap());
    }

    #[test]
    fn compile_error_surfaces_as_rule_error() {
        let position = sample_position();
        assert!(evaluate_rule("speed >>> 5", &position).is_err());
    }
}
