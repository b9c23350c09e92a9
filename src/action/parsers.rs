//! Device payload parsers, selected per thing by `properties.default_parser`.

use crate::error::Result;
use crate::storage::NewObservation;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;

pub type PayloadParser = fn(&JsonValue, &str) -> Result<Vec<NewObservation>>;

pub fn parser_for(name: &str) -> Option<PayloadParser> {
    match name {
        "campbell_cr6" => Some(campbell_cr6),
        _ => None,
    }
}

/// Campbell CR6 loggers publish a GeoJSON-like feature:
///
/// ```json
/// {
///   "type": "Feature",
///   "geometry": {"type": "Point", "coordinates": [null, null, null]},
///   "properties": {
///     "loggerID": "CR6_18341",
///     "observationNames": ["Batt_volt_Min", "PTemp"],
///     "observations": {"2022-05-24T08:53:00Z": [11.9, 26.91]}
///   }
/// }
/// ```
///
/// Every value becomes one observation; its index in `observationNames`
/// is the datastream position and the name is kept as header.
pub fn campbell_cr6(payload: &JsonValue, origin: &str) -> Result<Vec<NewObservation>> {
    let Some(properties) = payload.get("properties") else {
        return Ok(Vec::new());
    };

    let names = properties
        .get("observationNames")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| crate::err!("campbell_cr6 payload lacks `observationNames`"))?;
    let observations = properties
        .get("observations")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| crate::err!("campbell_cr6 payload lacks `observations`"))?;

    let mut out = Vec::new();
    for (timestamp, values) in observations {
        let timestamp = parse_timestamp(timestamp)?;
        let values = values.as_array().ok_or_else(|| {
            crate::err!("campbell_cr6 observations at {timestamp} must be a list")
        })?;

        for (position, (name, value)) in names.iter().zip(values).enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| crate::err!("observation position {position} out of range"))?;
            out.push(NewObservation {
                timestamp,
                value: value.clone(),
                position,
                header: name.as_str().unwrap_or_default().to_string(),
                origin: origin.to_string(),
            });
        }
    }
    Ok(out)
}

/// RFC 3339 timestamps, or naive ISO timestamps taken as UTC.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|_| crate::err!("invalid timestamp `{text}`"))
}
