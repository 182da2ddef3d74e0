use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Title every schema is given so the UI renders a uniform header.
const SCHEMA_TITLE: &str = "edt_dev_spec_header_title";

/// Schema bundle compiled into the binary, one entry per device type.
const SCHEMAS: &[(&str, &str)] = &[
    ("file", include_str!("../../schemas/schema-file.json")),
    ("udpraw", include_str!("../../schemas/schema-udpraw.json")),
];

/// JSON schemas of all built-in device types, keyed by type name.
pub fn led_device_schemas() -> Result<Map<String, Value>> {
    SCHEMAS
        .iter()
        .map(|(name, raw)| Ok((name.to_string(), parse_schema(name, raw)?)))
        .collect()
}

fn parse_schema(name: &str, raw: &str) -> Result<Value> {
    let mut schema: Value = serde_json::from_str(raw)
        .with_context(|| format!("JSON schema wrong of file: schema-{}.json", name))?;
    let object = schema
        .as_object_mut()
        .with_context(|| format!("JSON schema is not an object: schema-{}.json", name))?;
    object.insert("title".to_string(), Value::from(SCHEMA_TITLE));
    Ok(schema)
}
