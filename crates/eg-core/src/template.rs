use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::reading::Reading;

// ---------------------------------------------------------------------------
// Token templates: `{{.Field}}` with optional pipes
// ---------------------------------------------------------------------------

/// `{{.Field}}` / `{{.Field | pipe}}` / `{{.Field | printf "%.1f"}}`
fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*\.([A-Za-z0-9_.]+)(?:\s*\|\s*([a-z]+)(?:\s+"([^"]*)")?)?\s*\}\}"#)
            .expect("token regex is static")
    })
}

/// Expand a message/output-key template against one reading.
///
/// Field names follow the template convention: `DeviceID`, `Key`, `Value`,
/// `Type`, `Timestamp`, `Quality`, `Tags.<name>`; `extras` supplies
/// caller-specific variables (e.g. `Level` for alerts). Unknown fields
/// render empty. Pipes: `upper`, `lower`, `printf "%.1f"`.
pub fn expand(template: &str, reading: &Reading, extras: &HashMap<&str, String>) -> String {
    token_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let field = &caps[1];
            let raw = resolve(field, reading, extras);
            match caps.get(2).map(|m| m.as_str()) {
                None => raw,
                Some("upper") => raw.to_uppercase(),
                Some("lower") => raw.to_lowercase(),
                Some("printf") => printf_one(caps.get(3).map_or("%s", |m| m.as_str()), &raw),
                Some(_) => raw,
            }
        })
        .into_owned()
}

fn resolve(field: &str, reading: &Reading, extras: &HashMap<&str, String>) -> String {
    if let Some(v) = extras.get(field) {
        return v.clone();
    }
    match field {
        "DeviceID" => reading.device_id.clone(),
        "Key" => reading.key.clone(),
        "Type" => reading.value.type_name().to_string(),
        "Value" => reading
            .field("value")
            .map(|s| s.display_string())
            .unwrap_or_default(),
        "Timestamp" => reading.timestamp.to_rfc3339(),
        "Quality" => reading
            .quality
            .map(|q| q.to_string())
            .unwrap_or_default(),
        _ => {
            if let Some(tag) = field.strip_prefix("Tags.") {
                return reading.tags.get(tag).cloned().unwrap_or_default();
            }
            // Fall back to reading field paths (`value.x`, `quality`, …).
            reading
                .field(field)
                .map(|s| s.display_string())
                .unwrap_or_default()
        }
    }
}

/// Minimal printf: `%s`, `%d`, `%.Nf`. Anything else echoes the input.
fn printf_one(spec: &str, raw: &str) -> String {
    if spec == "%s" {
        return raw.to_string();
    }
    if spec == "%d" {
        return raw
            .parse::<f64>()
            .map(|n| format!("{}", n.trunc() as i64))
            .unwrap_or_else(|_| raw.to_string());
    }
    if let Some(digits) = spec
        .strip_prefix("%.")
        .and_then(|rest| rest.strip_suffix('f'))
        && let Ok(precision) = digits.parse::<usize>()
    {
        return raw
            .parse::<f64>()
            .map(|n| format!("{n:.precision$}"))
            .unwrap_or_else(|_| raw.to_string());
    }
    raw.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Value;

    fn reading() -> Reading {
        let mut r = Reading::new("d1", "temperature", Value::Float(35.25));
        r.tags.insert("site".into(), "north".into());
        r
    }

    #[test]
    fn substitutes_reading_fields() {
        let out = expand(
            "{{.Key}} on {{.DeviceID}} = {{.Value}}",
            &reading(),
            &HashMap::new(),
        );
        assert_eq!(out, "temperature on d1 = 35.25");
    }

    #[test]
    fn extras_take_precedence() {
        let extras = HashMap::from([("Level", "warning".to_string())]);
        let out = expand("[{{.Level | upper}}] {{.Key}}", &reading(), &extras);
        assert_eq!(out, "[WARNING] temperature");
    }

    #[test]
    fn printf_pipe_formats_numbers() {
        let out = expand(
            "{{.Value | printf \"%.1f\"}}",
            &reading(),
            &HashMap::new(),
        );
        assert_eq!(out, "35.2");
    }

    #[test]
    fn tags_and_unknowns() {
        let out = expand("{{.Tags.site}}/{{.Tags.absent}}", &reading(), &HashMap::new());
        assert_eq!(out, "north/");
    }

    #[test]
    fn output_key_template() {
        let out = expand("{{.Key}}_stats", &reading(), &HashMap::new());
        assert_eq!(out, "temperature_stats");
    }
}
