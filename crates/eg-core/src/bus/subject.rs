// ---------------------------------------------------------------------------
// Subject grammar: dot-separated tokens, `*` matches one token, `>` matches
// one or more trailing tokens.
// ---------------------------------------------------------------------------

/// True when `subject` (a concrete, wildcard-free subject) matches `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) => {
                if p != s {
                    return false;
                }
            }
            (None, None) => return true,
            // `>` requires at least one remaining subject token.
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}

/// Validate a subscription pattern: non-empty tokens, `>` only terminal.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("empty subject pattern".into());
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(format!("empty token in pattern {pattern:?}"));
        }
        if *token == ">" && i != tokens.len() - 1 {
            return Err(format!("'>' must be the last token in {pattern:?}"));
        }
    }
    Ok(())
}

/// Validate a publish subject: non-empty tokens, no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), String> {
    if subject.is_empty() {
        return Err("empty subject".into());
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(format!("empty token in subject {subject:?}"));
        }
        if token == "*" || token == ">" {
            return Err(format!("wildcard in publish subject {subject:?}"));
        }
    }
    Ok(())
}

/// Replace token separators inside a single token (device ids and keys are
/// opaque and may contain dots).
pub fn sanitize_token(token: &str) -> String {
    token.replace(['.', ' '], "_")
}

/// `raw.<device>.<key>`
pub fn raw_subject(device_id: &str, key: &str) -> String {
    format!("raw.{}.{}", sanitize_token(device_id), sanitize_token(key))
}

/// `processed.<device>.<key>`
pub fn processed_subject(device_id: &str, key: &str) -> String {
    format!(
        "processed.{}.{}",
        sanitize_token(device_id),
        sanitize_token(key)
    )
}

/// `aggregated.<device>.<key>`
pub fn aggregated_subject(device_id: &str, key: &str) -> String {
    format!(
        "aggregated.{}.{}",
        sanitize_token(device_id),
        sanitize_token(key)
    )
}

/// `alerts.<level>.<device>`
pub fn alert_subject(level: &str, device_id: &str) -> String {
    format!("alerts.{level}.{}", sanitize_token(device_id))
}

/// `errors.<module>`
pub fn error_subject(module: &str) -> String {
    format!("errors.{}", sanitize_token(module))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(subject_matches("raw.d1.temp", "raw.d1.temp"));
        assert!(!subject_matches("raw.d1.temp", "raw.d1.rpm"));
        assert!(!subject_matches("raw.d1.temp", "raw.d1"));
        assert!(!subject_matches("raw.d1", "raw.d1.temp"));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(subject_matches("raw.*.temp", "raw.d1.temp"));
        assert!(subject_matches("raw.d1.*", "raw.d1.temp"));
        assert!(!subject_matches("raw.*", "raw.d1.temp"));
        assert!(!subject_matches("raw.*.temp", "raw.temp"));
    }

    #[test]
    fn gt_matches_one_or_more_trailing() {
        assert!(subject_matches("raw.>", "raw.d1"));
        assert!(subject_matches("raw.>", "raw.d1.temp"));
        assert!(subject_matches(">", "raw.d1.temp"));
        assert!(!subject_matches("raw.>", "raw"));
        assert!(!subject_matches("raw.>", "processed.d1.temp"));
    }

    #[test]
    fn pattern_validation() {
        assert!(validate_pattern("raw.*.temp").is_ok());
        assert!(validate_pattern("raw.>").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("raw..temp").is_err());
        assert!(validate_pattern("raw.>.temp").is_err());
    }

    #[test]
    fn subject_validation() {
        assert!(validate_subject("raw.d1.temp").is_ok());
        assert!(validate_subject("raw.*.temp").is_err());
        assert!(validate_subject("raw.>").is_err());
        assert!(validate_subject("raw..t").is_err());
    }

    #[test]
    fn dotted_device_ids_sanitize() {
        assert_eq!(raw_subject("plc.line.2", "rpm"), "raw.plc_line_2.rpm");
    }
}
