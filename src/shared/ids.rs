pub fn validate_tool_name(value: &str) -> Result<(), String> {
    validate_identifier_value("tool name", value)?;
    if value.starts_with(|ch: char| ch.is_ascii_digit()) {
        return Err("tool name must not start with a digit".to_string());
    }
    Ok(())
}

pub fn validate_domain_name(value: &str) -> Result<(), String> {
    validate_identifier_value("domain", value)
}

fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Ok(());
    }
    Err(format!("{kind} must use only ASCII letters, digits or '_'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_must_be_plain_identifiers() {
        assert!(validate_tool_name("get_phone_number").is_ok());
        assert!(validate_tool_name("send_sms2").is_ok());
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name("send-sms").is_err());
        assert!(validate_tool_name("2fa").is_err());
        assert!(validate_tool_name("open app").is_err());
    }

    #[test]
    fn domains_allow_leading_digits() {
        assert!(validate_domain_name("mail").is_ok());
        assert!(validate_domain_name("3d_printing").is_ok());
        assert!(validate_domain_name("mail.app").is_err());
    }
}
