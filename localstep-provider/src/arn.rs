//! ARN construction and resource name rules.

use crate::error::ProviderError;

const PREFIX: &str = "arn:aws:states:";
const MAX_NAME_LEN: usize = 80;

pub fn state_machine_arn(region: &str, account_id: &str, name: &str) -> String {
    format!("{}{}:{}:stateMachine:{}", PREFIX, region, account_id, name)
}

pub fn execution_arn(region: &str, account_id: &str, machine: &str, execution: &str) -> String {
    format!(
        "{}{}:{}:execution:{}:{}",
        PREFIX, region, account_id, machine, execution
    )
}

/// Extracts the machine name from a state machine ARN.
pub fn state_machine_name(arn: &str) -> Result<&str, ProviderError> {
    let parts: Vec<&str> = arn.split(':').collect();
    match parts.as_slice() {
        ["arn", "aws", "states", _, _, "stateMachine", name] if !name.is_empty() => Ok(*name),
        _ => Err(ProviderError::InvalidArn(arn.to_string())),
    }
}

/// Checks a state machine or execution name.
///
/// Names are 1-80 characters without whitespace, wildcard, bracket or
/// ARN separator characters.
pub fn validate_name(name: &str) -> Result<(), ProviderError> {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ProviderError::InvalidName(format!(
            "'{}' must be between 1 and {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if let Some(c) = name.chars().find(|c| is_forbidden(*c)) {
        return Err(ProviderError::InvalidName(format!(
            "'{}' contains invalid character {:?}",
            name, c
        )));
    }
    Ok(())
}

fn is_forbidden(c: char) -> bool {
    c.is_whitespace()
        || c.is_control()
        || matches!(
            c,
            '<' | '>' | '{' | '}' | '[' | ']' | '?' | '*' | '"' | '#' | '%' | '\\' | '^'
                | '|' | '~' | '`' | '$' | '&' | ',' | ';' | ':' | '/'
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arn_formats() {
        assert_eq!(
            state_machine_arn("us-east-1", "000000000000", "orders"),
            "arn:aws:states:us-east-1:000000000000:stateMachine:orders"
        );
        assert_eq!(
            execution_arn("us-east-1", "000000000000", "orders", "run-1"),
            "arn:aws:states:us-east-1:000000000000:execution:orders:run-1"
        );
    }

    #[test]
    fn test_state_machine_name() {
        let arn = state_machine_arn("eu-west-1", "123456789012", "billing");
        assert_eq!(state_machine_name(&arn).unwrap(), "billing");
        assert!(state_machine_name("arn:aws:states:eu-west-1:1:execution:a:b").is_err());
        assert!(state_machine_name("billing").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("order-flow_v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("a:b").is_err());
        assert!(validate_name(&"x".repeat(81)).is_err());
        assert!(validate_name(&"x".repeat(80)).is_ok());
    }
}
