use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("value is too short (min {min}, got {got})")]
    TooShort { min: usize, got: usize },
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("invalid characters")]
    InvalidCharacters,
    #[error("invalid format")]
    InvalidFormat,
}

/// Localpart of a federated handle. Colons are reserved as the domain separator.
pub fn validate_username(name: &str) -> Result<(), ValidationError> {
    let len = name.len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 64 {
        return Err(ValidationError::TooLong { max: 64, got: len });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '='))
    {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Server domain, optionally with a `:port` suffix.
pub fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    let len = domain.len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 255 {
        return Err(ValidationError::TooLong { max: 255, got: len });
    }
    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain, None),
    };
    if host.is_empty() || host.starts_with('.') || host.ends_with('.') {
        return Err(ValidationError::InvalidFormat);
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'))
    {
        return Err(ValidationError::InvalidCharacters);
    }
    if let Some(port) = port {
        if port.parse::<u16>().is_err() {
            return Err(ValidationError::InvalidFormat);
        }
    }
    Ok(())
}

pub fn validate_room_name(name: &str) -> Result<(), ValidationError> {
    let len = name.trim().len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 100 {
        return Err(ValidationError::TooLong { max: 100, got: len });
    }
    if name.chars().any(char::is_control) {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.len() > 1024 {
        return Err(ValidationError::TooLong {
            max: 1024,
            got: topic.len(),
        });
    }
    Ok(())
}
