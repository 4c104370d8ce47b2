//! Credential generation for managed databases

use secrecy::SecretString;

use crate::database::engine::GeneratedCredentials;
use crate::models::database::DbEngine;
use crate::utils::random_alphanumeric;

const USERNAME_SUFFIX_LEN: usize = 11;
const PASSWORD_LEN: usize = 24;

/// Fresh credentials from the OS CSPRNG. Nothing is derived from user input
/// except the database name, which is sanitized.
pub fn generate(engine: DbEngine, name: &str) -> GeneratedCredentials {
    // engine users must start with a letter
    let username = format!(
        "u{}",
        random_alphanumeric(USERNAME_SUFFIX_LEN).to_lowercase()
    );
    let password = SecretString::from(random_alphanumeric(PASSWORD_LEN));
    GeneratedCredentials {
        username,
        password,
        database: database_name(engine, name),
    }
}

fn database_name(engine: DbEngine, name: &str) -> String {
    if engine == DbEngine::Redis {
        return "0".to_string();
    }
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let sanitized = sanitized.trim_matches('_');
    if sanitized.is_empty() || sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        format!("db_{}", sanitized)
    } else {
        sanitized.to_string()
    }
}
