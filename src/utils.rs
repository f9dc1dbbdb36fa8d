// ABOUTME: Utility functions for identifier safety, retries and log hygiene
// ABOUTME: Provides identifier validation/quoting, backoff retry and URL redaction

use anyhow::{bail, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Validate a PostgreSQL identifier (schema, table, column)
///
/// Identifiers that reach SQL text come only from configuration, and this is the
/// allow-list they have to pass:
/// - 1 to 63 characters
/// - first character is an ASCII letter or underscore
/// - remaining characters are ASCII letters, digits or underscores
///
/// # Examples
///
/// ```
/// # use table_replicator::utils::validate_postgres_identifier;
/// assert!(validate_postgres_identifier("customer_withdrawal").is_ok());
/// assert!(validate_postgres_identifier("_private").is_ok());
///
/// assert!(validate_postgres_identifier("123table").is_err());
/// assert!(validate_postgres_identifier("my-table").is_err());
/// assert!(validate_postgres_identifier("t\"; DROP TABLE users; --").is_err());
/// ```
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    // PostgreSQL truncates identifiers beyond NAMEDATALEN - 1
    if identifier.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(identifier),
            identifier.len()
        );
    }

    let mut chars = identifier.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(identifier),
                first
            );
        }
    }

    for (i, c) in identifier.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(identifier),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Sanitize an identifier for display
///
/// Removes control characters and limits length so identifiers can be put in
/// log lines and error messages safely. Not a SQL escaping function.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier (schema, table, column)
///
/// Escapes embedded double quotes and wraps the identifier in double quotes.
/// Column names read from the source catalog go through here too, so this must
/// stay correct for arbitrary input.
///
/// ```
/// # use table_replicator::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a schema-qualified table name: `"schema"."table"`.
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Retry an async operation with exponential backoff
///
/// Runs `operation`; when it fails and `should_retry` accepts the error, waits
/// and tries again, doubling the delay each time. Errors rejected by
/// `should_retry` are returned immediately. Cancelling `cancel` cuts a pending
/// backoff sleep short and returns the last error.
///
/// # Arguments
///
/// * `operation` - Async function to retry
/// * `max_retries` - Maximum number of retry attempts (0 = just the initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
/// * `should_retry` - Classifies an error as worth retrying
/// * `cancel` - Stops waiting for the next attempt once cancelled
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use table_replicator::utils::retry_with_backoff;
/// # use tokio_util::sync::CancellationToken;
/// # async fn example() -> anyhow::Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok::<_, anyhow::Error>("success") },
///     3,
///     Duration::from_secs(1),
///     |_| true,
///     &CancellationToken::new(),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
    should_retry: P,
    cancel: &CancellationToken,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= max_retries || !should_retry(&e) {
                    return Err(e);
                }
                attempt += 1;
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Retry abandoned: shutdown requested");
                        return Err(e);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay *= 2;
            }
        }
    }
}

/// Replace the password in a connection string with `***` for logging
///
/// Handles both URL and key/value (`host=... password=...`) forms. A URL-shaped
/// string that fails to parse is not echoed back at all.
pub fn redact_url(url: &str) -> String {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return match url::Url::parse(url) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            }
            Err(_) => "<unparseable connection URL>".to_string(),
        };
    }

    url.split_whitespace()
        .map(|part| {
            if part.starts_with("password=") {
                "password=***"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
