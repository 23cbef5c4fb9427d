use crate::error::StoreError;
use std::time::Duration;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// Connection-test timeout, 5 seconds by default per §5.
const TEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

pub type SqlClient = Client<Compat<TcpStream>>;

///
/// Open a fresh TDS connection. Every schema/loader/repository call opens and closes its own -
/// no connection pooling, per §5 ("connections are opened per bulk-copy batch and closed on
/// exit").
pub async fn connect(connection_string: &str) -> Result<SqlClient, StoreError> {
    let config = Config::from_ado_string(connection_string).map_err(|source| StoreError::Connect {
        connection_string: connection_string.to_string(),
        source,
    })?;

    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|source| StoreError::Connect { connection_string: connection_string.to_string(), source: source.into() })?;
    tcp.set_nodelay(true).map_err(|source| StoreError::Connect { connection_string: connection_string.to_string(), source: source.into() })?;

    Client::connect(config, tcp.compat_write())
        .await
        .map_err(|source| StoreError::Connect { connection_string: connection_string.to_string(), source })
}

///
/// Result of a `testConnection` call (§4.5, §6). Distinguishes the error classes callers are
/// spec'd to rely on rather than exposing raw driver errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestConnectionResult {
    Ok,
    HostUnresolved,
    NetworkUnreachable,
    AuthenticationFailed,
    DatabaseNotAccessible,
    ServerRefusedOrTimedOut,
    SslTrustMismatch,
    Other(String),
}

pub async fn test_connection(connection_string: &str) -> TestConnectionResult {
    match tokio::time::timeout(TEST_CONNECTION_TIMEOUT, connect(connection_string)).await {
        Ok(Ok(_client)) => TestConnectionResult::Ok,
        Ok(Err(err)) => classify(&err),
        Err(_elapsed) => TestConnectionResult::ServerRefusedOrTimedOut,
    }
}

///
/// Maps the §6 error-code table onto a `TestConnectionResult`. SQL Server token errors carry a
/// numeric code; driver-level connect failures are classified by the underlying `io::Error` kind.
fn classify(err: &StoreError) -> TestConnectionResult {
    let StoreError::Connect { source, .. } = err else {
        return TestConnectionResult::Other(err.to_string());
    };

    if let tiberius::error::Error::Server(token) = source {
        return classify_server_code(token.code(), token.message());
    }

    if let tiberius::error::Error::Io { kind, .. } = source {
        return match kind {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => TestConnectionResult::ServerRefusedOrTimedOut,
            std::io::ErrorKind::NotFound | std::io::ErrorKind::AddrNotAvailable => TestConnectionResult::HostUnresolved,
            _ => TestConnectionResult::NetworkUnreachable,
        };
    }

    let message = source.to_string();
    if is_ssl_mismatch(&message) {
        return TestConnectionResult::SslTrustMismatch;
    }

    TestConnectionResult::Other(message)
}

fn classify_server_code(code: u32, message: &str) -> TestConnectionResult {
    match code {
        2 => TestConnectionResult::HostUnresolved,
        53 => TestConnectionResult::NetworkUnreachable,
        18456 => TestConnectionResult::AuthenticationFailed,
        4060 => TestConnectionResult::DatabaseNotAccessible,
        233 | 10060 | 10061 => TestConnectionResult::ServerRefusedOrTimedOut,
        _ if is_ssl_mismatch(message) => TestConnectionResult::SslTrustMismatch,
        _ => TestConnectionResult::Other(format!("{} ({})", message, code)),
    }
}

fn is_ssl_mismatch(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("ssl") || lower.contains("certificate") || lower.contains("principal name") || message.contains("-2146893022")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_2_is_host_unresolved() {
        assert_eq!(TestConnectionResult::HostUnresolved, classify_server_code(2, "unknown host"));
    }

    #[test]
    fn test_code_18456_is_authentication_failed() {
        assert_eq!(TestConnectionResult::AuthenticationFailed, classify_server_code(18456, "login failed"));
    }

    #[test]
    fn test_code_4060_is_database_not_accessible() {
        assert_eq!(TestConnectionResult::DatabaseNotAccessible, classify_server_code(4060, "cannot open database"));
    }

    #[test]
    fn test_refusal_codes_are_server_refused_or_timed_out() {
        for code in [233, 10060, 10061] {
            assert_eq!(TestConnectionResult::ServerRefusedOrTimedOut, classify_server_code(code, "connect failed"));
        }
    }

    #[test]
    fn test_ssl_substring_is_trust_mismatch() {
        assert_eq!(TestConnectionResult::SslTrustMismatch, classify_server_code(9999, "certificate validation failed"));
    }

    #[test]
    fn test_unmapped_code_falls_back_to_other() {
        assert!(matches!(classify_server_code(99999, "weird"), TestConnectionResult::Other(_)));
    }
}
