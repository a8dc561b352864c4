use thiserror::Error;

/// A single provider leg failing is never fatal; callers advance to the
/// next leg in the chain and only surface `RouterExhausted` when every
/// leg has been tried.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: http {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider}: request failed: {source}")]
    Network {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider}: timed out after {seconds}s")]
    Timeout {
        provider: &'static str,
        seconds: u64,
    },

    #[error("{provider}: unparseable response: {detail}")]
    Parse {
        provider: &'static str,
        detail: String,
    },

    #[error("{provider}: cli exited with status {code}: {stderr}")]
    CliExit {
        provider: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("{provider}: io: {source}")]
    Io {
        provider: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{provider}: empty response")]
    Empty { provider: &'static str },
}

impl ProviderError {
    pub fn provider(&self) -> &'static str {
        match self {
            Self::Http { provider, .. }
            | Self::Network { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Parse { provider, .. }
            | Self::CliExit { provider, .. }
            | Self::Io { provider, .. }
            | Self::Empty { provider } => provider,
        }
    }

    /// Compact single-line form used when chaining leg failures.
    pub fn compact(&self) -> String {
        let full = self.to_string();
        let line = full.replace('\n', " ");
        if line.chars().count() > 200 {
            let mut cut: String = line.chars().take(200).collect();
            cut.push('…');
            cut
        } else {
            line
        }
    }
}

/// Every provider in an ordered chain failed.
#[derive(Debug, Error)]
#[error("all providers failed: {joined}")]
pub struct RouterExhausted {
    pub joined: String,
}

impl RouterExhausted {
    pub fn from_errors(errors: &[ProviderError]) -> Self {
        Self {
            joined: errors
                .iter()
                .map(ProviderError::compact)
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }
}

/// Rejection of a client-originated mutation. Maps to HTTP 4xx or a
/// `room:error` frame; never tears down the socket.
#[derive(Debug, Error)]
pub enum ClientMessageError {
    #[error("Handshake required: send client:ack before other messages.")]
    HandshakeRequired,

    #[error("Invalid websocket message payload.")]
    InvalidPayload,

    #[error("{0}")]
    Invalid(String),

    #[error("unknown {kind}: {id}")]
    UnknownTarget { kind: &'static str, id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_is_single_line_and_bounded() {
        let err = ProviderError::Http {
            provider: "openai",
            status: 500,
            body: "a\nb\n".to_string() + &"x".repeat(500),
        };
        let compact = err.compact();
        assert!(!compact.contains('\n'));
        assert!(compact.len() <= 210);
    }

    #[test]
    fn exhausted_joins_with_pipes() {
        let errors = vec![
            ProviderError::Empty { provider: "openai" },
            ProviderError::Timeout {
                provider: "codex_cli",
                seconds: 45,
            },
        ];
        let joined = RouterExhausted::from_errors(&errors).joined;
        assert_eq!(
            joined,
            "openai: empty response | codex_cli: timed out after 45s"
        );
    }
}
