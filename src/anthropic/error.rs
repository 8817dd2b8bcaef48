//! Tipos de erro para o cliente HTTP da API Anthropic.
//!
//! [`AnthropicError::RateLimited`] é o único erro que o
//! [`ApiAgent`](crate::agents::ApiAgent) retenta com backoff exponencial;
//! os demais viram falhas normais do agente.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (ou 529, sobrecarga).
    /// `retry_after_ms` vem do cabeçalho `retry-after`, quando presente.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Qualquer outro erro HTTP (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AnthropicError::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = AnthropicError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn api_error_is_not_rate_limited() {
        let err = AnthropicError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
        assert!(!err.is_rate_limited());
    }
}
