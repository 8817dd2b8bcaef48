//! Tipos de dados para requisições e respostas da API Anthropic Messages.
//!
//! Usados pelo agente de invocação via API ([`ApiAgent`](crate::agents::ApiAgent)).
//! O histórico em memória do agente é convertido em [`Message`]s a cada chamada.

use serde::{Deserialize, Serialize};

/// Corpo da requisição para o endpoint `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Identificador do modelo (ex.: "claude-sonnet-4-5-20250929").
    pub model: String,
    /// Número máximo de tokens na resposta.
    pub max_tokens: u32,
    /// Prompt de sistema, enviado fora da lista de mensagens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Conversa completa (usuário e assistente), em ordem.
    pub messages: Vec<Message>,
}

/// Uma única mensagem em uma conversa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Papel do remetente: "user" ou "assistant".
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Resposta retornada pelo endpoint `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    /// Blocos de conteúdo na resposta (normalmente texto).
    pub content: Vec<ContentBlock>,
    pub model: String,
    /// Motivo da parada da geração (ex.: "end_turn", "max_tokens").
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatena todos os blocos de texto da resposta.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Um bloco de conteúdo. O campo `content_type` é serializado como `"type"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

/// Estatísticas de consumo de tokens para uma chamada.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}
