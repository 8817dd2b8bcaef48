//! Configuração do quillflow carregada a partir de `quillflow.toml`.
//!
//! A struct [`AppConfig`] contém os parâmetros do processo: credenciais,
//! diretórios e as políticas padrão de retentativa e aprovação.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::{AgentEnv, RetryPolicy};

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "quillflow.toml";

/// Configuração de nível superior carregada de `quillflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Chave da API Anthropic. Vazia desabilita agentes `anthropic`.
    #[serde(default)]
    pub api_key: String,

    /// Workflow usado quando `--workflow` não é informado.
    #[serde(default)]
    pub workflow_path: Option<PathBuf>,

    /// Diretório com os arquivos `<persona>.md`.
    #[serde(default = "default_personas_dir")]
    pub personas_dir: PathBuf,

    /// Raiz onde cada execução grava `<run_id>/outputs.jsonl`.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Onde as sessões dos agentes são persistidas.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Tempo máximo de espera por uma decisão humana, em segundos.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    /// Nota mínima de auditoria para pular uma quebra suave automaticamente.
    #[serde(default = "default_auto_skip_score")]
    pub auto_skip_score: u8,

    /// Máximo de retentativas após rate limit.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_personas_dir() -> PathBuf {
    PathBuf::from("personas")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".quillflow/runs")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from(".quillflow/sessions")
}

// Uma hora.
fn default_approval_timeout_secs() -> u64 {
    3600
}

fn default_auto_skip_score() -> u8 {
    8
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            workflow_path: None,
            personas_dir: default_personas_dir(),
            output_dir: default_output_dir(),
            sessions_dir: default_sessions_dir(),
            approval_timeout_secs: default_approval_timeout_secs(),
            auto_skip_score: default_auto_skip_score(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl AppConfig {
    /// Carrega a configuração de `quillflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Igual a [`AppConfig::load`], com caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("lendo {}", path.display()))?;
            toml::from_str::<AppConfig>(&contents)
                .with_context(|| format!("interpretando {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                config.api_key = key;
            }
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    /// Ambiente compartilhado pelas fábricas de agentes.
    pub fn agent_env(&self) -> AgentEnv {
        AgentEnv {
            api_key: Some(self.api_key.clone()).filter(|k| !k.is_empty()),
            sessions_dir: self.sessions_dir.clone(),
            retry: self.retry_policy(),
        }
    }
}
