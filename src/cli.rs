//! Interface de linha de comando do quillflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, validate)
//! e flags globais (--max-retries, --verbose).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// quillflow: orquestrador de workflows multiagente para conteúdo.
#[derive(Debug, Parser)]
#[command(name = "quillflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Número máximo de retentativas após rate limit.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um workflow até um estado terminal.
    Run {
        /// Arquivo TOML do workflow. Usa `workflow_path` da configuração se omitido.
        #[arg(long, short)]
        workflow: Option<PathBuf>,

        /// Identificador da execução. Gerado se omitido.
        #[arg(long)]
        run_id: Option<String>,

        /// Estado inicial, no lugar do estado `initial` do workflow.
        #[arg(long)]
        start: Option<String>,
    },

    /// Valida um workflow sem executá-lo.
    Validate {
        /// Arquivo TOML do workflow.
        #[arg(long, short)]
        workflow: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "quillflow",
            "run",
            "--workflow",
            "workflows/story.toml",
            "--run-id",
            "r-42",
        ]);
        match cli.command {
            Command::Run {
                workflow,
                run_id,
                start,
            } => {
                assert_eq!(workflow, Some(PathBuf::from("workflows/story.toml")));
                assert_eq!(run_id.as_deref(), Some("r-42"));
                assert!(start.is_none());
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "quillflow",
            "--max-retries",
            "5",
            "--verbose",
            "validate",
            "-w",
            "flow.toml",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.max_retries, Some(5));
        assert!(matches!(cli.command, Command::Validate { workflow: Some(_) }));
    }

    #[test]
    fn cli_parses_start_override() {
        let cli = Cli::parse_from(["quillflow", "run", "--start", "revise"]);
        match cli.command {
            Command::Run { start, workflow, .. } => {
                assert_eq!(start.as_deref(), Some("revise"));
                assert!(workflow.is_none());
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
