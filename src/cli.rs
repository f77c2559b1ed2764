//! Interface de linha de comando do photo-jobs baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (process, batch)
//! e flags globais (--config, --worker, --verbose, --json).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// photo-jobs: orquestrador de edição de fotos com IA.
#[derive(Debug, Parser)]
#[command(name = "photo-jobs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração TOML.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Executável do worker, sobrescrevendo a configuração.
    #[arg(long, global = true)]
    pub worker: Option<String>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite os eventos como linhas JSON em vez de spinners.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Edita uma única imagem.
    Process {
        /// Caminho da imagem de entrada.
        image: PathBuf,

        /// Instruções de edição em linguagem natural.
        #[arg(long, short)]
        instructions: Option<String>,

        /// Modo do worker (padrão da configuração).
        #[arg(long)]
        mode: Option<String>,
    },

    /// Edita todas as imagens suportadas de um diretório.
    Batch {
        /// Diretório com as imagens (sem recursão).
        dir: PathBuf,

        /// Instruções aplicadas a todas as imagens do lote.
        #[arg(long, short)]
        instructions: Option<String>,

        /// Modo do worker (padrão da configuração).
        #[arg(long)]
        mode: Option<String>,

        /// Máximo de workers simultâneos neste lote.
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}
