//! Configuração do orquestrador carregada a partir de `photo-jobs.toml`.
//!
//! A struct [`OrchestratorConfig`] descreve como o worker de edição é
//! invocado e quantos jobs de um lote podem rodar ao mesmo tempo.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis `PHOTO_JOBS_WORKER` e `PHOTO_JOBS_MAX_CONCURRENT` têm
//! precedência sobre o arquivo.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::OrchestratorError;

/// Nome do arquivo procurado no diretório atual quando nenhum caminho é dado.
pub const DEFAULT_CONFIG_FILE: &str = "photo-jobs.toml";

/// Configuração de nível superior carregada de `photo-jobs.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Executável do worker (ex.: o Python embutido).
    #[serde(default = "default_worker_command")]
    pub worker_command: String,

    /// Argumentos colocados antes do modo (ex.: o script da CLI).
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,

    /// Modo passado ao worker quando o chamador não escolhe um.
    #[serde(default = "default_mode")]
    pub default_mode: String,

    /// Diretório de trabalho do processo filho.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Diretórios inseridos no início do `PATH` do worker.
    #[serde(default)]
    pub path_prepend: Vec<PathBuf>,

    /// Variáveis de ambiente extras para o worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Diretório de saída fixo; sem ele, usa `<pasta da entrada>/edited`.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Máximo de workers vivos por lote.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Tempo máximo de um job antes do watchdog encerrá-lo.
    #[serde(default)]
    pub max_job_duration_secs: Option<u64>,
}

// Valor padrão do executável: "python3".
fn default_worker_command() -> String {
    "python3".to_string()
}

// Valor padrão dos argumentos: o script da CLI do worker.
fn default_worker_args() -> Vec<String> {
    vec!["src/cli_enhanced.py".to_string()]
}

// Valor padrão do modo: o subcomando "process".
fn default_mode() -> String {
    "process".to_string()
}

// Valor padrão de concorrência: 3.
fn default_max_concurrent() -> usize {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_command: default_worker_command(),
            worker_args: default_worker_args(),
            default_mode: default_mode(),
            working_dir: None,
            path_prepend: Vec::new(),
            env: BTreeMap::new(),
            output_dir: None,
            max_concurrent: default_max_concurrent(),
            max_job_duration_secs: None,
        }
    }
}

impl OrchestratorConfig {
    /// Carrega a configuração do caminho dado, ou de `photo-jobs.toml` no
    /// diretório atual. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self, OrchestratorError> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<OrchestratorConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(worker) = lookup("PHOTO_JOBS_WORKER")
            && !worker.is_empty()
        {
            self.worker_command = worker;
        }

        if let Some(raw) = lookup("PHOTO_JOBS_MAX_CONCURRENT") {
            match raw.parse::<usize>() {
                Ok(n) => self.max_concurrent = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid PHOTO_JOBS_MAX_CONCURRENT"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.worker_command.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "worker_command must not be empty".into(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.max_job_duration_secs == Some(0) {
            return Err(OrchestratorError::Config(
                "max_job_duration_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.worker_command, "python3");
        assert_eq!(config.worker_args, vec!["src/cli_enhanced.py"]);
        assert_eq!(config.default_mode, "process");
        assert_eq!(config.max_concurrent, 3);
        assert!(config.max_job_duration_secs.is_none());
        assert!(config.path_prepend.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            worker_command = "/opt/editor/python/bin/python3"
            max_concurrent = 5
            path_prepend = ["/opt/editor/python/bin"]

            [env]
            PYTHONUNBUFFERED = "1"
        "#;
        let config: OrchestratorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_command, "/opt/editor/python/bin/python3");
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.path_prepend, vec![PathBuf::from("/opt/editor/python/bin")]);
        assert_eq!(config.env["PYTHONUNBUFFERED"], "1");
        assert_eq!(config.default_mode, "process");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = OrchestratorConfig::default();
        config.apply_env_overrides(|key| match key {
            "PHOTO_JOBS_WORKER" => Some("/usr/bin/python3.12".into()),
            "PHOTO_JOBS_MAX_CONCURRENT" => Some("8".into()),
            _ => None,
        });
        assert_eq!(config.worker_command, "/usr/bin/python3.12");
        assert_eq!(config.max_concurrent, 8);
    }

    #[test]
    fn invalid_env_concurrency_is_ignored() {
        let mut config = OrchestratorConfig::default();
        config.apply_env_overrides(|key| {
            (key == "PHOTO_JOBS_MAX_CONCURRENT").then(|| "lots".to_string())
        });
        assert_eq!(config.max_concurrent, 3);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = OrchestratorConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "default_mode = \"batch\"\nmax_job_duration_secs = 600\n").unwrap();

        let config = OrchestratorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.default_mode, "batch");
        assert_eq!(config.max_job_duration_secs, Some(600));
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.default_mode, "process");
    }
}
