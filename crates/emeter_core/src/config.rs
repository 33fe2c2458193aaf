//! Configuração unificada via TOML.
//!
//! Flags de linha de comando e variáveis de ambiente sobrescrevem o arquivo
//! (ver o binário `emeter_collector`).

use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::types::parse_targets;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Erros ao carregar um arquivo de configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro ao ler {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Erro ao parsear {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Temporização e limites dos workers de polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Timeout do dial TCP (segundos)
    pub connect_timeout_secs: f64,
    /// Espera após falha de conexão (segundos)
    pub reconnect_delay_secs: f64,
    /// Espera após erro de escrita/leitura/parse (segundos)
    pub failure_delay_secs: f64,
    /// Intervalo entre consultas na mesma conexão (segundos)
    pub poll_interval_secs: f64,
    /// Tamanho máximo aceito para um frame de resposta (bytes)
    pub max_frame_len: usize,
    /// Deadline de cada leitura/escrita no socket (segundos, 0 = sem deadline).
    /// Sem ela, um prefixo de tamanho maior que o payload prende o worker.
    pub io_timeout_secs: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5.0,
            reconnect_delay_secs: 2.0,
            failure_delay_secs: 10.0,
            poll_interval_secs: 1.0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            io_timeout_secs: 10.0,
        }
    }
}

impl PollerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay_secs)
    }

    pub fn failure_delay(&self) -> Duration {
        Duration::from_secs_f64(self.failure_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    /// `None` quando desabilitado.
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_secs > 0.0).then(|| Duration::from_secs_f64(self.io_timeout_secs))
    }
}

/// Conexão com o InfluxDB (API v2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    /// URL base, ex: "http://localhost:8086"
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// Token de acesso ao bucket
    pub token: String,
    /// Pontos acumulados antes de um envio
    pub batch_size: usize,
    /// Envio forçado após este tempo ocioso (segundos)
    pub flush_interval_secs: f64,
    /// Limite de pontos retidos quando o servidor está fora
    pub max_buffered_points: usize,
    /// Timeout de cada requisição HTTP (segundos)
    pub request_timeout_secs: f64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
            batch_size: 50,
            flush_interval_secs: 1.0,
            max_buffered_points: 10_000,
            request_timeout_secs: 10.0,
        }
    }
}

impl InfluxConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }
}

/// Configuração raiz do coletor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Lista `nome:host:porta` separada por vírgulas
    pub targets: String,
    pub poller: PollerConfig,
    pub influx: InfluxConfig,
}

impl AppConfig {
    /// Lê e interpreta um arquivo TOML. Arquivo ausente é erro.
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Carrega o arquivo se existir; caso contrário usa os padrões.
    ///
    /// Com os padrões, alvos e InfluxDB precisam vir das flags ou do ambiente.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(
                "{} não encontrado, usando padrões (alvos via --target-urls/TARGETS)",
                path.display()
            );
            return AppConfig::default();
        }

        match Self::try_load(path) {
            Ok(config) => {
                let targets = parse_targets(&config.targets).map(|t| t.len()).unwrap_or(0);
                info!("Configuração carregada de {} ({targets} alvos)", path.display());
                config
            }
            Err(e) => {
                warn!("{e}. Usando padrões (alvos via --target-urls/TARGETS)");
                AppConfig::default()
            }
        }
    }

    /// Caminho padrão: `emeter.toml` ao lado do executável.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("emeter.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match parse_targets(&self.targets) {
            Ok(targets) if targets.is_empty() => errors.push("Nenhum alvo configurado".into()),
            Ok(_) => {}
            Err(e) => errors.push(e.to_string()),
        }

        let p = &self.poller;
        for (label, value) in [
            ("connect_timeout_secs", p.connect_timeout_secs),
            ("poll_interval_secs", p.poll_interval_secs),
        ] {
            if !(value > 0.0 && value <= 3600.0) {
                errors.push(format!("{label} inválido: {value} (>0–3600)"));
            }
        }
        for (label, value) in [
            ("reconnect_delay_secs", p.reconnect_delay_secs),
            ("failure_delay_secs", p.failure_delay_secs),
            ("io_timeout_secs", p.io_timeout_secs),
        ] {
            if !(0.0..=3600.0).contains(&value) {
                errors.push(format!("{label} inválido: {value} (0–3600)"));
            }
        }
        if p.max_frame_len == 0 {
            errors.push("max_frame_len não pode ser 0".into());
        }

        let i = &self.influx;
        if i.url.is_empty() {
            errors.push("URL do InfluxDB não configurada".into());
        }
        if i.org.is_empty() {
            errors.push("Organização do InfluxDB não configurada".into());
        }
        if i.bucket.is_empty() {
            errors.push("Bucket do InfluxDB não configurado".into());
        }
        if i.batch_size == 0 {
            errors.push("batch_size não pode ser 0".into());
        }
        if i.max_buffered_points < i.batch_size {
            errors.push(format!(
                "max_buffered_points ({}) menor que batch_size ({})",
                i.max_buffered_points, i.batch_size
            ));
        }
        if !(i.flush_interval_secs > 0.0 && i.flush_interval_secs <= 3600.0) {
            errors.push(format!(
                "flush_interval_secs inválido: {} (>0–3600)",
                i.flush_interval_secs
            ));
        }
        if !(i.request_timeout_secs > 0.0 && i.request_timeout_secs <= 3600.0) {
            errors.push(format!(
                "request_timeout_secs inválido: {} (>0–3600)",
                i.request_timeout_secs
            ));
        }

        errors
    }
}
