//! # E-meter Core
//!
//! Crate compartilhada que define o protocolo das tomadas inteligentes
//! (frame com prefixo de tamanho + cifra XOR), os tipos de dados e a
//! configuração TOML do coletor.
//!
//! ## Módulos
//! - [`protocol`] – Encode/decode de frames e parse da resposta `get_realtime`
//! - [`types`] – Alvos configurados e leituras de energia
//! - [`config`] – Configuração unificada via TOML

pub mod types;
pub mod protocol;
pub mod config;

// Re-exports convenientes
pub use types::{Reading, Target, parse_targets};
pub use protocol::{REALTIME_QUERY, decode, encode};
pub use config::{AppConfig, ConfigError, InfluxConfig, PollerConfig};
