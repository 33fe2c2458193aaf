//! Definição de tipos: alvos configurados e leituras de energia.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::SystemTime;

// ──────────────────────────────────────────────
// Target
// ──────────────────────────────────────────────

/// Erros ao interpretar a lista de alvos.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Alvo sem separador ':' em \"{0}\" (esperado nome:host:porta)")]
    MissingSeparator(String),

    #[error("Alvo sem nome em \"{0}\"")]
    EmptyName(String),

    #[error("Alvo \"{0}\" sem endereço")]
    EmptyAddress(String),

    #[error("Nome de alvo duplicado: \"{0}\"")]
    DuplicateName(String),
}

/// Dispositivo configurado: nome (usado como tag) e endereço `host:porta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub address: String,
}

impl Target {
    /// Interpreta `nome:host:porta`, separando no primeiro `:`.
    pub fn parse(entry: &str) -> Result<Self, TargetError> {
        let entry = entry.trim();
        let (name, address) = entry
            .split_once(':')
            .ok_or_else(|| TargetError::MissingSeparator(entry.to_string()))?;

        if name.is_empty() {
            return Err(TargetError::EmptyName(entry.to_string()));
        }
        if address.is_empty() {
            return Err(TargetError::EmptyAddress(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            address: address.to_string(),
        })
    }
}

/// Interpreta a lista `nome1:host1:porta1,nome2:host2:porta2,...`.
///
/// Entradas vazias (vírgulas sobrando) são ignoradas.
pub fn parse_targets(list: &str) -> Result<Vec<Target>, TargetError> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let target = Target::parse(entry)?;
        if !seen.insert(target.name.clone()) {
            return Err(TargetError::DuplicateName(target.name));
        }
        targets.push(target);
    }

    Ok(targets)
}

// ──────────────────────────────────────────────
// Leituras
// ──────────────────────────────────────────────

/// Bloco `get_realtime` retornado pelo dispositivo.
///
/// Campos ausentes valem zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RealtimeStats {
    /// Tensão (mV)
    pub voltage_mv: i64,
    /// Corrente (mA)
    pub current_ma: i64,
    /// Potência ativa (mW)
    pub power_mw: i64,
    /// Energia acumulada (Wh)
    pub total_wh: i64,
    /// Status reportado pelo dispositivo (0 = ok)
    pub err_code: i64,
}

/// Uma amostra decodificada, marcada com o nome do alvo e o instante da captura.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub name: String,
    pub voltage_mv: i64,
    pub current_ma: i64,
    pub power_mw: i64,
    pub total_wh: i64,
    pub error_code: i64,
    /// Instante em que a resposta foi interpretada (não vem do dispositivo)
    pub timestamp: SystemTime,
}

impl Reading {
    pub fn from_stats(name: &str, stats: RealtimeStats, timestamp: SystemTime) -> Self {
        Self {
            name: name.to_string(),
            voltage_mv: stats.voltage_mv,
            current_ma: stats.current_ma,
            power_mw: stats.power_mw,
            total_wh: stats.total_wh,
            error_code: stats.err_code,
            timestamp,
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_splits_on_first_colon() {
        let t = Target::parse("Socket1:192.168.0.100:9999").unwrap();
        assert_eq!(t.name, "Socket1");
        assert_eq!(t.address, "192.168.0.100:9999");
    }

    #[test]
    fn target_keeps_ipv6_address_intact() {
        let t = Target::parse("lab:[::1]:9999").unwrap();
        assert_eq!(t.name, "lab");
        assert_eq!(t.address, "[::1]:9999");
    }

    #[test]
    fn target_errors() {
        assert_eq!(
            Target::parse("semseparador"),
            Err(TargetError::MissingSeparator("semseparador".into()))
        );
        assert!(matches!(Target::parse(":host:9999"), Err(TargetError::EmptyName(_))));
        assert_eq!(Target::parse("tv:"), Err(TargetError::EmptyAddress("tv".into())));
    }

    #[test]
    fn target_list_parsing() {
        let targets = parse_targets(" tv:10.0.0.2:9999, geladeira:10.0.0.3:9999 ,").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "tv");
        assert_eq!(targets[1].name, "geladeira");
        assert_eq!(targets[1].address, "10.0.0.3:9999");
    }

    #[test]
    fn empty_target_list() {
        assert!(parse_targets("").unwrap().is_empty());
        assert!(parse_targets(" , ").unwrap().is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert_eq!(
            parse_targets("a:h1:1,a:h2:2"),
            Err(TargetError::DuplicateName("a".into()))
        );
    }

    #[test]
    fn reading_copies_stats() {
        let now = SystemTime::now();
        let stats = RealtimeStats {
            voltage_mv: 230000,
            current_ma: 500,
            power_mw: 115000,
            total_wh: 42,
            err_code: 3,
        };
        let r = Reading::from_stats("tv", stats, now);
        assert_eq!(r.name, "tv");
        assert_eq!(r.power_mw, 115000);
        assert_eq!(r.error_code, 3);
        assert_eq!(r.timestamp, now);
    }

    #[test]
    fn missing_stats_fields_default_to_zero() {
        let stats: RealtimeStats = serde_json::from_str(r#"{"power_mw":7}"#).unwrap();
        assert_eq!(stats.power_mw, 7);
        assert_eq!(stats.voltage_mv, 0);
        assert_eq!(stats.err_code, 0);
    }
}
