//! # E-meter Collector
//!
//! Consulta tomadas inteligentes com medição de energia via TCP e grava
//! cada leitura no InfluxDB.
//!
//! ## Uso
//! ```bash
//! emeter_collector --target-urls "Socket1:192.168.0.100:9999" \
//!     --influx-url http://localhost:8086 --org-name casa \
//!     --bucket-name energia --token ...
//! ```
//!
//! Cada flag também pode vir de uma variável de ambiente (`TARGETS`,
//! `INFLUX_URL`, `BUCKET_NAME`, `ORG_NAME`, `TOKEN`). A flag tem
//! precedência; ambas sobrescrevem o arquivo TOML.
//!
//! SIGINT/SIGTERM encerram o agregador e enviam o lote pendente. Um segundo
//! sinal encerra o processo imediatamente.

mod aggregator;
mod poller;
mod sink;

use aggregator::run_aggregator;
use clap::Parser;
use emeter_core::config::AppConfig;
use emeter_core::types::parse_targets;
use poller::spawn_poller;
use sink::InfluxSink;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};

/// Coletor de energia para tomadas inteligentes.
#[derive(Parser, Debug)]
#[command(name = "emeter_collector", version, about)]
struct Cli {
    /// Alvos nomeados separados por vírgula, ex: "Socket1:192.168.0.100:9999"
    #[arg(long = "target-urls", env = "TARGETS")]
    target_urls: Option<String>,

    /// URL do InfluxDB
    #[arg(long, env = "INFLUX_URL")]
    influx_url: Option<String>,

    /// Bucket do InfluxDB
    #[arg(long, env = "BUCKET_NAME")]
    bucket_name: Option<String>,

    /// Organização do InfluxDB
    #[arg(long, env = "ORG_NAME")]
    org_name: Option<String>,

    /// Token de acesso ao bucket
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Arquivo de configuração TOML (padrão: emeter.toml ao lado do executável)
    #[arg(long, env = "EMETER_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Sobrescreve a configuração do arquivo com o que veio da linha de comando.
    fn apply(self, config: &mut AppConfig) {
        if let Some(targets) = self.target_urls {
            config.targets = targets;
        }
        if let Some(url) = self.influx_url {
            config.influx.url = url;
        }
        if let Some(bucket) = self.bucket_name {
            config.influx.bucket = bucket;
        }
        if let Some(org) = self.org_name {
            config.influx.org = org;
        }
        if let Some(token) = self.token {
            config.influx.token = token;
        }
    }
}

/// Liga SIGINT/SIGTERM ao flag de encerramento.
///
/// O primeiro sinal só marca o flag; com o flag já marcado, o processo sai.
fn register_shutdown(shutdown: &Arc<AtomicBool>) -> io::Result<()> {
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(shutdown))?;
        flag::register(*sig, Arc::clone(shutdown))?;
    }
    Ok(())
}

fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Config ──
    let cli = Cli::parse();
    let mut config = match &cli.config {
        // Arquivo pedido explicitamente precisa existir e ser válido
        Some(path) => match AppConfig::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => AppConfig::load(&AppConfig::default_path()),
    };
    cli.apply(&mut config);

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("Configuração inválida: {e}");
        }
        return ExitCode::FAILURE;
    }

    let targets = match parse_targets(&config.targets) {
        Ok(targets) => targets,
        Err(e) => {
            error!("Lista de alvos inválida: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Iniciando para alvos: {}", config.targets);

    // ── Sink ──
    let mut sink = match InfluxSink::new(&config.influx) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Falha ao criar cliente do InfluxDB: {e}");
            return ExitCode::FAILURE;
        }
    };

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   ⚡ E-METER COLLECTOR – ATIVO");
    println!("══════════════════════════════════════════════");
    println!("  Alvos:     {}", targets.len());
    println!("  InfluxDB:  {}", config.influx.url);
    println!("  Bucket:    {}/{}", config.influx.org, config.influx.bucket);
    println!("  Intervalo: {:.1}s", config.poller.poll_interval_secs);
    println!("══════════════════════════════════════════════");
    println!();

    // ── Sinais ──
    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = register_shutdown(&shutdown) {
        error!("Falha ao registrar handlers de sinal: {e}");
        return ExitCode::FAILURE;
    }

    // ── Workers ──
    let (tx, rx) = crossbeam_channel::unbounded();
    for target in targets {
        let name = target.name.clone();
        if let Err(e) = spawn_poller(target, config.poller.clone(), tx.clone()) {
            error!("Falha ao criar thread do worker {name}: {e}");
            return ExitCode::FAILURE;
        }
    }
    drop(tx);

    // ── Agregador (thread principal) ──
    let forwarded = run_aggregator(&rx, &mut sink, config.influx.flush_interval(), &shutdown);
    info!("Agregador encerrado após {forwarded} leituras");

    // Drop do sink tenta reenviar o que sobrou no buffer; workers não são aguardados
    drop(sink);
    ExitCode::SUCCESS
}
