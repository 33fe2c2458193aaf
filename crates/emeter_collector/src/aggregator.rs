//! Agregador: drena o channel compartilhado e grava cada leitura no sink.

use crate::sink::{Point, PointSink};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use emeter_core::types::Reading;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Intervalo máximo entre verificações do pedido de encerramento.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(250);

/// Consome leituras até todos os workers soltarem o channel ou `shutdown`
/// ser sinalizado.
///
/// Leituras são encaminhadas na ordem de chegada. O sink recebe `flush` a
/// cada `flush_interval` e uma última vez no encerramento. Retorna o número
/// de leituras encaminhadas.
pub fn run_aggregator<S: PointSink>(
    rx: &Receiver<Reading>,
    sink: &mut S,
    flush_interval: Duration,
    shutdown: &AtomicBool,
) -> u64 {
    let mut forwarded = 0u64;
    let mut last_flush = Instant::now();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Encerramento solicitado");
            flush_logged(sink);
            return forwarded;
        }

        let wait = flush_interval
            .saturating_sub(last_flush.elapsed())
            .min(SHUTDOWN_CHECK);
        match rx.recv_timeout(wait) {
            Ok(reading) => {
                debug!(
                    "← {} | {} mV {} mA {} mW {} Wh",
                    reading.name,
                    reading.voltage_mv,
                    reading.current_ma,
                    reading.power_mw,
                    reading.total_wh
                );
                if let Err(e) = sink.write_point(&Point::from_reading(&reading)) {
                    warn!("Erro ao gravar ponto de {}: {e}", reading.name);
                }
                forwarded += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("Channel de leituras fechado");
                flush_logged(sink);
                return forwarded;
            }
        }

        if last_flush.elapsed() >= flush_interval {
            flush_logged(sink);
            last_flush = Instant::now();
        }
    }
}

fn flush_logged<S: PointSink>(sink: &mut S) {
    if let Err(e) = sink.flush() {
        warn!("Erro ao enviar lote ao sink: {e}");
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
