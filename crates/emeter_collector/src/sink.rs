//! Destino das leituras: pontos em line protocol enviados ao InfluxDB v2.

use emeter_core::config::InfluxConfig;
use emeter_core::types::Reading;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Nome da measurement gravada para cada leitura.
pub const MEASUREMENT: &str = "power";

/// Erros do sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("URL do InfluxDB inválida \"{url}\": {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Erro HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("InfluxDB recusou o lote (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Um ponto de série temporal: uma tag `name` e campos inteiros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub measurement: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub fields: Vec<(&'static str, i64)>,
    pub timestamp: SystemTime,
}

impl Point {
    pub fn from_reading(reading: &Reading) -> Self {
        Self {
            measurement: MEASUREMENT,
            tags: vec![("name", reading.name.clone())],
            fields: vec![
                ("voltage_mv", reading.voltage_mv),
                ("current_ma", reading.current_ma),
                ("power_mw", reading.power_mw),
                ("total_wh", reading.total_wh),
            ],
            timestamp: reading.timestamp,
        }
    }

    /// Renderiza em line protocol com timestamp em nanossegundos.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            let _ = write!(line, "{sep}{}={value}i", escape(key, &[',', '=', ' ']));
        }

        let nanos = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let _ = write!(line, " {nanos}");

        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Destino de pontos. Implementações podem bufferizar; `flush` força o envio.
pub trait PointSink {
    fn write_point(&mut self, point: &Point) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

// ──────────────────────────────────────────────
// InfluxDB
// ──────────────────────────────────────────────

/// Cliente de escrita do InfluxDB v2 com envio em lotes.
///
/// Lotes que falham continuam no buffer até `max_buffered_points`;
/// acima disso os pontos mais antigos são descartados.
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    token: String,
    batch_size: usize,
    max_buffered: usize,
    buffer: VecDeque<String>,
    dropped: u64,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let base = config.url.trim_end_matches('/');
        let mut write_url =
            Url::parse(&format!("{base}/api/v2/write")).map_err(|e| SinkError::InvalidUrl {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
            batch_size: config.batch_size.max(1),
            max_buffered: config.max_buffered_points.max(1),
            buffer: VecDeque::new(),
            dropped: 0,
        })
    }

    /// Pontos aguardando envio.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn send_batch(&self) -> Result<(), SinkError> {
        let body = self
            .buffer
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");

        let mut request = self
            .client
            .post(self.write_url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Token {}", self.token));
        }

        let response = request.send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }
}

impl PointSink for InfluxSink {
    fn write_point(&mut self, point: &Point) -> Result<(), SinkError> {
        if self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 100 == 0 {
                warn!(
                    "Buffer do InfluxDB cheio ({} pontos), {} pontos antigos descartados",
                    self.max_buffered, self.dropped
                );
            }
        }
        self.buffer.push_back(point.to_line_protocol());

        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.send_batch() {
            Ok(()) => {
                debug!("→ {} pontos enviados ao InfluxDB", self.buffer.len());
                self.buffer.clear();
                Ok(())
            }
            // 4xx (exceto 429) não melhora com nova tentativa
            Err(SinkError::Rejected { status, body })
                if (400..500).contains(&status) && status != 429 =>
            {
                let lost = self.buffer.len();
                self.buffer.clear();
                Err(SinkError::Rejected {
                    status,
                    body: format!("{body} ({lost} pontos descartados)"),
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for InfluxSink {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Falha no envio final ao InfluxDB ({} pontos): {e}", self.pending());
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
