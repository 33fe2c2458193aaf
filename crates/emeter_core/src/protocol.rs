//! Protocolo de comunicação com as tomadas inteligentes.
//!
//! Cada mensagem trafega via TCP no formato:
//!
//! ```text
//! ┌────────────────┬──────────────────────────┐
//! │ Tamanho (4, BE)│ JSON ofuscado (N bytes)  │
//! └────────────────┴──────────────────────────┘
//! ```
//!
//! - Tamanho do payload em `u32` big-endian, sem ofuscação
//! - Payload JSON passado por uma cifra XOR autossincronizante com chave
//!   inicial `0xAB`. Não é criptografia, só ofuscação do fabricante.

use crate::types::RealtimeStats;
use serde::Deserialize;
use std::io::Read;

/// Chave inicial da cifra XOR.
pub const INITIAL_KEY: u8 = 0xAB;

/// Consulta de medição em tempo real.
pub const REALTIME_QUERY: &str = r#"{"emeter":{"get_realtime":{}}}"#;

/// Tamanho do header (prefixo de tamanho).
pub const HEADER_SIZE: usize = 4;

/// Tamanho máximo padrão de um frame de resposta (buffer do dispositivo).
pub const DEFAULT_MAX_FRAME_LEN: usize = 2048;

/// Erros do protocolo.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Erro de I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame muito grande ({len} bytes, máximo {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Resposta JSON inválida: {0}")]
    Json(#[from] serde_json::Error),
}

/// Aplica a cifra: a chave avança com o byte de *saída*.
pub fn xor_encrypt(data: &[u8], initial_key: u8) -> Vec<u8> {
    let mut key = initial_key;
    data.iter()
        .map(|&b| {
            key ^= b;
            key
        })
        .collect()
}

/// Inverso de [`xor_encrypt`]: a chave avança com o byte de *entrada*.
pub fn xor_decrypt(data: &[u8], initial_key: u8) -> Vec<u8> {
    let mut key = initial_key;
    data.iter()
        .map(|&c| {
            let out = key ^ c;
            key = c;
            out
        })
        .collect()
}

/// Monta um frame completo: `[len u32 BE][payload cifrado...]`.
pub fn encode(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();

    let mut frame = Vec::with_capacity(HEADER_SIZE + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&xor_encrypt(bytes, INITIAL_KEY));

    frame
}

/// Decifra um payload. O chamador já removeu o prefixo de tamanho.
pub fn decode(data: &[u8]) -> Vec<u8> {
    xor_decrypt(data, INITIAL_KEY)
}

/// Lê um frame completo guiado pelo prefixo de tamanho.
///
/// Retorna o payload ainda cifrado. Respostas fragmentadas em vários
/// segmentos TCP são remontadas; um frame truncado vira `Io(UnexpectedEof)`.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

#[derive(Deserialize)]
struct RealtimeEnvelope {
    emeter: EmeterSection,
}

#[derive(Deserialize)]
struct EmeterSection {
    get_realtime: RealtimeStats,
}

/// Interpreta a resposta decifrada de `get_realtime`.
pub fn parse_realtime(decoded: &[u8]) -> Result<RealtimeStats, ProtocolError> {
    let envelope: RealtimeEnvelope = serde_json::from_slice(decoded)?;
    Ok(envelope.emeter.get_realtime)
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
