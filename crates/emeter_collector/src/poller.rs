//! Worker de polling: uma thread e uma conexão TCP por tomada.
//!
//! Ciclo de vida:
//!
//! ```text
//! Disconnected ──dial ok──▶ Connected ──write──▶ AwaitingResponse
//!      ▲  │                     ▲                        │
//!      │  └─dial falhou: espera reconnect_delay          │ frame lido e parseado
//!      │                        └── envia Reading, dorme poll_interval
//!      └── erro de write/read/parse: espera failure_delay
//! ```
//!
//! Nenhum erro encerra o worker. Ele só termina quando o channel de
//! leituras é fechado (agregador encerrado).

use crossbeam_channel::Sender;
use emeter_core::config::PollerConfig;
use emeter_core::protocol::{self, ProtocolError, REALTIME_QUERY};
use emeter_core::types::{Reading, Target};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Estado da conexão de um worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    AwaitingResponse,
}

/// Erros de um ciclo de polling. Todos levam a uma reconexão.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Falha ao conectar em {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Erro ao escrever no dispositivo: {0}")]
    Write(#[source] io::Error),

    #[error("Erro ao ler resposta: {0}")]
    Read(#[source] ProtocolError),

    #[error("Erro ao interpretar resposta: {source}, dados: '{raw}'")]
    Parse {
        #[source]
        source: ProtocolError,
        raw: String,
    },
}

/// Como uma sessão (uma conexão) terminou.
enum SessionEnd {
    Failed(PollError),
    ChannelClosed,
}

/// Worker de uma tomada.
pub struct Poller {
    target: Target,
    config: PollerConfig,
    request: Vec<u8>,
    tx: Sender<Reading>,
    state: ConnectionState,
}

impl Poller {
    pub fn new(target: Target, config: PollerConfig, tx: Sender<Reading>) -> Self {
        Self {
            target,
            config,
            request: protocol::encode(REALTIME_QUERY),
            tx,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("[{}] {:?} → {:?}", self.target.name, self.state, state);
            self.state = state;
        }
    }

    /// Loop de reconexão. Retorna apenas quando o channel é fechado.
    pub fn run(mut self) {
        info!("[{}] Worker iniciado para {}", self.target.name, self.target.address);

        loop {
            let stream = match self.connect() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[{}] {e}", self.target.name);
                    warn!(
                        "[{}] Tentando novamente em {:?}...",
                        self.target.name,
                        self.config.reconnect_delay()
                    );
                    thread::sleep(self.config.reconnect_delay());
                    continue;
                }
            };

            info!("[{}] Conectado a {}", self.target.name, self.target.address);

            match self.session(stream) {
                SessionEnd::ChannelClosed => {
                    info!("[{}] Channel de leituras fechado, encerrando worker", self.target.name);
                    return;
                }
                SessionEnd::Failed(e) => {
                    warn!("[{}] {e} (estado: {:?})", self.target.name, self.state());
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        "[{}] Reiniciando a conexão em {:?}...",
                        self.target.name,
                        self.config.failure_delay()
                    );
                    thread::sleep(self.config.failure_delay());
                }
            }
        }
    }

    fn connect(&mut self) -> Result<TcpStream, PollError> {
        let address = self.target.address.clone();
        let connect_err = |source: io::Error| PollError::Connect {
            address: address.clone(),
            source,
        };

        let addrs = address.to_socket_addrs().map_err(connect_err)?;

        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "endereço não resolvido");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout()) {
                Ok(stream) => {
                    // io_timeout_secs = 0 desliga as deadlines
                    let io_timeout = self.config.io_timeout();
                    stream.set_read_timeout(io_timeout).map_err(connect_err)?;
                    stream.set_write_timeout(io_timeout).map_err(connect_err)?;
                    stream.set_nodelay(true).ok();

                    self.set_state(ConnectionState::Connected);
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }

        Err(connect_err(last_err))
    }

    /// Consulta repetidamente na mesma conexão até um erro.
    fn session(&mut self, mut stream: TcpStream) -> SessionEnd {
        loop {
            let reading = match self.query(&mut stream) {
                Ok(reading) => reading,
                Err(e) => return SessionEnd::Failed(e),
            };

            if reading.error_code != 0 {
                warn!(
                    "[{}] Dispositivo reportou err_code {}",
                    self.target.name, reading.error_code
                );
            }
            debug!(
                "[{}] {} mV {} mA {} mW {} Wh",
                self.target.name,
                reading.voltage_mv,
                reading.current_ma,
                reading.power_mw,
                reading.total_wh
            );

            if self.tx.send(reading).is_err() {
                return SessionEnd::ChannelClosed;
            }

            thread::sleep(self.config.poll_interval());
        }
    }

    /// Uma consulta `get_realtime`: escreve o frame, lê a resposta e interpreta.
    pub fn query<S: Read + Write>(&mut self, stream: &mut S) -> Result<Reading, PollError> {
        stream.write_all(&self.request).map_err(PollError::Write)?;
        self.set_state(ConnectionState::AwaitingResponse);

        let body = protocol::read_frame(stream, self.config.max_frame_len).map_err(PollError::Read)?;
        self.set_state(ConnectionState::Connected);

        let decoded = protocol::decode(&body);
        let stats = protocol::parse_realtime(&decoded).map_err(|source| PollError::Parse {
            source,
            raw: String::from_utf8_lossy(&decoded).into_owned(),
        })?;

        Ok(Reading::from_stats(&self.target.name, stats, SystemTime::now()))
    }
}

/// Inicia o worker de um alvo em uma thread dedicada.
pub fn spawn_poller(
    target: Target,
    config: PollerConfig,
    tx: Sender<Reading>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("poller-{}", target.name))
        .spawn(move || Poller::new(target, config, tx).run())
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use emeter_core::protocol::{HEADER_SIZE, encode, read_frame};
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const RESPONSE: &str = r#"{"emeter":{"get_realtime":{"voltage_mv":230000,"current_ma":500,"power_mw":115000,"total_wh":42,"err_code":0}}}"#;

    fn fast_config() -> PollerConfig {
        PollerConfig {
            connect_timeout_secs: 1.0,
            reconnect_delay_secs: 0.02,
            failure_delay_secs: 0.02,
            poll_interval_secs: 0.02,
            io_timeout_secs: 5.0,
            ..Default::default()
        }
    }

    fn target(address: String) -> Target {
        Target {
            name: "Socket1".into(),
            address,
        }
    }

    /// Stream em memória: entrega `input` e registra o que foi escrito.
    struct MockStream {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl MockStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                written: Vec::new(),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Responde cada consulta recebida em `stream` com `RESPONSE`.
    fn serve_device(mut stream: TcpStream) {
        while let Ok(body) = read_frame(&mut stream, 4096) {
            assert_eq!(protocol::decode(&body), REALTIME_QUERY.as_bytes());
            if stream.write_all(&encode(RESPONSE)).is_err() {
                return;
            }
        }
    }

    fn garbage_frame() -> Vec<u8> {
        let garbage = [0x13, 0x37, 0xff, 0x00, 0x42, 0x99];
        let mut frame = (garbage.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&garbage);
        frame
    }

    fn wait_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if handle.is_finished() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn query_parses_reading_and_tracks_state() {
        let (tx, _rx) = unbounded();
        let mut poller = Poller::new(target("unused:1".into()), fast_config(), tx);
        let mut stream = MockStream::new(encode(RESPONSE));

        assert_eq!(poller.state(), ConnectionState::Disconnected);
        let before = SystemTime::now();
        let reading = poller.query(&mut stream).unwrap();

        assert_eq!(stream.written, encode(REALTIME_QUERY));
        assert_eq!(poller.state(), ConnectionState::Connected);
        assert_eq!(reading.name, "Socket1");
        assert_eq!(reading.voltage_mv, 230000);
        assert_eq!(reading.current_ma, 500);
        assert_eq!(reading.power_mw, 115000);
        assert_eq!(reading.total_wh, 42);
        assert_eq!(reading.error_code, 0);
        assert!(reading.timestamp >= before);
    }

    #[test]
    fn query_reports_garbage_with_raw_bytes() {
        let (tx, _rx) = unbounded();
        let mut poller = Poller::new(target("unused:1".into()), fast_config(), tx);
        let mut stream = MockStream::new(encode("não é json"));

        match poller.query(&mut stream) {
            Err(PollError::Parse { raw, .. }) => assert_eq!(raw, "não é json"),
            other => panic!("esperado erro de parse, obtido {other:?}"),
        }
    }

    #[test]
    fn query_reports_truncated_response_as_read_error() {
        let (tx, _rx) = unbounded();
        let mut poller = Poller::new(target("unused:1".into()), fast_config(), tx);
        let mut frame = encode(RESPONSE);
        frame.truncate(HEADER_SIZE + 10);
        let mut stream = MockStream::new(frame);

        assert!(matches!(poller.query(&mut stream), Err(PollError::Read(_))));
        assert_eq!(poller.state(), ConnectionState::AwaitingResponse);
    }

    #[test]
    fn query_reassembles_response_split_across_reads() {
        /// Entrega no máximo 3 bytes por read.
        struct Trickle(MockStream);

        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = buf.len().min(3);
                self.0.read(&mut buf[..n])
            }
        }

        impl Write for Trickle {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.write(buf)
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (tx, _rx) = unbounded();
        let mut poller = Poller::new(target("unused:1".into()), fast_config(), tx);
        let mut stream = Trickle(MockStream::new(encode(RESPONSE)));
        assert_eq!(poller.query(&mut stream).unwrap().power_mw, 115000);
    }

    #[test]
    fn end_to_end_reading_from_mock_device() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_device(stream);
        });

        let (tx, rx) = unbounded();
        let before = SystemTime::now();
        spawn_poller(target(address), fast_config(), tx).unwrap();

        let reading = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let after = SystemTime::now();

        assert_eq!(reading.name, "Socket1");
        assert_eq!(reading.voltage_mv, 230000);
        assert_eq!(reading.current_ma, 500);
        assert_eq!(reading.power_mw, 115000);
        assert_eq!(reading.total_wh, 42);
        assert!(reading.timestamp >= before && reading.timestamp <= after);

        // Continua consultando na mesma conexão
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(second.timestamp >= reading.timestamp);
    }

    #[test]
    fn keeps_dialing_until_device_comes_online() {
        // Reserva uma porta e libera: os primeiros dials são recusados
        let address = {
            let reserved = TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap()
        };

        let (tx, rx) = unbounded();
        let handle = spawn_poller(target(address.to_string()), fast_config(), tx).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(!handle.is_finished(), "worker não deve terminar por falha de conexão");
        assert!(rx.try_recv().is_err());

        let listener = TcpListener::bind(address).unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_device(stream);
        });

        let reading = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reading.name, "Socket1");
        assert!(!handle.is_finished());
    }

    #[test]
    fn malformed_response_drops_connection_and_redials() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        thread::spawn(move || {
            // Primeira conexão: lixo após o prefixo de tamanho
            let (mut first, _) = listener.accept().unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            read_frame(&mut first, 4096).unwrap();
            first.write_all(&garbage_frame()).unwrap();

            // O worker abandona a conexão: próxima leitura vê EOF
            let mut buf = [0u8; 1];
            assert_eq!(first.read(&mut buf).unwrap_or(0), 0);

            let (second, _) = listener.accept().unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            serve_device(second);
        });

        let (tx, rx) = unbounded();
        let handle = spawn_poller(target(address), fast_config(), tx).unwrap();

        // A primeira leitura emitida já vem da segunda conexão
        let reading = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reading.power_mw, 115000);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert!(!handle.is_finished());
    }

    #[test]
    fn overstated_length_times_out_and_redials() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        thread::spawn(move || {
            // Primeira conexão: prefixo anuncia 100 bytes, chegam 6, socket fica aberto
            let (mut first, _) = listener.accept().unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            read_frame(&mut first, 4096).unwrap();
            let mut partial = 100u32.to_be_bytes().to_vec();
            partial.extend_from_slice(&[0x13, 0x37, 0xff, 0x00, 0x42, 0x99]);
            first.write_all(&partial).unwrap();

            let (second, _) = listener.accept().unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            serve_device(second);
            drop(first);
        });

        let config = PollerConfig {
            io_timeout_secs: 0.2,
            ..fast_config()
        };
        let (tx, rx) = unbounded();
        let handle = spawn_poller(target(address), config, tx).unwrap();

        let reading = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reading.power_mw, 115000);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert!(!handle.is_finished());
    }

    #[test]
    fn default_config_arms_socket_deadlines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (tx, _rx) = unbounded();
        let mut poller = Poller::new(target(address), PollerConfig::default(), tx);
        let stream = poller.connect().unwrap();

        let expected = Some(Duration::from_secs(10));
        assert_eq!(stream.read_timeout().unwrap(), expected);
        assert_eq!(stream.write_timeout().unwrap(), expected);
    }

    #[test]
    fn worker_exits_when_channel_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_device(stream);
        });

        let (tx, rx) = unbounded();
        drop(rx);
        let handle = spawn_poller(target(address), fast_config(), tx).unwrap();

        assert!(wait_finished(&handle, Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
