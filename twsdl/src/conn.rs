// twsdl/src/conn.rs

use crate::account::ExecutionFilter;
use crate::base::TwsDlError;
use crate::contract::Contract;
use crate::event::Event;
use crate::order::Order;
use crate::todo::{HistRequest, MktDataRequest};
pub use socket::SocketClient;

/// What the event loop needs from a TWS connection.
///
/// Incoming messages are only ever handed out by `wait_for_activity`, so all
/// state changes they cause happen on the caller's thread.
pub trait ProtocolClient {
  fn connect(&mut self, host: &str, port: u16, client_id: i32) -> Result<(), TwsDlError>;

  fn disconnect(&mut self);

  fn is_connected(&self) -> bool;

  /// Block up to `timeout_ms` for incoming messages and return all that
  /// arrived. Returns early as soon as anything is available.
  fn wait_for_activity(&mut self, timeout_ms: i64) -> Vec<Event>;

  fn req_contract_details(&mut self, req_id: i32, contract: &Contract) -> Result<(), TwsDlError>;

  fn req_historical_data(&mut self, req_id: i32, req: &HistRequest) -> Result<(), TwsDlError>;

  fn req_account_updates(&mut self, subscribe: bool, account: &str) -> Result<(), TwsDlError>;

  fn req_executions(&mut self, req_id: i32, filter: &ExecutionFilter) -> Result<(), TwsDlError>;

  fn req_all_open_orders(&mut self) -> Result<(), TwsDlError>;

  fn place_order(&mut self, order_id: i32, contract: &Contract, order: &Order) -> Result<(), TwsDlError>;

  fn cancel_order(&mut self, order_id: i32) -> Result<(), TwsDlError>;

  fn req_mkt_data(&mut self, ticker_id: i32, req: &MktDataRequest) -> Result<(), TwsDlError>;

  fn cancel_mkt_data(&mut self, ticker_id: i32) -> Result<(), TwsDlError>;

  fn req_current_time(&mut self) -> Result<(), TwsDlError>;
}

mod socket {
  use std::io::{self, Cursor, ErrorKind, Read, Write};
  use std::net::{TcpStream, ToSocketAddrs};
  use std::sync::Arc;
  use std::thread;
  use std::time::Duration;

  use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
  use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
  use log::{debug, error, info, warn};
  use parking_lot::Mutex;

  use super::ProtocolClient;
  use crate::account::ExecutionFilter;
  use crate::base::TwsDlError;
  use crate::contract::Contract;
  use crate::event::Event;
  use crate::order::Order;
  use crate::protocol_decoder::decode_message;
  use crate::protocol_encoder::{Encoder, PROTOCOL_VERSION};
  use crate::todo::{HistRequest, MktDataRequest};

  const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
  const READER_POLL: Duration = Duration::from_millis(500);
  const MAX_MSG_SIZE: usize = 16 * 1024 * 1024;

  /// TCP connection to TWS or IB Gateway.
  pub struct SocketClient {
    encoder: Encoder,
    server_version: i32,
    connection_time: String,
    stream: Option<TcpStream>,
    reader_thread: Option<thread::JoinHandle<()>>,
    stop_flag: Arc<Mutex<bool>>,
    events: Option<Receiver<Event>>,
  }

  /// Read exactly `buf.len()` bytes. A read timeout before the first byte
  /// surfaces as `TimedOut`; once a message has started it is read to the end.
  fn read_exact_or_idle(stream: &mut TcpStream, buf: &mut [u8], stop_flag: &Mutex<bool>) -> io::Result<()> {
    let mut read = 0;
    while read < buf.len() {
      match stream.read(&mut buf[read..]) {
        Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed by peer")),
        Ok(n) => read += n,
        Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
          if read == 0 || *stop_flag.lock() {
            return Err(io::Error::new(ErrorKind::TimedOut, "read timed out"));
          }
        }
        Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  fn read_framed_message_body(stream: &mut TcpStream, stop_flag: &Mutex<bool>) -> io::Result<Vec<u8>> {
    let mut size_buf = [0u8; 4];
    read_exact_or_idle(stream, &mut size_buf, stop_flag)?;
    let size = Cursor::new(size_buf).read_u32::<BigEndian>()? as usize;
    if size > MAX_MSG_SIZE {
      return Err(io::Error::new(ErrorKind::InvalidData, format!("message size too large: {}", size)));
    }
    let mut body = vec![0u8; size];
    if size > 0 {
      // The length prefix is in, so the body is expected right behind it.
      let mut read = 0;
      while read < size {
        match stream.read(&mut body[read..]) {
          Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed inside message")),
          Ok(n) => read += n,
          Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
            if *stop_flag.lock() {
              return Err(io::Error::new(ErrorKind::TimedOut, "stopped inside message"));
            }
          }
          Err(e) => return Err(e),
        }
      }
    }
    Ok(body)
  }

  fn write_framed_message(stream: &mut TcpStream, body: &[u8]) -> Result<(), TwsDlError> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.write_u32::<BigEndian>(body.len() as u32)
      .map_err(|e| TwsDlError::InternalError(format!("Failed to encode length: {}", e)))?;
    frame.extend_from_slice(body);
    stream.write_all(&frame).map_err(|e| TwsDlError::SocketError(e.to_string()))?;
    stream.flush().map_err(|e| TwsDlError::SocketError(e.to_string()))?;
    Ok(())
  }

  fn reader_loop(mut stream: TcpStream, stop_flag: Arc<Mutex<bool>>, tx: Sender<Event>) {
    debug!("Message reader thread started");
    loop {
      if *stop_flag.lock() {
        debug!("Reader thread stopping");
        break;
      }
      match read_framed_message_body(&mut stream, &stop_flag) {
        Ok(body) if body.is_empty() => {}
        Ok(body) => match decode_message(&body) {
          Ok(events) => {
            for ev in events {
              if tx.send(ev).is_err() {
                debug!("Event receiver gone, reader thread exiting");
                return;
              }
            }
          }
          Err(e) => error!("Error decoding message: {} - Data: {:02X?}", e, body),
        },
        Err(ref e) if e.kind() == ErrorKind::TimedOut => continue,
        Err(e) => {
          if !*stop_flag.lock() {
            error!("Connection lost in reader thread: {}", e);
            let _ = tx.send(Event::ConnectionClosed);
          }
          break;
        }
      }
    }
    *stop_flag.lock() = true;
    debug!("Message reader thread ended");
  }

  impl Default for SocketClient {
    fn default() -> Self {
      Self::new()
    }
  }

  impl SocketClient {
    pub fn new() -> Self {
      Self {
        encoder: Encoder::new(),
        server_version: 0,
        connection_time: String::new(),
        stream: None,
        reader_thread: None,
        stop_flag: Arc::new(Mutex::new(true)),
        events: None,
      }
    }

    pub fn server_version(&self) -> i32 {
      self.server_version
    }

    pub fn connection_time(&self) -> &str {
      &self.connection_time
    }

    fn handshake(&mut self, stream: &mut TcpStream, client_id: i32) -> Result<(), TwsDlError> {
      // H1: "API\0" followed by the length prefixed version range
      let versions = format!("v{}", PROTOCOL_VERSION);
      let mut h1 = Vec::with_capacity(8 + versions.len());
      h1.extend_from_slice(b"API\0");
      h1.write_u32::<BigEndian>(versions.len() as u32)
        .map_err(|e| TwsDlError::InternalError(format!("Failed to encode length: {}", e)))?;
      h1.extend_from_slice(versions.as_bytes());
      stream.write_all(&h1).map_err(|e| TwsDlError::SocketError(format!("Sending H1: {}", e)))?;
      stream.flush().map_err(|e| TwsDlError::SocketError(format!("Flushing H1: {}", e)))?;

      // H2: server version and connection time
      stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(|e| TwsDlError::SocketError(format!("Setting read timeout: {}", e)))?;
      let no_stop = Mutex::new(false);
      let h2 = read_framed_message_body(stream, &no_stop)
        .map_err(|e| TwsDlError::ConnectionFailed(format!("Reading H2: {}", e)))?;
      let parts: Vec<&[u8]> = h2.splitn(3, |&b| b == 0).collect();
      if parts.len() < 2 || parts[0].is_empty() {
        return Err(TwsDlError::ParseError(format!("Invalid H2 body format: {:02X?}", h2)));
      }
      let version_str = std::str::from_utf8(parts[0])
        .map_err(|e| TwsDlError::ParseError(format!("Invalid UTF8 in server version: {}", e)))?;
      self.server_version = version_str.parse::<i32>()
        .map_err(|e| TwsDlError::ParseError(format!("Parsing server version '{}': {}", version_str, e)))?;
      self.connection_time = String::from_utf8_lossy(parts[1]).to_string();
      if self.server_version < PROTOCOL_VERSION {
        return Err(TwsDlError::ConnectionFailed(format!(
          "server version {} is older than {}", self.server_version, PROTOCOL_VERSION)));
      }
      info!("Parsed ServerVersion={}, ConnectionTime='{}'", self.server_version, self.connection_time);

      // H3: START_API
      let start = self.encoder.encode_start_api(client_id)?;
      write_framed_message(stream, &start)
    }

    fn send(&mut self, body: Result<Vec<u8>, TwsDlError>) -> Result<(), TwsDlError> {
      let body = body?;
      if !self.is_connected() {
        return Err(TwsDlError::NotConnected);
      }
      match self.stream.as_mut() {
        Some(stream) => write_framed_message(stream, &body),
        None => Err(TwsDlError::NotConnected),
      }
    }
  }

  impl ProtocolClient for SocketClient {
    fn connect(&mut self, host: &str, port: u16, client_id: i32) -> Result<(), TwsDlError> {
      if self.stream.is_some() {
        if self.is_connected() {
          return Err(TwsDlError::AlreadyConnected);
        }
        debug!("Reader already stopped, dropping the old connection");
        self.disconnect();
      }
      info!("Connecting to TWS at {}:{} as client {}", host, port, client_id);
      let addr = (host, port).to_socket_addrs()
        .map_err(|e| TwsDlError::ConfigurationError(format!("Invalid address {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| TwsDlError::ConfigurationError(format!("No address for {}:{}", host, port)))?;
      let mut stream = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)
        .map_err(|e| TwsDlError::ConnectionFailed(format!("Connect failed: {}", e)))?;
      stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(|e| TwsDlError::ConnectionFailed(format!("Failed to set write timeout: {}", e)))?;
      stream.set_nodelay(true).map_err(|e| TwsDlError::SocketError(e.to_string()))?;

      self.handshake(&mut stream, client_id)?;

      let reader_stream = stream.try_clone()
        .map_err(|e| TwsDlError::SocketError(format!("Cloning stream for reader: {}", e)))?;
      reader_stream.set_read_timeout(Some(READER_POLL))
        .map_err(|e| TwsDlError::SocketError(format!("Setting reader timeout: {}", e)))?;
      let (tx, rx) = unbounded();
      *self.stop_flag.lock() = false;
      let stop_flag = self.stop_flag.clone();
      self.reader_thread = Some(thread::spawn(move || reader_loop(reader_stream, stop_flag, tx)));
      self.events = Some(rx);
      self.stream = Some(stream);
      info!("Connected to TWS (server version {})", self.server_version);
      Ok(())
    }

    fn disconnect(&mut self) {
      if self.stream.is_none() && self.reader_thread.is_none() {
        return;
      }
      info!("Disconnecting from TWS");
      *self.stop_flag.lock() = true;
      if let Some(stream) = &self.stream {
        if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
          if e.kind() != ErrorKind::NotConnected {
            warn!("Error shutting down socket: {}", e);
          }
        }
      }
      if let Some(handle) = self.reader_thread.take() {
        if handle.join().is_err() {
          error!("Reader thread panicked");
        }
      }
      self.stream = None;
      self.events = None;
    }

    fn is_connected(&self) -> bool {
      self.stream.is_some() && !*self.stop_flag.lock()
    }

    fn wait_for_activity(&mut self, timeout_ms: i64) -> Vec<Event> {
      let rx = match &self.events {
        Some(rx) => rx.clone(),
        None => {
          thread::sleep(Duration::from_millis(timeout_ms.max(0) as u64));
          return Vec::new();
        }
      };
      let mut out = Vec::new();
      match rx.recv_timeout(Duration::from_millis(timeout_ms.max(0) as u64)) {
        Ok(ev) => out.push(ev),
        Err(RecvTimeoutError::Timeout) => return out,
        Err(RecvTimeoutError::Disconnected) => {
          // Reader is gone; it already queued ConnectionClosed if that was unexpected.
          self.stream = None;
          self.events = None;
          return out;
        }
      }
      out.extend(rx.try_iter());
      if out.iter().any(|e| matches!(e, Event::ConnectionClosed)) {
        self.stream = None;
        self.events = None;
        if let Some(handle) = self.reader_thread.take() {
          let _ = handle.join();
        }
      }
      out
    }

    fn req_contract_details(&mut self, req_id: i32, contract: &Contract) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_request_contract_data(req_id, contract);
      self.send(body)
    }

    fn req_historical_data(&mut self, req_id: i32, req: &HistRequest) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_request_historical_data(
        req_id, &req.contract, &req.end_date_time, &req.duration, &req.bar_size,
        &req.what_to_show, req.use_rth, req.format_date);
      self.send(body)
    }

    fn req_account_updates(&mut self, subscribe: bool, account: &str) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_request_account_data(subscribe, account);
      self.send(body)
    }

    fn req_executions(&mut self, req_id: i32, filter: &ExecutionFilter) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_request_executions(req_id, filter);
      self.send(body)
    }

    fn req_all_open_orders(&mut self) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_request_all_open_orders();
      self.send(body)
    }

    fn place_order(&mut self, order_id: i32, contract: &Contract, order: &Order) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_place_order(order_id, contract, order);
      self.send(body)
    }

    fn cancel_order(&mut self, order_id: i32) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_cancel_order(order_id);
      self.send(body)
    }

    fn req_mkt_data(&mut self, ticker_id: i32, req: &MktDataRequest) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_request_market_data(ticker_id, &req.contract, &req.generic_ticks, req.snapshot);
      self.send(body)
    }

    fn cancel_mkt_data(&mut self, ticker_id: i32) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_cancel_market_data(ticker_id);
      self.send(body)
    }

    fn req_current_time(&mut self) -> Result<(), TwsDlError> {
      let body = self.encoder.encode_request_current_time();
      self.send(body)
    }
  }

  impl Drop for SocketClient {
    fn drop(&mut self) {
      self.disconnect();
    }
  }

}
