//! TWI request/response exchanges
//!
//! [`transact`] performs one write-then-read on an open TWI master handle.
//! [`BusMaster`] decides how long that handle lives (see [`TwiHandlePolicy`]).

use std::fmt;

use crate::controls::Mode;
use crate::session::{Session, TwiMasterHandle};
use crate::transport::{BusFault, Transport, TransportError, TwiConfig};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("request length {request_len} exceeds the {available} bytes supplied")]
    RequestTooLong { request_len: usize, available: usize },

    #[error(transparent)]
    Fault(#[from] BusFault),

    #[error("board rejected the transfer: {0}")]
    Rejected(String),

    #[error("connection to the board was lost: {reason}")]
    ConnectionLost { reason: String },
}

impl BusError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BusError::ConnectionLost { .. })
    }
}

impl From<TransportError> for BusError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectionLost { reason } => BusError::ConnectionLost { reason },
            TransportError::Bus(fault) => BusError::Fault(fault),
            TransportError::Rejected(msg) => BusError::Rejected(msg),
        }
    }
}

/// Write `request[..request_len]` to `address`, then read exactly
/// `response_len` bytes back.
pub fn transact<T: Transport>(
    twi: &mut TwiMasterHandle<T>,
    address: u16,
    request: &[u8],
    request_len: usize,
    response_len: usize,
) -> Result<Vec<u8>, BusError> {
    if request_len > request.len() {
        return Err(BusError::RequestTooLong {
            request_len,
            available: request.len(),
        });
    }

    let mut response = vec![0u8; response_len];
    twi.write_read(address, &request[..request_len], &mut response)?;
    log::debug!(
        "TWI 0x{:02x}: wrote {} byte(s), read {} byte(s)",
        address,
        request_len,
        response_len
    );
    Ok(response)
}

/// How long a TWI master handle is kept open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TwiHandlePolicy {
    /// Open before and close after every exchange, releasing the bus between
    /// ticks.
    #[default]
    PerTransaction,
    /// Open on first use and keep it until the session is torn down.
    PerSession,
}

/// Outcome of one exchange, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    /// Mode that triggered the exchange.
    pub mode: Mode,
    pub address: u16,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

impl TransactionReport {
    /// The request as the UI shows it: raw bytes as characters plus length.
    pub fn request_text(&self) -> String {
        describe_buffer(&self.request)
    }

    pub fn response_text(&self) -> String {
        describe_buffer(&self.response)
    }
}

impl fmt::Display for TransactionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02x}: sent {:?}, got {:?}",
            self.address,
            self.request_text(),
            self.response_text()
        )
    }
}

fn describe_buffer(bytes: &[u8]) -> String {
    format!("{} of size {}", String::from_utf8_lossy(bytes), bytes.len())
}

/// Owner of the TWI module used by the polling loop.
pub struct BusMaster<T: Transport> {
    module: u8,
    config: TwiConfig,
    policy: TwiHandlePolicy,
    held: Option<TwiMasterHandle<T>>,
}

impl<T: Transport> BusMaster<T> {
    pub fn new(module: u8, config: TwiConfig, policy: TwiHandlePolicy) -> Self {
        Self {
            module,
            config,
            policy,
            held: None,
        }
    }

    pub fn policy(&self) -> TwiHandlePolicy {
        self.policy
    }

    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }

    /// Run one exchange, opening the module first if no handle is held.
    pub fn exchange(
        &mut self,
        session: &Session<T>,
        address: u16,
        request: &[u8],
        request_len: usize,
        response_len: usize,
    ) -> Result<Vec<u8>, BusError> {
        let mut twi = match self.held.take() {
            Some(twi) => twi,
            None => session.open_twi_master(self.module, self.config)?,
        };

        let result = transact(&mut twi, address, request, request_len, response_len);

        match self.policy {
            TwiHandlePolicy::PerTransaction => {
                let closed = twi.close();
                let response = result?;
                match closed {
                    Err(e) if e.is_connection_lost() => Err(e.into()),
                    Err(e) => {
                        // The exchange itself completed; keep its data.
                        log::warn!("Closing TWI module {} failed: {}", self.module, e);
                        Ok(response)
                    }
                    Ok(()) => Ok(response),
                }
            }
            TwiHandlePolicy::PerSession => {
                if twi.is_valid() {
                    self.held = Some(twi);
                }
                result
            }
        }
    }

    /// Close a held handle, if any. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(twi) = self.held.take() {
            if let Err(e) = twi.close() {
                log::debug!("Releasing TWI module {} failed: {}", self.module, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBoard;

    #[test]
    fn test_transact_reads_requested_length() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        monitor.set_twi_reply(0x10, b"abcd");
        let session = Session::new(board);
        let mut twi = session.open_twi_master(0, TwiConfig::default()).unwrap();

        let response = transact(&mut twi, 0x10, &[0x01], 1, 4).unwrap();
        assert_eq!(response, b"abcd");
        assert_eq!(monitor.requests(), vec![(0x10, vec![0x01])]);
    }

    #[test]
    fn test_transact_sends_only_request_len_bytes() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);
        let mut twi = session.open_twi_master(0, TwiConfig::default()).unwrap();

        transact(&mut twi, 0x10, &[0xAA, 0xBB, 0xCC], 2, 1).unwrap();
        assert_eq!(monitor.requests(), vec![(0x10, vec![0xAA, 0xBB])]);
    }

    #[test]
    fn test_transact_rejects_oversized_request_len() {
        let session = Session::new(SimulatedBoard::new());
        let mut twi = session.open_twi_master(0, TwiConfig::default()).unwrap();

        let err = transact(&mut twi, 0x10, &[0x01], 3, 4).unwrap_err();
        assert!(matches!(
            err,
            BusError::RequestTooLong {
                request_len: 3,
                available: 1
            }
        ));
    }

    #[test]
    fn test_report_text_shows_sizes() {
        let report = TransactionReport {
            mode: Mode::SingleShot,
            address: 0,
            request: vec![0x01],
            response: b"IOIO".to_vec(),
        };
        assert_eq!(report.request_text(), "\u{1} of size 1");
        assert_eq!(report.response_text(), "IOIO of size 4");
    }

    #[test]
    fn test_per_transaction_policy_closes_handle() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);
        let mut bus = BusMaster::new(0, TwiConfig::default(), TwiHandlePolicy::PerTransaction);

        bus.exchange(&session, 0, &[0x01], 1, 4).unwrap();
        bus.exchange(&session, 0, &[0x01], 1, 4).unwrap();
        assert!(!bus.is_holding());
        let stats = monitor.stats();
        assert_eq!(stats.twi_opens, 2);
        assert_eq!(stats.twi_open_now, 0);
        assert_eq!(stats.twi_open_max, 1);
    }

    #[test]
    fn test_per_session_policy_reuses_handle() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);
        let mut bus = BusMaster::new(0, TwiConfig::default(), TwiHandlePolicy::PerSession);

        bus.exchange(&session, 0, &[0x01], 1, 4).unwrap();
        bus.exchange(&session, 0, &[0x01], 1, 4).unwrap();
        assert!(bus.is_holding());
        assert_eq!(monitor.stats().twi_opens, 1);

        bus.release();
        bus.release();
        assert_eq!(monitor.stats().twi_open_now, 0);
    }

    #[test]
    fn test_failed_close_keeps_completed_response() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        monitor.set_twi_reply(0x10, b"abcd");
        let session = Session::new(board);
        let mut bus = BusMaster::new(0, TwiConfig::default(), TwiHandlePolicy::PerTransaction);

        monitor.fail_next_close(TransportError::Rejected("channel busy".to_string()));
        let response = bus.exchange(&session, 0x10, &[0x01], 1, 4).unwrap();
        assert_eq!(response, b"abcd");
        assert!(session.is_connected());

        // The next exchange opens and closes normally.
        assert_eq!(bus.exchange(&session, 0x10, &[0x01], 1, 4).unwrap(), b"abcd");
        assert_eq!(monitor.stats().twi_opens, 2);
    }

    #[test]
    fn test_close_on_lost_link_reports_connection_lost() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);
        let mut bus = BusMaster::new(0, TwiConfig::default(), TwiHandlePolicy::PerTransaction);

        monitor.fail_next_close(TransportError::lost("cable pulled"));
        let err = bus.exchange(&session, 0x10, &[0x01], 1, 4).unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!session.is_connected());
    }

    #[test]
    fn test_bus_fault_still_closes_handle() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);
        let mut bus = BusMaster::new(0, TwiConfig::default(), TwiHandlePolicy::PerTransaction);

        monitor.inject_bus_fault(BusFault::Nack { address: 0x22 });
        let err = bus.exchange(&session, 0x22, &[0x01], 1, 4).unwrap_err();
        assert!(matches!(err, BusError::Fault(BusFault::Nack { address: 0x22 })));
        assert!(!err.is_connection_lost());
        assert_eq!(monitor.stats().twi_open_now, 0);
    }
}
