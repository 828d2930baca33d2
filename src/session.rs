//! Connection session and peripheral handles
//!
//! A [`Session`] wraps one connected [`Transport`] and hands out typed handles
//! for the sub-channels opened through it. All handles share the session's
//! link, so once the transport reports a lost connection every handle starts
//! failing with [`TransportError::ConnectionLost`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{ChannelId, PinId, Transport, TransportError, TwiConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Closed on purpose by the host.
    Disconnected,
    Connected,
    /// The transport failed underneath us.
    Lost,
}

struct Link<T> {
    transport: T,
    state: SessionState,
}

impl<T: Transport> Link<T> {
    fn run<R>(
        &mut self,
        op: impl FnOnce(&mut T) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        if self.state != SessionState::Connected {
            return Err(TransportError::lost(format!("session is {:?}", self.state)));
        }

        match op(&mut self.transport) {
            Err(e) if e.is_connection_lost() => {
                log::warn!("Board connection lost: {}", e);
                self.state = SessionState::Lost;
                self.transport.disconnect();
                Err(e)
            }
            other => other,
        }
    }
}

type SharedLink<T> = Arc<Mutex<Link<T>>>;

/// One logical connection to a peripheral controller.
pub struct Session<T: Transport> {
    link: SharedLink<T>,
}

impl<T: Transport> Session<T> {
    /// Wrap a transport that has already completed its handshake.
    pub fn new(transport: T) -> Self {
        log::debug!("Session connected");
        Self {
            link: Arc::new(Mutex::new(Link {
                transport,
                state: SessionState::Connected,
            })),
        }
    }

    /// Establish a transport with `connect` and wrap it.
    pub fn connect<E>(connect: impl FnOnce() -> Result<T, E>) -> Result<Self, E> {
        connect().map(Self::new)
    }

    pub fn state(&self) -> SessionState {
        self.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn open_digital_output(
        &self,
        pin: PinId,
        initial_level: bool,
    ) -> Result<DigitalOutputHandle<T>, TransportError> {
        let channel = self
            .link
            .lock()
            .run(|t| t.open_digital_output(pin, initial_level))?;
        log::debug!("Opened digital output on pin {} as {}", pin, channel);
        Ok(DigitalOutputHandle {
            channel: OpenChannel::new(&self.link, channel),
            pin,
            level: initial_level,
        })
    }

    pub fn open_analog_input(&self, pin: PinId) -> Result<AnalogInputHandle<T>, TransportError> {
        let channel = self.link.lock().run(|t| t.open_analog_input(pin))?;
        log::debug!("Opened analog input on pin {} as {}", pin, channel);
        Ok(AnalogInputHandle {
            channel: OpenChannel::new(&self.link, channel),
            pin,
        })
    }

    pub fn open_twi_master(
        &self,
        module: u8,
        config: TwiConfig,
    ) -> Result<TwiMasterHandle<T>, TransportError> {
        let channel = self.link.lock().run(|t| t.open_twi_master(module, config))?;
        log::debug!(
            "Opened TWI master {} at {} kHz as {}",
            module,
            config.rate.as_khz(),
            channel
        );
        Ok(TwiMasterHandle {
            channel: OpenChannel::new(&self.link, channel),
            module,
            config,
        })
    }

    /// Close the link on purpose. Calling this on a lost or already
    /// disconnected session does nothing.
    pub fn disconnect(&self) {
        let mut link = self.link.lock();
        if link.state == SessionState::Connected {
            log::debug!("Disconnecting session");
            link.state = SessionState::Disconnected;
            link.transport.disconnect();
        }
    }
}

/// Bookkeeping shared by every handle type.
struct OpenChannel<T: Transport> {
    link: SharedLink<T>,
    id: ChannelId,
    closed: bool,
}

impl<T: Transport> OpenChannel<T> {
    fn new(link: &SharedLink<T>, id: ChannelId) -> Self {
        Self {
            link: Arc::clone(link),
            id,
            closed: false,
        }
    }

    fn run<R>(
        &self,
        op: impl FnOnce(&mut T, ChannelId) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        if self.closed {
            return Err(TransportError::Rejected(format!("{} is closed", self.id)));
        }
        let id = self.id;
        self.link.lock().run(|t| op(t, id))
    }

    fn is_valid(&self) -> bool {
        !self.closed && self.link.lock().state == SessionState::Connected
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut link = self.link.lock();
        // Nothing to release on a dead link.
        if link.state != SessionState::Connected {
            return Ok(());
        }
        let id = self.id;
        link.run(|t| t.close(id))
    }
}

impl<T: Transport> Drop for OpenChannel<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("Closing {} on drop failed: {}", self.id, e);
        }
    }
}

pub struct DigitalOutputHandle<T: Transport> {
    channel: OpenChannel<T>,
    pin: PinId,
    level: bool,
}

impl<T: Transport> DigitalOutputHandle<T> {
    pub fn write(&mut self, level: bool) -> Result<(), TransportError> {
        self.channel.run(|t, ch| t.write_digital(ch, level))?;
        self.level = level;
        Ok(())
    }

    /// Last level successfully written to the pin.
    pub fn level(&self) -> bool {
        self.level
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn is_valid(&self) -> bool {
        self.channel.is_valid()
    }

    pub fn close(mut self) -> Result<(), TransportError> {
        self.channel.close()
    }
}

pub struct AnalogInputHandle<T: Transport> {
    channel: OpenChannel<T>,
    pin: PinId,
}

impl<T: Transport> AnalogInputHandle<T> {
    pub fn read(&mut self) -> Result<f32, TransportError> {
        self.channel.run(|t, ch| t.read_analog(ch))
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn is_valid(&self) -> bool {
        self.channel.is_valid()
    }

    pub fn close(mut self) -> Result<(), TransportError> {
        self.channel.close()
    }
}

/// Exclusive access to one TWI module.
///
/// `write_read` takes `&mut self`, so two exchanges can never interleave on
/// the same handle.
pub struct TwiMasterHandle<T: Transport> {
    channel: OpenChannel<T>,
    module: u8,
    config: TwiConfig,
}

impl<T: Transport> TwiMasterHandle<T> {
    pub fn write_read(
        &mut self,
        address: u16,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<(), TransportError> {
        self.channel
            .run(|t, ch| t.twi_write_read(ch, address, request, response))
    }

    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn config(&self) -> TwiConfig {
        self.config
    }

    pub fn is_valid(&self) -> bool {
        self.channel.is_valid()
    }

    pub fn close(mut self) -> Result<(), TransportError> {
        self.channel.close()
    }
}

impl<T: Transport> fmt::Debug for DigitalOutputHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOutputHandle")
            .field("channel", &self.channel.id)
            .field("pin", &self.pin)
            .field("level", &self.level)
            .finish()
    }
}

impl<T: Transport> fmt::Debug for AnalogInputHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalogInputHandle")
            .field("channel", &self.channel.id)
            .field("pin", &self.pin)
            .finish()
    }
}

impl<T: Transport> fmt::Debug for TwiMasterHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwiMasterHandle")
            .field("channel", &self.channel.id)
            .field("module", &self.module)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBoard;
    use crate::transport::LED_PIN;

    #[test]
    fn test_new_session_is_connected() {
        let session = Session::new(SimulatedBoard::new());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_digital_output_tracks_level() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);

        let mut led = session.open_digital_output(LED_PIN, true).unwrap();
        assert!(led.level());
        led.write(false).unwrap();
        assert!(!led.level());
        assert_eq!(monitor.digital_level(LED_PIN), Some(false));
    }

    #[test]
    fn test_link_loss_invalidates_every_handle() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);

        let mut led = session.open_digital_output(LED_PIN, true).unwrap();
        let mut input = session.open_analog_input(40).unwrap();

        monitor.drop_link();
        assert!(led.write(false).unwrap_err().is_connection_lost());
        assert_eq!(session.state(), SessionState::Lost);
        assert!(!input.is_valid());
        assert!(input.read().unwrap_err().is_connection_lost());
        assert!(session
            .open_twi_master(0, TwiConfig::default())
            .unwrap_err()
            .is_connection_lost());
    }

    #[test]
    fn test_close_releases_channel_once() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);

        let twi = session.open_twi_master(0, TwiConfig::default()).unwrap();
        assert_eq!(monitor.stats().twi_open_now, 1);
        twi.close().unwrap();
        assert_eq!(monitor.stats().twi_open_now, 0);
        assert_eq!(monitor.stats().closes, 1);
    }

    #[test]
    fn test_drop_closes_handle() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);

        {
            let _twi = session.open_twi_master(0, TwiConfig::default()).unwrap();
            assert_eq!(monitor.stats().twi_open_now, 1);
        }
        assert_eq!(monitor.stats().twi_open_now, 0);
    }

    #[test]
    fn test_handles_debug_format() {
        let session = Session::new(SimulatedBoard::new());
        let twi = session.open_twi_master(1, TwiConfig::default()).unwrap();
        let led = session.open_digital_output(LED_PIN, false).unwrap();

        let twi_text = format!("{:?}", twi);
        assert!(twi_text.starts_with("TwiMasterHandle"));
        assert!(twi_text.contains("module: 1"));
        assert!(format!("{:?}", led).contains("level: false"));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let board = SimulatedBoard::new();
        let monitor = board.monitor();
        let session = Session::new(board);

        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(monitor.stats().disconnects, 1);
    }
}
