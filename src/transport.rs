//! Peripheral transport abstraction
//!
//! A [`Transport`] is the opaque link to the board's firmware. It knows how to
//! open typed sub-channels and move bytes through them, nothing more. The
//! [`Session`](crate::session::Session) layered on top tracks connection state
//! and handle validity.

use std::fmt;

/// Identifier the transport hands out for every opened sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Pin number on the board header.
pub type PinId = u8;

/// Pin wired to the on-board status LED.
pub const LED_PIN: PinId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TwiRate {
    #[default]
    Rate100Khz,
    Rate400Khz,
    Rate1Mhz,
}

impl TwiRate {
    pub fn as_khz(&self) -> u32 {
        match self {
            TwiRate::Rate100Khz => 100,
            TwiRate::Rate400Khz => 400,
            TwiRate::Rate1Mhz => 1000,
        }
    }

    pub fn from_khz(khz: u32) -> Option<Self> {
        match khz {
            100 => Some(TwiRate::Rate100Khz),
            400 => Some(TwiRate::Rate400Khz),
            1000 => Some(TwiRate::Rate1Mhz),
            _ => None,
        }
    }
}

/// Settings for opening a TWI master module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TwiConfig {
    pub rate: TwiRate,
    /// Use SMBus voltage thresholds instead of plain I2C levels.
    pub smbus_levels: bool,
}

/// Failure reported by a single addressed transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusFault {
    #[error("peripheral at 0x{address:02x} did not acknowledge")]
    Nack { address: u16 },

    #[error("bus arbitration lost")]
    ArbitrationLost,

    #[error("bus fault: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link to the board is gone. Every handle is dead after this.
    #[error("connection to the board was lost: {reason}")]
    ConnectionLost { reason: String },

    /// The transfer reached the bus but the peripheral side failed.
    #[error("TWI transfer failed: {0}")]
    Bus(#[from] BusFault),

    /// The board refused the command (unknown pin, channel already in use, ...).
    #[error("board rejected command: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn lost(reason: impl Into<String>) -> Self {
        TransportError::ConnectionLost {
            reason: reason.into(),
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost { .. })
    }
}

/// The vendor link to a peripheral controller.
///
/// Implementations are driven from a single worker thread, so every method
/// takes `&mut self`. Once a method returns
/// [`TransportError::ConnectionLost`] the transport is considered dead.
pub trait Transport: Send {
    fn open_digital_output(
        &mut self,
        pin: PinId,
        initial_level: bool,
    ) -> Result<ChannelId, TransportError>;

    fn write_digital(&mut self, channel: ChannelId, level: bool) -> Result<(), TransportError>;

    fn open_analog_input(&mut self, pin: PinId) -> Result<ChannelId, TransportError>;

    /// Read the analog channel, normalised to `0.0..=1.0`.
    fn read_analog(&mut self, channel: ChannelId) -> Result<f32, TransportError>;

    fn open_twi_master(&mut self, module: u8, config: TwiConfig) -> Result<ChannelId, TransportError>;

    /// Write `request`, then fill `response` from the peripheral at `address`.
    fn twi_write_read(
        &mut self,
        channel: ChannelId,
        address: u16,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<(), TransportError>;

    fn close(&mut self, channel: ChannelId) -> Result<(), TransportError>;

    /// Drop the link. Must be safe to call more than once.
    fn disconnect(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open_digital_output(
        &mut self,
        pin: PinId,
        initial_level: bool,
    ) -> Result<ChannelId, TransportError> {
        (**self).open_digital_output(pin, initial_level)
    }

    fn write_digital(&mut self, channel: ChannelId, level: bool) -> Result<(), TransportError> {
        (**self).write_digital(channel, level)
    }

    fn open_analog_input(&mut self, pin: PinId) -> Result<ChannelId, TransportError> {
        (**self).open_analog_input(pin)
    }

    fn read_analog(&mut self, channel: ChannelId) -> Result<f32, TransportError> {
        (**self).read_analog(channel)
    }

    fn open_twi_master(&mut self, module: u8, config: TwiConfig) -> Result<ChannelId, TransportError> {
        (**self).open_twi_master(module, config)
    }

    fn twi_write_read(
        &mut self,
        channel: ChannelId,
        address: u16,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<(), TransportError> {
        (**self).twi_write_read(channel, address, request, response)
    }

    fn close(&mut self, channel: ChannelId) -> Result<(), TransportError> {
        (**self).close(channel)
    }

    fn disconnect(&mut self) {
        (**self).disconnect();
    }
}
