//! [`Transport`] over the board's serial command shell
//!
//! | command                                   | reply        |
//! |-------------------------------------------|--------------|
//! | `dout <pin> <0/1>`                        | `ch <n>`     |
//! | `dwrite <ch> <0/1>`                       | empty        |
//! | `ain <pin>`                               | `ch <n>`     |
//! | `aread <ch>`                              | `0.000`–`1.000` |
//! | `twi <module> <khz> <smbus 0/1>`          | `ch <n>`     |
//! | `twixfer <ch> <addr> <hex request> <len>` | hex response |
//! | `close <ch>`                              | empty        |
//!
//! An empty `twixfer` request is sent as `-` so the line keeps four fields.
//!
//! Failures come back as `ERR <reason>`; transfer failures use `ERR nack`,
//! `ERR arbitration` or `ERR bus <detail>`.

use std::io::{Read, Write};

use crate::board_terminal::{BoardTerminal, BoardTerminalError};
use crate::transport::{BusFault, ChannelId, PinId, Transport, TransportError, TwiConfig};

pub struct SerialBoard<P: Read + Write + Send> {
    terminal: BoardTerminal<P>,
    alive: bool,
}

impl<P: Read + Write + Send> SerialBoard<P> {
    /// Wrap an initialised terminal.
    pub fn new(terminal: BoardTerminal<P>) -> Self {
        Self {
            terminal,
            alive: true,
        }
    }

    fn command(&mut self, command: &str) -> Result<String, TransportError> {
        if !self.alive {
            return Err(TransportError::lost("serial link already closed"));
        }

        self.terminal.exec(command, None).map_err(|e| {
            if e.is_link_failure() {
                self.alive = false;
            }
            link_error(e)
        })
    }

    fn open_channel(&mut self, command: &str) -> Result<ChannelId, TransportError> {
        let reply = self.command(command)?;
        parse_channel(&reply)
    }
}

fn link_error(e: BoardTerminalError) -> TransportError {
    match e {
        BoardTerminalError::Device(message) => TransportError::Rejected(message),
        e if e.is_link_failure() => TransportError::lost(e.to_string()),
        e => TransportError::Rejected(e.to_string()),
    }
}

fn parse_channel(reply: &str) -> Result<ChannelId, TransportError> {
    reply
        .strip_prefix("ch ")
        .and_then(|n| n.trim().parse().ok())
        .map(ChannelId)
        .ok_or_else(|| TransportError::Rejected(format!("unexpected reply '{}'", reply)))
}

fn bus_fault(address: u16, message: &str) -> BusFault {
    if message == "nack" {
        BusFault::Nack { address }
    } else if message == "arbitration" {
        BusFault::ArbitrationLost
    } else {
        BusFault::Other(message.strip_prefix("bus").unwrap_or(message).trim().to_string())
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hex payload as a single shell token.
fn payload_token(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        "-".to_string()
    } else {
        encode_hex(bytes)
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

impl<P: Read + Write + Send> Transport for SerialBoard<P> {
    fn open_digital_output(
        &mut self,
        pin: PinId,
        initial_level: bool,
    ) -> Result<ChannelId, TransportError> {
        self.open_channel(&format!("dout {} {}", pin, u8::from(initial_level)))
    }

    fn write_digital(&mut self, channel: ChannelId, level: bool) -> Result<(), TransportError> {
        self.command(&format!("dwrite {} {}", channel.0, u8::from(level)))?;
        Ok(())
    }

    fn open_analog_input(&mut self, pin: PinId) -> Result<ChannelId, TransportError> {
        self.open_channel(&format!("ain {}", pin))
    }

    fn read_analog(&mut self, channel: ChannelId) -> Result<f32, TransportError> {
        let reply = self.command(&format!("aread {}", channel.0))?;
        reply
            .parse()
            .map_err(|_| TransportError::Rejected(format!("unexpected analog reading '{}'", reply)))
    }

    fn open_twi_master(&mut self, module: u8, config: TwiConfig) -> Result<ChannelId, TransportError> {
        self.open_channel(&format!(
            "twi {} {} {}",
            module,
            config.rate.as_khz(),
            u8::from(config.smbus_levels)
        ))
    }

    fn twi_write_read(
        &mut self,
        channel: ChannelId,
        address: u16,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<(), TransportError> {
        let command = format!(
            "twixfer {} {} {} {}",
            channel.0,
            address,
            payload_token(request),
            response.len()
        );
        let reply = match self.command(&command) {
            Ok(reply) => reply,
            Err(TransportError::Rejected(message)) => return Err(bus_fault(address, &message).into()),
            Err(e) => return Err(e),
        };

        let bytes = decode_hex(&reply)
            .filter(|bytes| bytes.len() == response.len())
            .ok_or_else(|| TransportError::Rejected(format!("unexpected transfer reply '{}'", reply)))?;
        response.copy_from_slice(&bytes);
        Ok(())
    }

    fn close(&mut self, channel: ChannelId) -> Result<(), TransportError> {
        self.command(&format!("close {}", channel.0))?;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.alive {
            self.alive = false;
            if let Err(e) = self.terminal.send_reset() {
                log::debug!("Sending reset on disconnect failed: {}", e);
            }
        }
    }
}
