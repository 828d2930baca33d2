//! In-memory board
//!
//! [`SimulatedBoard`] implements [`Transport`] without any hardware. A cloned
//! [`SimMonitor`] stays with the caller after the board has been moved into a
//! session, so the board can be scripted and inspected from outside.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{BusFault, ChannelId, PinId, Transport, TransportError, TwiConfig};

/// Reply used for addresses without a scripted response.
const DEFAULT_TWI_REPLY: &[u8] = b"IOIO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimChannel {
    Digital(PinId),
    Analog(PinId),
    Twi(u8),
}

/// Counters collected by the simulated board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub opens: usize,
    pub closes: usize,
    pub twi_opens: usize,
    /// TWI masters currently open.
    pub twi_open_now: usize,
    /// Highest `twi_open_now` ever observed.
    pub twi_open_max: usize,
    pub transfers: usize,
    pub digital_writes: usize,
    pub analog_reads: usize,
    pub disconnects: usize,
}

#[derive(Debug, Default)]
struct SimState {
    next_channel: u32,
    channels: HashMap<ChannelId, SimChannel>,
    digital: HashMap<PinId, bool>,
    analog_value: f32,
    twi_replies: HashMap<u16, Vec<u8>>,
    pending_fault: Option<BusFault>,
    pending_close_error: Option<TransportError>,
    link_up: bool,
    drop_after_writes: Option<usize>,
    requests: Vec<(u16, Vec<u8>)>,
    stats: SimStats,
}

impl SimState {
    fn check_link(&self) -> Result<(), TransportError> {
        if self.link_up {
            Ok(())
        } else {
            Err(TransportError::lost("simulated link is down"))
        }
    }

    fn channel(&self, id: ChannelId) -> Result<SimChannel, TransportError> {
        self.channels
            .get(&id)
            .copied()
            .ok_or_else(|| TransportError::Rejected(format!("unknown channel {}", id)))
    }

    fn allocate(&mut self, channel: SimChannel) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        self.channels.insert(id, channel);
        self.stats.opens += 1;
        id
    }
}

/// Shared view into a [`SimulatedBoard`].
#[derive(Clone)]
pub struct SimMonitor {
    state: Arc<Mutex<SimState>>,
}

impl SimMonitor {
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    pub fn digital_level(&self, pin: PinId) -> Option<bool> {
        self.state.lock().digital.get(&pin).copied()
    }

    /// Every `(address, request)` pair seen by the bus, oldest first.
    pub fn requests(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().requests.clone()
    }

    pub fn set_twi_reply(&self, address: u16, reply: &[u8]) {
        self.state.lock().twi_replies.insert(address, reply.to_vec());
    }

    pub fn set_analog_value(&self, value: f32) {
        self.state.lock().analog_value = value.clamp(0.0, 1.0);
    }

    /// Make the next TWI transfer fail with `fault`.
    pub fn inject_bus_fault(&self, fault: BusFault) {
        self.state.lock().pending_fault = Some(fault);
    }

    /// Make the next channel close fail with `error`; the channel stays open.
    pub fn fail_next_close(&self, error: TransportError) {
        self.state.lock().pending_close_error = Some(error);
    }

    /// Pull the plug: every following operation reports a lost connection.
    pub fn drop_link(&self) {
        self.state.lock().link_up = false;
    }

    /// Pull the plug once `writes` more digital writes have gone through.
    pub fn drop_link_after_writes(&self, writes: usize) {
        self.state.lock().drop_after_writes = Some(writes);
    }
}

pub struct SimulatedBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                link_up: true,
                analog_value: 0.5,
                ..SimState::default()
            })),
        }
    }

    pub fn monitor(&self) -> SimMonitor {
        SimMonitor {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedBoard {
    fn open_digital_output(
        &mut self,
        pin: PinId,
        initial_level: bool,
    ) -> Result<ChannelId, TransportError> {
        let mut state = self.state.lock();
        state.check_link()?;
        state.digital.insert(pin, initial_level);
        Ok(state.allocate(SimChannel::Digital(pin)))
    }

    fn write_digital(&mut self, channel: ChannelId, level: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check_link()?;
        let SimChannel::Digital(pin) = state.channel(channel)? else {
            return Err(TransportError::Rejected(format!("{} is not an output", channel)));
        };

        state.digital.insert(pin, level);
        state.stats.digital_writes += 1;

        if let Some(remaining) = state.drop_after_writes.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.drop_after_writes = None;
                state.link_up = false;
            }
        }
        Ok(())
    }

    fn open_analog_input(&mut self, pin: PinId) -> Result<ChannelId, TransportError> {
        let mut state = self.state.lock();
        state.check_link()?;
        Ok(state.allocate(SimChannel::Analog(pin)))
    }

    fn read_analog(&mut self, channel: ChannelId) -> Result<f32, TransportError> {
        let mut state = self.state.lock();
        state.check_link()?;
        let SimChannel::Analog(_) = state.channel(channel)? else {
            return Err(TransportError::Rejected(format!("{} is not an input", channel)));
        };
        state.stats.analog_reads += 1;
        Ok(state.analog_value)
    }

    fn open_twi_master(&mut self, module: u8, _config: TwiConfig) -> Result<ChannelId, TransportError> {
        let mut state = self.state.lock();
        state.check_link()?;

        let busy = state
            .channels
            .values()
            .any(|c| *c == SimChannel::Twi(module));
        if busy {
            return Err(TransportError::Rejected(format!(
                "TWI module {} is already open",
                module
            )));
        }

        let id = state.allocate(SimChannel::Twi(module));
        state.stats.twi_opens += 1;
        state.stats.twi_open_now += 1;
        state.stats.twi_open_max = state.stats.twi_open_max.max(state.stats.twi_open_now);
        Ok(id)
    }

    fn twi_write_read(
        &mut self,
        channel: ChannelId,
        address: u16,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check_link()?;
        let SimChannel::Twi(_) = state.channel(channel)? else {
            return Err(TransportError::Rejected(format!("{} is not a TWI master", channel)));
        };

        state.stats.transfers += 1;
        state.requests.push((address, request.to_vec()));
        if let Some(fault) = state.pending_fault.take() {
            return Err(fault.into());
        }

        let reply = state
            .twi_replies
            .get(&address)
            .map_or(DEFAULT_TWI_REPLY, Vec::as_slice);
        for (dst, src) in response.iter_mut().zip(reply.iter().cycle()) {
            *dst = *src;
        }
        Ok(())
    }

    fn close(&mut self, channel: ChannelId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check_link()?;
        if let Some(error) = state.pending_close_error.take() {
            return Err(error);
        }
        let closed = state
            .channels
            .remove(&channel)
            .ok_or_else(|| TransportError::Rejected(format!("unknown channel {}", channel)))?;
        if let SimChannel::Twi(_) = closed {
            state.stats.twi_open_now -= 1;
        }
        state.stats.closes += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.link_up = false;
        state.channels.clear();
        state.stats.twi_open_now = 0;
        state.stats.disconnects += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reply_fills_buffer() {
        let mut board = SimulatedBoard::new();
        let ch = board.open_twi_master(0, TwiConfig::default()).unwrap();
        let mut response = [0u8; 6];
        board.twi_write_read(ch, 0x20, &[0x01], &mut response).unwrap();
        assert_eq!(&response, b"IOIOIO");
    }

    #[test]
    fn test_scripted_reply_and_fault() {
        let mut board = SimulatedBoard::new();
        let monitor = board.monitor();
        monitor.set_twi_reply(0x48, &[0x12, 0x34]);
        let ch = board.open_twi_master(0, TwiConfig::default()).unwrap();

        let mut response = [0u8; 2];
        board.twi_write_read(ch, 0x48, &[0x00], &mut response).unwrap();
        assert_eq!(response, [0x12, 0x34]);

        monitor.inject_bus_fault(BusFault::Nack { address: 0x48 });
        let err = board
            .twi_write_read(ch, 0x48, &[0x00], &mut response)
            .unwrap_err();
        assert!(matches!(err, TransportError::Bus(BusFault::Nack { address: 0x48 })));
        assert_eq!(monitor.stats().transfers, 2);
    }

    #[test]
    fn test_module_cannot_be_opened_twice() {
        let mut board = SimulatedBoard::new();
        board.open_twi_master(0, TwiConfig::default()).unwrap();
        assert!(matches!(
            board.open_twi_master(0, TwiConfig::default()),
            Err(TransportError::Rejected(_))
        ));
    }

    #[test]
    fn test_drop_after_writes() {
        let mut board = SimulatedBoard::new();
        let monitor = board.monitor();
        let ch = board.open_digital_output(0, false).unwrap();
        monitor.drop_link_after_writes(2);

        board.write_digital(ch, true).unwrap();
        board.write_digital(ch, false).unwrap();
        assert!(board.write_digital(ch, true).unwrap_err().is_connection_lost());
    }
}
