//! The per-session control logic
//!
//! A [`Looper`] is set up once per session and then ticked at a fixed cadence
//! by a [`LoopDriver`](crate::runner::LoopDriver). [`SimpleLooper`] is the
//! demo logic: blink the LED and fire TWI transactions on request.

use std::sync::Arc;

use crate::bus_transaction::{BusError, BusMaster, TransactionReport, TwiHandlePolicy};
use crate::controls::{Mode, SharedControls};
use crate::session::{AnalogInputHandle, DigitalOutputHandle, Session};
use crate::transport::{PinId, Transport, TransportError, TwiConfig, LED_PIN};
use crate::ui::UiSink;

/// Hooks called by the loop driver over one session's lifetime.
pub trait Looper<T: Transport> {
    /// Open the peripherals this looper needs.
    fn setup(&mut self, session: &Session<T>) -> Result<(), TransportError>;

    /// One pass of the control loop. An error ends the session.
    fn tick(&mut self, session: &Session<T>, ui: &mut dyn UiSink) -> Result<(), TransportError>;

    /// Release everything opened in `setup`. Called once per session.
    fn disconnected(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct LooperConfig {
    pub led_pin: PinId,
    pub initial_led_level: bool,
    pub analog_pin: PinId,
    /// Report an analog reading to the UI on every tick.
    pub sample_analog: bool,
    pub twi_module: u8,
    pub twi: TwiConfig,
    pub device_address: u16,
    pub request: Vec<u8>,
    pub response_len: usize,
    pub handle_policy: TwiHandlePolicy,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            led_pin: LED_PIN,
            initial_led_level: true,
            analog_pin: 40,
            sample_analog: false,
            twi_module: 0,
            twi: TwiConfig::default(),
            device_address: 0,
            request: vec![0x01],
            response_len: 4,
            handle_policy: TwiHandlePolicy::PerTransaction,
        }
    }
}

impl LooperConfig {
    pub fn led_pin(mut self, pin: PinId) -> Self {
        self.led_pin = pin;
        self
    }

    pub fn analog_pin(mut self, pin: PinId) -> Self {
        self.analog_pin = pin;
        self
    }

    pub fn sample_analog(mut self, enabled: bool) -> Self {
        self.sample_analog = enabled;
        self
    }

    pub fn twi_module(mut self, module: u8, twi: TwiConfig) -> Self {
        self.twi_module = module;
        self.twi = twi;
        self
    }

    pub fn device_address(mut self, address: u16) -> Self {
        self.device_address = address;
        self
    }

    pub fn exchange(mut self, request: Vec<u8>, response_len: usize) -> Self {
        self.request = request;
        self.response_len = response_len;
        self
    }

    pub fn handle_policy(mut self, policy: TwiHandlePolicy) -> Self {
        self.handle_policy = policy;
        self
    }
}

pub struct SimpleLooper<T: Transport> {
    config: LooperConfig,
    controls: Arc<SharedControls>,
    led: Option<DigitalOutputHandle<T>>,
    input: Option<AnalogInputHandle<T>>,
    bus: BusMaster<T>,
}

impl<T: Transport> SimpleLooper<T> {
    pub fn new(config: LooperConfig, controls: Arc<SharedControls>) -> Self {
        let bus = BusMaster::new(config.twi_module, config.twi, config.handle_policy);
        Self {
            config,
            controls,
            led: None,
            input: None,
            bus,
        }
    }

    pub fn config(&self) -> &LooperConfig {
        &self.config
    }

    /// Run the exchange and hand the outcome to the UI. Only a lost
    /// connection is passed back to the caller.
    fn fire_transaction(
        &mut self,
        session: &Session<T>,
        mode: Mode,
        ui: &mut dyn UiSink,
    ) -> Result<(), TransportError> {
        let request_len = self.config.request.len();
        let outcome = self.bus.exchange(
            session,
            self.config.device_address,
            &self.config.request,
            request_len,
            self.config.response_len,
        );

        if mode == Mode::SingleShot {
            self.controls.transition_mode(Mode::SingleShot, Mode::Idle);
        }

        match outcome {
            Ok(response) => {
                let report = TransactionReport {
                    mode,
                    address: self.config.device_address,
                    request: self.config.request.clone(),
                    response,
                };
                log::info!("{}", report);
                ui.transaction_completed(&report);
                if self.controls.mode() != Mode::Idle {
                    self.controls.toggle_led();
                }
                Ok(())
            }
            Err(BusError::ConnectionLost { reason }) => Err(TransportError::ConnectionLost { reason }),
            Err(e) => {
                log::warn!("TWI transaction failed: {}", e);
                ui.transaction_failed(&e);
                Ok(())
            }
        }
    }
}

impl<T: Transport> Looper<T> for SimpleLooper<T> {
    fn setup(&mut self, session: &Session<T>) -> Result<(), TransportError> {
        self.led = Some(session.open_digital_output(self.config.led_pin, self.config.initial_led_level)?);
        self.input = Some(session.open_analog_input(self.config.analog_pin)?);
        log::info!(
            "Looper ready: LED on pin {}, analog input on pin {}",
            self.config.led_pin,
            self.config.analog_pin
        );
        Ok(())
    }

    fn tick(&mut self, session: &Session<T>, ui: &mut dyn UiSink) -> Result<(), TransportError> {
        let mode = self.controls.mode();
        if mode != Mode::Idle {
            self.fire_transaction(session, mode, ui)?;
        }

        if self.config.sample_analog {
            if let Some(input) = self.input.as_mut() {
                let value = input.read()?;
                ui.analog_sampled(value);
            }
        }

        let led = self
            .led
            .as_mut()
            .ok_or_else(|| TransportError::Rejected("tick before setup".to_string()))?;
        led.write(self.controls.led_level())
    }

    fn disconnected(&mut self) {
        self.bus.release();
        if let Some(led) = self.led.take() {
            if let Err(e) = led.close() {
                log::debug!("Closing LED output failed: {}", e);
            }
        }
        if let Some(input) = self.input.take() {
            if let Err(e) = input.close() {
                log::debug!("Closing analog input failed: {}", e);
            }
        }
    }
}
