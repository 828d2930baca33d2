//! State shared between the UI thread and the polling loop
//!
//! The UI writes the mode and the desired LED level, the loop reads them once
//! per tick. Both live in a [`SharedControls`] cell of atomics that each side
//! holds through an `Arc`.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// What the loop should do on the bus each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Idle,
    /// One transaction, then back to idle.
    SingleShot,
    /// One transaction per tick until switched off.
    Repeating,
}

impl Mode {
    fn to_raw(self) -> u8 {
        match self {
            Mode::Idle => 0,
            Mode::SingleShot => 1,
            Mode::Repeating => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Mode::SingleShot,
            2 => Mode::Repeating,
            _ => Mode::Idle,
        }
    }
}

/// Label of the repeat button while the loop is idle.
pub const START_REPEAT_LABEL: &str = "I2C Frenzy!";
/// Label of the repeat button while transactions repeat.
pub const STOP_REPEAT_LABEL: &str = "Stop this Frenzy!";

#[derive(Debug)]
pub struct SharedControls {
    mode: AtomicU8,
    led_level: AtomicBool,
}

impl SharedControls {
    pub fn new(led_level: bool) -> Arc<Self> {
        Arc::new(Self {
            mode: AtomicU8::new(Mode::Idle.to_raw()),
            led_level: AtomicBool::new(led_level),
        })
    }

    pub fn mode(&self) -> Mode {
        Mode::from_raw(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode.to_raw(), Ordering::Release);
    }

    /// Move from `expected` to `next`; returns false if the mode changed
    /// underneath the caller.
    pub fn transition_mode(&self, expected: Mode, next: Mode) -> bool {
        self.mode
            .compare_exchange(
                expected.to_raw(),
                next.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn led_level(&self) -> bool {
        self.led_level.load(Ordering::Acquire)
    }

    pub fn set_led_level(&self, level: bool) {
        self.led_level.store(level, Ordering::Release);
    }

    /// Flip the LED level and return the new value.
    pub fn toggle_led(&self) -> bool {
        !self.led_level.fetch_xor(true, Ordering::AcqRel)
    }
}

/// The two buttons of the demo screen.
#[derive(Debug, Clone)]
pub struct ControlPanel {
    controls: Arc<SharedControls>,
}

impl ControlPanel {
    pub fn new(controls: Arc<SharedControls>) -> Self {
        Self { controls }
    }

    /// Ask the loop for exactly one transaction and flip the LED with it.
    pub fn press_single_shot(&self) {
        log::debug!("Single shot requested");
        self.controls.set_mode(Mode::SingleShot);
        self.controls.toggle_led();
    }

    /// Start or stop repeating transactions. Returns the new button label.
    pub fn press_repeat(&self) -> &'static str {
        if self.controls.transition_mode(Mode::Repeating, Mode::Idle) {
            log::debug!("Repeating transactions stopped");
            START_REPEAT_LABEL
        } else {
            self.controls.set_mode(Mode::Repeating);
            log::debug!("Repeating transactions started");
            STOP_REPEAT_LABEL
        }
    }

    /// Label the repeat button should currently show.
    pub fn repeat_label(&self) -> &'static str {
        match self.controls.mode() {
            Mode::Repeating => STOP_REPEAT_LABEL,
            Mode::Idle | Mode::SingleShot => START_REPEAT_LABEL,
        }
    }

    pub fn controls(&self) -> &Arc<SharedControls> {
        &self.controls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trips_through_cell() {
        let controls = SharedControls::new(true);
        assert_eq!(controls.mode(), Mode::Idle);
        controls.set_mode(Mode::Repeating);
        assert_eq!(controls.mode(), Mode::Repeating);
    }

    #[test]
    fn test_transition_only_from_expected_mode() {
        let controls = SharedControls::new(true);
        controls.set_mode(Mode::SingleShot);
        assert!(!controls.transition_mode(Mode::Repeating, Mode::Idle));
        assert_eq!(controls.mode(), Mode::SingleShot);
        assert!(controls.transition_mode(Mode::SingleShot, Mode::Idle));
        assert_eq!(controls.mode(), Mode::Idle);
    }

    #[test]
    fn test_toggle_led_returns_new_level() {
        let controls = SharedControls::new(true);
        assert!(!controls.toggle_led());
        assert!(controls.toggle_led());
        assert!(controls.led_level());
    }

    #[test]
    fn test_repeat_button_flips_label() {
        let panel = ControlPanel::new(SharedControls::new(true));
        assert_eq!(panel.repeat_label(), START_REPEAT_LABEL);
        assert_eq!(panel.press_repeat(), STOP_REPEAT_LABEL);
        assert_eq!(panel.controls().mode(), Mode::Repeating);
        assert_eq!(panel.press_repeat(), START_REPEAT_LABEL);
        assert_eq!(panel.controls().mode(), Mode::Idle);
    }

    #[test]
    fn test_single_shot_flips_led() {
        let panel = ControlPanel::new(SharedControls::new(true));
        panel.press_single_shot();
        assert_eq!(panel.controls().mode(), Mode::SingleShot);
        assert!(!panel.controls().led_level());
    }

    #[test]
    fn test_single_shot_overrides_repeating() {
        let panel = ControlPanel::new(SharedControls::new(true));
        panel.press_repeat();
        panel.press_single_shot();
        assert_eq!(panel.controls().mode(), Mode::SingleShot);
        assert_eq!(panel.repeat_label(), START_REPEAT_LABEL);
    }
}
