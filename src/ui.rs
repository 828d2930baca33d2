//! Notifications from the polling loop to the UI thread

use std::sync::mpsc;

use crate::bus_transaction::{BusError, TransactionReport};

/// Receiver of everything the loop wants the user to see.
pub trait UiSink: Send {
    /// Enable or grey out the controls.
    fn set_enabled(&mut self, enabled: bool);

    fn transaction_completed(&mut self, report: &TransactionReport);

    fn transaction_failed(&mut self, error: &BusError);

    fn analog_sampled(&mut self, _value: f32) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Enabled(bool),
    Transaction(TransactionReport),
    TransactionFailed(String),
    AnalogSample(f32),
}

/// Forwards loop notifications to another thread over a channel.
pub struct ChannelUi {
    tx: mpsc::Sender<UiEvent>,
}

impl ChannelUi {
    pub fn new() -> (Self, mpsc::Receiver<UiEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: UiEvent) {
        // A closed receiver only means nobody is watching anymore.
        if self.tx.send(event).is_err() {
            log::trace!("UI receiver gone, dropping event");
        }
    }
}

impl UiSink for ChannelUi {
    fn set_enabled(&mut self, enabled: bool) {
        self.send(UiEvent::Enabled(enabled));
    }

    fn transaction_completed(&mut self, report: &TransactionReport) {
        self.send(UiEvent::Transaction(report.clone()));
    }

    fn transaction_failed(&mut self, error: &BusError) {
        self.send(UiEvent::TransactionFailed(error.to_string()));
    }

    fn analog_sampled(&mut self, value: f32) {
        self.send(UiEvent::AnalogSample(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::Mode;

    #[test]
    fn test_events_arrive_in_order() {
        let (mut ui, rx) = ChannelUi::new();
        ui.set_enabled(true);
        ui.transaction_completed(&TransactionReport {
            mode: Mode::Repeating,
            address: 0,
            request: vec![1],
            response: vec![2],
        });
        ui.set_enabled(false);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], UiEvent::Enabled(true));
        assert!(matches!(events[1], UiEvent::Transaction(_)));
        assert_eq!(events[2], UiEvent::Enabled(false));
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (mut ui, rx) = ChannelUi::new();
        drop(rx);
        ui.set_enabled(true);
    }
}
