//! # IOIO Simple
//!
//! The control loop of the IOIO "simple app": one button fires a single TWI
//! transaction, another toggles a stream of them, and an LED on the board
//! follows the UI's output level.
//!
//! ## Pieces
//!
//! - **Session** ([`Session`]): one connection to the board, handing out
//!   typed handles for digital outputs, analog inputs and TWI masters.
//! - **Polling loop** ([`SimpleLooper`] driven by a [`LoopRunner`]): reads the
//!   mode and LED level from [`SharedControls`], runs at most one bus
//!   transaction, writes the LED and sleeps for the tick interval.
//! - **Bus transaction** ([`transact`]): one write-then-read exchange with
//!   fixed request and response sizes.
//!
//! Boards are reached through a [`Transport`]: [`SerialBoard`] talks to the
//! bridge firmware's command shell over a serial port, [`SimulatedBoard`] runs
//! in memory.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ioio_simple::{
//!     CancelToken, ChannelUi, ControlPanel, LoopRunner, LooperConfig, ManualClock, Session,
//!     SharedControls, SimpleLooper, SimulatedBoard, UiEvent,
//! };
//!
//! let board = SimulatedBoard::new();
//! let monitor = board.monitor();
//!
//! let controls = SharedControls::new(true);
//! let panel = ControlPanel::new(Arc::clone(&controls));
//! let mut looper = SimpleLooper::new(LooperConfig::default(), controls);
//! let (mut ui, events) = ChannelUi::new();
//!
//! // Virtual time: press the button once, stop after half a second.
//! let clock = ManualClock::new();
//! let cancel = CancelToken::new();
//! let stop = cancel.clone();
//! panel.press_single_shot();
//! clock.on_sleep(move |now| {
//!     if now >= Duration::from_millis(500) {
//!         stop.cancel();
//!     }
//! });
//!
//! let runner = LoopRunner::new(clock, cancel);
//! runner.run_session(Session::new(board), &mut looper, &mut ui);
//!
//! assert_eq!(monitor.stats().transfers, 1);
//! let report = events
//!     .try_iter()
//!     .find_map(|e| match e {
//!         UiEvent::Transaction(report) => Some(report),
//!         _ => None,
//!     })
//!     .unwrap();
//! assert_eq!(report.response_text(), "IOIO of size 4");
//! ```

pub mod board_connector;
pub mod board_terminal;
pub mod bus_transaction;
pub mod controls;
pub mod looper;
pub mod runner;
pub mod serial_board;
pub mod session;
pub mod sim;
pub mod transport;
pub mod ui;

// Re-export the main types for convenience
pub use transport::{BusFault, ChannelId, PinId, Transport, TransportError, TwiConfig, TwiRate, LED_PIN};

pub use session::{AnalogInputHandle, DigitalOutputHandle, Session, SessionState, TwiMasterHandle};

pub use bus_transaction::{transact, BusError, BusMaster, TransactionReport, TwiHandlePolicy};

pub use controls::{ControlPanel, Mode, SharedControls};

pub use looper::{Looper, LooperConfig, SimpleLooper};

pub use runner::{
    CancelToken, Clock, LoopDriver, LoopPhase, LoopRunner, ManualClock, SystemClock, TeardownReason,
    DEFAULT_TICK_INTERVAL,
};

pub use ui::{ChannelUi, UiEvent, UiSink};

pub use board_terminal::{BoardTerminal, BoardTerminalError, SerialLinkConfig};

pub use board_connector::{BoardConnector, BoardConnectorError, BoardDevice};

pub use serial_board::SerialBoard;

pub use sim::{SimMonitor, SimStats, SimulatedBoard};
