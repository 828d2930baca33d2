// Interactive LED + TWI demo
//
// Runs the polling loop on a worker thread and reads button presses from
// stdin: `1` fires one TWI transaction, `2` starts/stops the frenzy, `q` quits.

use clap::Parser;
use ioio_simple::{
    BoardConnector, CancelToken, ChannelUi, ControlPanel, LoopRunner, LooperConfig, Session,
    SerialLinkConfig, SharedControls, SimpleLooper, SimulatedBoard, SystemClock, Transport,
    TwiConfig, TwiHandlePolicy, TwiRate, UiEvent,
};
use std::io::BufRead;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "simple_app")]
#[command(about = "Blink the board LED and poke a TWI peripheral")]
struct Args {
    /// Serial port of the board (auto-detected when omitted)
    #[arg(short, long)]
    port: Option<String>,

    /// Run against an in-memory board instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Tick interval in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval: u64,

    /// TWI peripheral address
    #[arg(short, long, default_value_t = 0)]
    address: u16,

    /// TWI clock in kHz (100, 400 or 1000)
    #[arg(long, default_value_t = 100)]
    khz: u32,

    /// Serial baud rate
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// How long to wait for the board's prompt, in milliseconds
    #[arg(long, default_value_t = 1000)]
    reply_timeout_ms: u64,

    /// Initialisation attempts before giving up on the port
    #[arg(long, default_value_t = 3)]
    connect_attempts: u32,

    /// Keep the TWI master open for the whole session
    #[arg(long)]
    hold_bus: bool,

    /// Print the analog input on every tick
    #[arg(long)]
    sample_analog: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn print_events(events: Receiver<UiEvent>) {
    for event in events {
        match event {
            UiEvent::Enabled(true) => println!("[board connected, buttons enabled]"),
            UiEvent::Enabled(false) => println!("[board disconnected, buttons disabled]"),
            UiEvent::Transaction(report) => {
                println!("output: {}", report.request_text().escape_debug());
                println!("input:  {}", report.response_text().escape_debug());
            }
            UiEvent::TransactionFailed(error) => println!("transaction failed: {}", error),
            UiEvent::AnalogSample(value) => println!("analog: {:.3}", value),
        }
    }
}

fn run_loop<T: Transport + 'static>(
    runner: &LoopRunner<SystemClock>,
    connect: impl FnMut() -> Result<Session<T>, String>,
    looper_config: LooperConfig,
    controls: Arc<SharedControls>,
    mut ui: ChannelUi,
) {
    let mut looper = SimpleLooper::new(looper_config, controls);
    runner.run_reconnecting(connect, &mut looper, &mut ui);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let Some(rate) = TwiRate::from_khz(args.khz) else {
        eprintln!("Invalid TWI rate: {} kHz. Use 100, 400 or 1000", args.khz);
        std::process::exit(1);
    };

    let looper_config = LooperConfig::default()
        .device_address(args.address)
        .twi_module(
            0,
            TwiConfig {
                rate,
                smbus_levels: false,
            },
        )
        .sample_analog(args.sample_analog)
        .handle_policy(if args.hold_bus {
            TwiHandlePolicy::PerSession
        } else {
            TwiHandlePolicy::PerTransaction
        });

    let controls = SharedControls::new(looper_config.initial_led_level);
    let panel = ControlPanel::new(Arc::clone(&controls));
    let (ui, events) = ChannelUi::new();
    let cancel = CancelToken::new();

    let runner = LoopRunner::new(SystemClock::new(), cancel.clone())
        .with_interval(Duration::from_millis(args.interval));

    let worker = if args.simulate {
        thread::spawn(move || {
            run_loop(
                &runner,
                || Ok(Session::new(SimulatedBoard::new())),
                looper_config,
                controls,
                ui,
            );
        })
    } else {
        let port = args.port.clone();
        let link = SerialLinkConfig {
            baud_rate: args.baud,
            reply_timeout: Duration::from_millis(args.reply_timeout_ms),
            connect_attempts: args.connect_attempts,
            ..SerialLinkConfig::default()
        };
        thread::spawn(move || {
            run_loop(
                &runner,
                || {
                    Session::connect(|| BoardConnector::connect(port.as_deref(), &link))
                        .map_err(|e| e.to_string())
                },
                looper_config,
                controls,
                ui,
            );
        })
    };
    let printer = thread::spawn(move || print_events(events));

    println!("1 = single TWI transaction, 2 = {}, q = quit", panel.repeat_label());
    for line in std::io::stdin().lock().lines() {
        match line?.trim() {
            "1" => panel.press_single_shot(),
            "2" => println!("button 2 now reads '{}'", panel.press_repeat()),
            "q" => break,
            "" => {}
            other => println!("unknown command '{}'", other),
        }
    }

    cancel.cancel();
    let _ = worker.join();
    let _ = printer.join();
    Ok(())
}
