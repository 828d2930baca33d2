// Basic device discovery and connection example
//
// This example shows how to discover IOIO boards and open a session on one.

use ioio_simple::{BoardConnector, SerialLinkConfig, Session, LED_PIN};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("IOIO Board Discovery Example");
    println!("============================\n");

    println!("1. Discovering available boards...");
    let devices = BoardConnector::get_available_devices()?;

    if devices.is_empty() {
        println!("No IOIO boards found. Please connect a board and try again.");
        return Ok(());
    }

    println!("Found {} board(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!("  {}. {} at {}", i + 1, device.name, device.port);
    }
    println!();

    println!("2. Connecting to first available board...");
    let session = Session::connect(|| BoardConnector::connect(None, &SerialLinkConfig::default()))?;
    println!("Successfully connected!");

    println!("\n3. Testing basic communication...");
    let mut led = session.open_digital_output(LED_PIN, true)?;
    led.write(false)?;
    println!("LED switched on (the on-board LED is active low)");
    led.close()?;

    session.disconnect();
    println!("\n4. Connection test completed successfully!");

    Ok(())
}
