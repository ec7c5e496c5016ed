// Pin monitor example
//
// Finds the board (or opens the given port), pushes the pin configuration
// from the settings file and prints every pin update for a while.

use clap::Parser;
use pinlink::{MessageSource, PinController, PinRef};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Watch the pins of a serial-connected board")]
struct Args {
    /// Serial port to open instead of probing every port
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate; defaults to the one in the settings file
    #[arg(short, long)]
    baud: Option<u32>,

    /// Settings file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// How long to watch, in seconds
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Drive this pin high before watching (e.g. 13 or A2)
    #[arg(long)]
    set_high: Option<PinRef>,

    /// Print raw serial traffic
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let controller = PinController::new(&args.config);
    controller.start()?;

    controller.transport().on_connection_changed(|connected| {
        println!("connection: {}", if *connected { "up" } else { "down" });
    });
    if args.raw {
        controller.transport().on_message(|msg| {
            println!("[{}] {}", msg.source.as_str(), msg.text);
        });
    } else {
        controller.transport().on_message(|msg| {
            if msg.source == MessageSource::Error {
                eprintln!("error: {}", msg.text);
            }
        });
    }

    match &args.port {
        Some(port) => controller.connect(port, args.baud)?,
        None => {
            println!("Probing serial ports...");
            let Some(port) = controller.find_device_port(Duration::from_secs(3)) else {
                println!("No device found. Check the cable or pass --port.");
                return Ok(());
            };
            println!("Device found on {port}");
        }
    }

    controller.apply_settings()?;
    if let Some(pin) = args.set_high {
        controller.pins().write_digital(pin, true)?;
    }

    controller.pins().subscribe(|update| println!("{update:?}"));
    let interval = Duration::from_millis(args.interval_ms);
    controller.start_digital_polling(interval)?;
    controller.start_analog_polling(interval)?;

    thread::sleep(Duration::from_secs(args.seconds));

    let stats = controller.transport().stats();
    println!(
        "sent {} lines, received {} lines",
        stats.sent_count, stats.received_count
    );
    controller.shutdown();
    Ok(())
}
