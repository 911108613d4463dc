//! # DHT22 thermometer.
//!
//! This will output a temperature and humidity reading via `defmt` every few seconds, from a
//! DHT22 with its data line on GP2 (with a pull-up to 3.3V). The on-board LED on GP25 blinks at
//! the same time.
//!
//! Run with `DEFMT_LOG=info cargo run`.
//!
//! See the `Cargo.toml` file for Copyright and license details.
#![no_std]
#![no_main]

// For logging via defmt
use defmt_rtt as _;

// The macro for our start-up function
use rp_pico::entry;

// GPIO traits
use embedded_hal::digital::OutputPin;

// Ensure we halt the program on panic (if we don't mention this crate it won't
// be linked)
use panic_halt as _;

// Time handling traits:
use embedded_hal::delay::DelayNs;

// A shorter alias for the Peripheral Access Crate, which provides low-level
// register access
use rp_pico::hal::pac;

// A shorter alias for the Hardware Abstraction Layer, which provides
// higher-level drivers.
use rp_pico::hal;

use dht22_driver::{Clock, OpenDrain, SensorLink};

/// The RP2040 timer counts microseconds in 64 bits. The driver wants a wrapping millisecond
/// counter.
struct Millis(hal::Timer);

impl Clock for Millis {
    fn now_ms(&mut self) -> u32 {
        (self.0.get_counter().ticks() / 1_000) as u32
    }
}

/// Entry point to our bare-metal application.
///
/// The `#[entry]` macro ensures the Cortex-M start-up code calls this function
/// as soon as all global variables are initialised.
///
/// The function configures the RP2040 peripherals, then blinks the LED in an
/// infinite loop, logging a reading from the DHT22 each time.
#[entry]
fn main() -> ! {
    // Grab our singleton objects
    let mut pac = pac::Peripherals::take().unwrap();

    // Set up the watchdog driver - needed by the clock setup code
    let mut watchdog = hal::Watchdog::new(pac.WATCHDOG);

    // Configure the clocks
    //
    // The default is to generate a 125 MHz system clock
    let clocks = hal::clocks::init_clocks_and_plls(
        rp_pico::XOSC_CRYSTAL_FREQ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();

    // The timer is both the delay and, through `Millis`, the clock of the DHT22 driver. It is
    // `Copy`, so every user gets its own handle.
    let mut timer = hal::Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);

    // The single-cycle I/O block controls our GPIO pins
    let sio = hal::Sio::new(pac.SIO);

    // Set the pins up according to their function on this particular board
    let pins = rp_pico::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    // Set the LED to be an output
    let mut led_pin = pins.led.into_push_pull_output();

    // InOutPin emulates an open-drain pin: high releases the line, low drives it.
    let data_pin = hal::gpio::InOutPin::new(pins.gpio2.into_pull_up_input());

    // Each poll of the line takes roughly 60 cycles at 125 MHz.
    let timing = dht22_driver::Timing {
        cycles_per_poll: 60,
        cpu_hz: 125_000_000,
        ..dht22_driver::Timing::DEFAULT
    };
    let config = dht22_driver::Config::new().with_timing(timing);
    let mut dht22 = SensorLink::with_config(OpenDrain::new(data_pin), Millis(timer), timer, config);
    dht22.initialize();
    defmt::info!("setup done");

    // Blink the LED and log a reading every 3 seconds.
    loop {
        led_pin.set_high().unwrap();
        timer.delay_ms(1_500);

        match dht22.measure() {
            Ok(reading) => {
                defmt::info!("temperature: {}", reading.temperature);
                defmt::info!("humidity: {}", reading.relative_humidity);
            }
            Err(dht22_driver::Error::Handshake) => defmt::warn!("no answer from the DHT22"),
            Err(dht22_driver::Error::Checksum { .. }) => defmt::warn!("corrupted DHT22 frame"),
            Err(dht22_driver::Error::Pin(_)) => defmt::warn!("DHT22 data pin error"),
        }

        led_pin.set_low().unwrap();
        timer.delay_ms(1_500);
    }
}
