#![cfg_attr(not(test), no_std)]
//! DHT22 (AM2302) driver.
//!
//! The DHT22 talks over a single data line with a pull-up. There is no clock and no framing
//! beyond pulse lengths: the host pulls the line low to ask for a measurement, then the sensor
//! answers with a start-of-transmission handshake followed by 40 data bits, 5 bytes in total:
//!
//! ```text
//! [humidity high] [humidity low] [temperature high] [temperature low] [checksum]
//! ```
//!
//! Every bit is a low phase followed by a high phase. A short high phase (~26 µs) after the
//! ~50 µs low phase is a `0`, a long one (~70 µs) is a `1`. The driver doesn't measure either
//! phase in absolute time. It counts polls of the line for both phases and compares the two
//! counts, which cancels out the fixed cost of the polling loop itself.
//!
//! Example:
//!
//! ```
//! # use dht22_driver::{Clock, Error, OpenDrain, SensorLink};
//! # use embedded_hal_mock::eh1::delay::NoopDelay;
//! # use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction};
//! # struct Millis(u32);
//! # impl Clock for Millis {
//! #     fn now_ms(&mut self) -> u32 {
//! #         self.0
//! #     }
//! # }
//! # // Release for the settle time, request pulse, then the sensor's handshake.
//! # let mut expectations = vec![
//! #     Transaction::set(State::High),
//! #     Transaction::set(State::Low),
//! #     Transaction::set(State::High),
//! #     Transaction::get(State::Low),
//! #     Transaction::get(State::High),
//! #     Transaction::get(State::Low),
//! # ];
//! # // 65.2 %RH, 35.1 °C and the checksum. A 1 has a longer high phase than low phase.
//! # for byte in [0x02u8, 0x8C, 0x01, 0x5F, 0xEE] {
//! #     for i in 0..8 {
//! #         expectations.push(Transaction::get(State::Low));
//! #         expectations.push(Transaction::get(State::High));
//! #         if byte & (0x80 >> i) != 0 {
//! #             expectations.push(Transaction::get(State::High));
//! #             expectations.push(Transaction::get(State::High));
//! #         }
//! #         expectations.push(Transaction::get(State::Low));
//! #     }
//! # }
//! # let pin = PinMock::new(&expectations);
//! # let millis = Millis(0);
//! # let delay = NoopDelay::new();
//! // `pin` is any embedded-hal 1.0 `InputPin + OutputPin` wired open-drain, `millis` is
//! // something implementing `dht22_driver::Clock`, `delay` implements `DelayNs`.
//! let mut dht22 = SensorLink::new(OpenDrain::new(pin), millis, delay);
//! dht22.initialize();
//!
//! let temperature = dht22.read_temperature();
//! let humidity = dht22.read_relative_humidity();
//! assert_eq!(temperature, 35.1);
//! assert_eq!(humidity, 65.2);
//!
//! // Or, to tell a failed read apart from a genuine 0.0:
//! match dht22.measure() {
//!     Ok(reading) => assert_eq!(reading.temperature, 35.1),
//!     Err(Error::Handshake) => { /* the sensor didn't answer */ }
//!     Err(Error::Checksum { .. }) => { /* the frame was corrupted */ }
//!     Err(Error::Pin(_)) => { /* the HAL reported an error */ }
//! }
//! # let mut pin = dht22.release().into_inner();
//! # pin.done();
//! ```
//!
//! Below is the flow of a single read request. Reads happen on demand, from `initialize`,
//! `read_temperature`, `read_relative_humidity` and `measure`, and are rate limited: the
//! sensor returns garbage when polled more often than about once a second.
//!
//! ```text
//!             Read requested
//!                  │
//!                  ▼
//!     First use, or > 2000 ms since ──► No ──► Return stored reading
//!        the last transaction?
//!                  │
//!                  ▼
//!                 Yes
//!                  │
//!                  ▼
//!     First use ─► Yes ─► Input with pull-up, wait 1000 ms
//!                  │                      │
//!                  ▼                      │
//!     Output, drive low, wait 2 ms   ◄────┘
//!     Input with pull-up
//!                  │
//!                  ▼
//!        Enter critical section
//!                  │
//!                  ▼
//!  Wait low, wait high, wait low ─► Timeout ─────┐
//!                  │                             │
//!                  ▼                             │
//!  40x: count low phase, count high phase        │
//!       bit = high > low                         │
//!                  │                             │
//!                  ▼                             │
//!        Leave critical section  ◄───────────────┘
//!                  │
//!                  ▼
//!     Store transaction timestamp
//!                  │
//!                  ▼
//!         Checksum good ─► No ─► Readings 0.0 / 0.0
//!                  │
//!                  ▼
//!                 Yes
//!                  │
//!                  ▼
//!     humidity = int16(b0, b1) / 10
//!     temperature = int16(b2, b3) / 10
//! ```
//!
//! Interrupts are masked through the [`critical-section`](https://docs.rs/critical-section)
//! crate during the handshake and the 40 bits. The application has to link an implementation.
//! The HAL usually provides one, for example rp2040-hal's `critical-section-impl` feature. On
//! single-core chips whose HAL doesn't, `cortex-m`'s `critical-section-single-core` will do.
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin, PinState};

/// Number of bytes in a frame sent by the sensor.
pub const FRAME_LEN: usize = 5;

/// Number of data bits in a frame.
pub const FRAME_BITS: usize = FRAME_LEN * 8;

/// The single data line the DHT22 is connected to.
///
/// Besides reading and writing the level (from `InputPin` and `OutputPin`), the driver needs to
/// turn the line around between driving it and listening to it. HALs that have a flexible pin
/// type can implement this directly. For a pin that is already open-drain with a pull-up, wrap
/// it in [`OpenDrain`].
pub trait Line: InputPin + OutputPin {
    /// Configure the line as a push-pull output.
    fn set_output_mode(&mut self) -> Result<(), Self::Error>;

    /// Configure the line as an input with the pull-up enabled.
    fn set_input_pull_up_mode(&mut self) -> Result<(), Self::Error>;
}

/// A [`Line`] for an open-drain pin with a pull-up resistor.
///
/// An open-drain pin can always be read, so switching to output is a no-op and "input with
/// pull-up" means releasing the line, which is what driving it high does.
#[derive(Debug)]
pub struct OpenDrain<P> {
    pin: P,
}

impl<P> OpenDrain<P> {
    /// Wrap an open-drain pin.
    pub fn new(pin: P) -> Self {
        OpenDrain { pin }
    }

    /// Give back the wrapped pin.
    pub fn into_inner(self) -> P {
        self.pin
    }
}

impl<P: ErrorType> ErrorType for OpenDrain<P> {
    type Error = P::Error;
}

impl<P: InputPin> InputPin for OpenDrain<P> {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.pin.is_high()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.pin.is_low()
    }
}

impl<P: OutputPin> OutputPin for OpenDrain<P> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.pin.set_low()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.pin.set_high()
    }
}

impl<P: InputPin + OutputPin> Line for OpenDrain<P> {
    fn set_output_mode(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_input_pull_up_mode(&mut self) -> Result<(), Self::Error> {
        self.pin.set_high()
    }
}

/// A free-running millisecond counter, like Arduino's `millis()`.
///
/// The counter is allowed to wrap around at `u32::MAX`; the driver only ever looks at the
/// difference between two values, see [`elapsed_ms`].
pub trait Clock {
    /// Milliseconds since some fixed point, usually boot.
    fn now_ms(&mut self) -> u32;
}

/// Milliseconds between `since` and `now`, correct across one wraparound of the clock.
///
/// ```
/// assert_eq!(dht22_driver::elapsed_ms(u32::MAX - 9, 20), 30);
/// ```
pub fn elapsed_ms(since: u32, now: u32) -> u32 {
    now.wrapping_sub(since)
}

/// Decide a data bit from the poll counts of its low and high phases.
///
/// The sensor always sends the same ~50 µs low phase; a `1` has a longer high phase than that,
/// a `0` a shorter one. A tie is a `0`.
pub fn decode_bit(low_polls: u32, high_polls: u32) -> bool {
    high_polls > low_polls
}

/// Timing parameters.
///
/// All of these are calibration values. The defaults are the values for a 16 MHz AVR, where one
/// iteration of the polling loop costs about 50 CPU cycles. On another target, set `cpu_hz` and
/// measure `cycles_per_poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub struct Timing {
    /// How long to wait for an edge before giving up, in µs.
    pub timeout_us: u32,
    /// CPU cycles one iteration of the polling loop takes.
    pub cycles_per_poll: u32,
    /// CPU clock frequency in Hz.
    pub cpu_hz: u32,
    /// A new transaction only happens when more than this many ms have passed since the last.
    pub min_interval_ms: u32,
    /// Wait after first use, before the first transaction.
    pub settle_delay_ms: u32,
    /// How long the line is held low to request a measurement.
    pub request_low_ms: u32,
}

impl Timing {
    /// 300 µs edge timeout at 50 cycles per poll on a 16 MHz CPU, 2 s between transactions,
    /// 1 s settle time, 2 ms request pulse.
    pub const DEFAULT: Timing = Timing {
        timeout_us: 300,
        cycles_per_poll: 50,
        cpu_hz: 16_000_000,
        min_interval_ms: 2_000,
        settle_delay_ms: 1_000,
        request_low_ms: 2,
    };

    /// Number of polls that make up `timeout_us` on this CPU.
    ///
    /// Always at least one, so a wait reads the line at least once.
    pub const fn timeout_polls(&self) -> u32 {
        let per_poll = match self.timeout_us.checked_div(self.cycles_per_poll) {
            Some(quotient) => quotient,
            None => self.timeout_us,
        };
        let polls = per_poll as u64 * self.cpu_hz as u64 / 1_000_000;

        if polls == 0 {
            1
        } else if polls > u32::MAX as u64 {
            u32::MAX
        } else {
            polls as u32
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::DEFAULT
    }
}

/// What happens to the stored reading when a transaction fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum FailurePolicy {
    /// Both readings become 0.0.
    #[default]
    ResetToZero,
    /// The last valid reading is kept. `measure` still reports the failure.
    KeepLastGood,
}

/// Driver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub struct Config {
    /// Calibration and protocol timing.
    pub timing: Timing,
    /// What a failed transaction does to the stored reading.
    pub failure_policy: FailurePolicy,
}

impl Config {
    /// Default timing, readings reset to zero on failure.
    pub const fn new() -> Self {
        Config {
            timing: Timing::DEFAULT,
            failure_policy: FailurePolicy::ResetToZero,
        }
    }

    /// Replace the timing.
    pub const fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Replace the failure policy.
    pub const fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }
}

/// The five bytes received in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub struct RawFrame([u8; FRAME_LEN]);

impl RawFrame {
    /// The bytes in the order the sensor sent them.
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// Humidity in tenths of a percent.
    pub fn humidity_raw(&self) -> i16 {
        i16::from_be_bytes([self.0[0], self.0[1]])
    }

    /// Temperature in tenths of a degree Celsius.
    pub fn temperature_raw(&self) -> i16 {
        i16::from_be_bytes([self.0[2], self.0[3]])
    }

    /// The checksum byte sent by the sensor.
    pub fn checksum(&self) -> u8 {
        self.0[4]
    }

    /// The low 8 bits of the sum of the four data bytes.
    pub fn computed_checksum(&self) -> u8 {
        self.0[..4]
            .iter()
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
    }

    /// Whether the checksum byte matches the data bytes.
    pub fn is_valid(&self) -> bool {
        self.computed_checksum() == self.checksum()
    }

    /// Convert to a reading, if the checksum is good.
    pub fn reading(&self) -> Option<Reading> {
        if !self.is_valid() {
            return None;
        }

        Some(Reading {
            temperature: f32::from(self.temperature_raw()) / 10.0,
            relative_humidity: f32::from(self.humidity_raw()) / 10.0,
        })
    }
}

impl From<[u8; FRAME_LEN]> for RawFrame {
    fn from(bytes: [u8; FRAME_LEN]) -> Self {
        RawFrame(bytes)
    }
}

/// A temperature and humidity reading.
///
/// Both values have one decimal of resolution.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub struct Reading {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Percent relative humidity.
    pub relative_humidity: f32,
}

impl Reading {
    /// What the readings are before the first good transaction, and after a failed one.
    pub const ZERO: Reading = Reading {
        temperature: 0.0,
        relative_humidity: 0.0,
    };
}

/// Driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The line reported an error.
    Pin(E),
    /// The sensor didn't answer the request with the low-high-low start of transmission.
    Handshake,
    /// The received checksum doesn't match the data bytes. This is also what a frame with
    /// missed bits ends up as.
    Checksum { expected: u8, actual: u8 },
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pin(e) => write!(f, "line error: {e:?}"),
            Error::Handshake => write!(f, "sensor did not answer the start signal"),
            Error::Checksum { expected, actual } => write!(
                f,
                "checksum mismatch: computed {expected:#04x}, received {actual:#04x}"
            ),
        }
    }
}

/// A DHT22 on the line `L`.
///
/// Reads go through the sensor at most once per `min_interval_ms`; in between, the stored
/// reading is returned. Any read may therefore block for a transaction (a few ms), and the very
/// first one also waits out the settle time (a second, by default).
///
/// Nothing is done on the line until the first read.
pub struct SensorLink<L, C, D>
where
    L: Line,
    C: Clock,
    D: DelayNs,
{
    line: L,
    clock: C,
    delay: D,
    config: Config,
    timeout_polls: u32,
    frame: RawFrame,
    last_read_ms: u32,
    first_use: bool,
    reading: Reading,
    last_error: Option<Error<L::Error>>,
}

impl<L, C, D> SensorLink<L, C, D>
where
    L: Line,
    C: Clock,
    D: DelayNs,
{
    /// Create the driver with the default configuration.
    pub fn new(line: L, clock: C, delay: D) -> Self {
        Self::with_config(line, clock, delay, Config::default())
    }

    /// Create the driver with a custom configuration, for example timing calibrated for
    /// another CPU.
    pub fn with_config(line: L, clock: C, delay: D, config: Config) -> Self {
        SensorLink {
            line,
            clock,
            delay,
            config,
            timeout_polls: config.timing.timeout_polls(),
            frame: RawFrame::default(),
            last_read_ms: 0,
            first_use: true,
            reading: Reading::ZERO,
            last_error: None,
        }
    }

    /// Take the first measurement now, including the settle time, so that later reads are fast.
    pub fn initialize(&mut self) {
        self.capture_if_due();
    }

    /// Temperature in °C. 0.0 if the last transaction failed.
    pub fn read_temperature(&mut self) -> f32 {
        self.capture_if_due();
        self.reading.temperature
    }

    /// Relative humidity in %. 0.0 if the last transaction failed.
    pub fn read_relative_humidity(&mut self) -> f32 {
        self.capture_if_due();
        self.reading.relative_humidity
    }

    /// Read both values, reporting a failed transaction as an error instead of 0.0.
    ///
    /// Like the other reads, this only talks to the sensor when a transaction is due. Otherwise
    /// it returns the outcome of the last one again.
    pub fn measure(&mut self) -> Result<Reading, Error<L::Error>>
    where
        L::Error: Clone,
    {
        self.capture_if_due();
        match &self.last_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.reading),
        }
    }

    /// The stored reading. Doesn't touch the sensor.
    pub fn reading(&self) -> Reading {
        self.reading
    }

    /// The frame from the last transaction, valid or not.
    pub fn last_frame(&self) -> RawFrame {
        self.frame
    }

    /// The configuration the driver was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Milliseconds since the last transaction.
    pub fn time_since_last_read(&mut self) -> u32 {
        elapsed_ms(self.last_read_ms, self.clock.now_ms())
    }

    /// Destroys this driver and releases the line `L`.
    pub fn release(self) -> L {
        self.line
    }

    fn capture_if_due(&mut self) {
        if !self.first_use && self.time_since_last_read() <= self.config.timing.min_interval_ms
        {
            return;
        }

        let outcome = self.transact();
        // Stamped whether or not the transaction worked.
        self.last_read_ms = self.clock.now_ms();

        #[cfg(feature = "use-defmt")]
        defmt::debug!("dht22: transaction at {=u32} ms", self.last_read_ms);

        self.store(outcome);
    }

    /// One full bus transaction. Leaves what was received in `self.frame`.
    fn transact(&mut self) -> Result<Reading, Error<L::Error>> {
        let timing = self.config.timing;
        self.frame = RawFrame::default();

        if self.first_use {
            self.first_use = false;
            self.line.set_input_pull_up_mode().map_err(Error::Pin)?;
            self.delay.delay_ms(timing.settle_delay_ms);
        }

        // Request pulse.
        self.line.set_output_mode().map_err(Error::Pin)?;
        self.line.set_low().map_err(Error::Pin)?;
        self.delay.delay_ms(timing.request_low_ms);
        self.line.set_input_pull_up_mode().map_err(Error::Pin)?;

        let mut bytes = [0u8; FRAME_LEN];
        let received = critical_section::with(|_cs| self.receive(&mut bytes));
        self.frame = RawFrame::from(bytes);
        received?;

        self.frame.reading().ok_or(Error::Checksum {
            expected: self.frame.computed_checksum(),
            actual: self.frame.checksum(),
        })
    }

    /// Handshake and 40 bits. Must run with interrupts masked.
    fn receive(&mut self, bytes: &mut [u8; FRAME_LEN]) -> Result<(), Error<L::Error>> {
        // Start of transmission: the sensor pulls low for 80 µs, then high for 80 µs, then
        // starts the first bit by pulling low again.
        for level in [PinState::Low, PinState::High, PinState::Low] {
            if self.wait_for_level(level).map_err(Error::Pin)?.is_none() {
                return Err(Error::Handshake);
            }
        }

        for bit in 0..FRAME_BITS {
            let Some(low_polls) = self.wait_for_level(PinState::High).map_err(Error::Pin)? else {
                #[cfg(feature = "use-defmt")]
                defmt::trace!("dht22: bit {=usize} low phase timed out", bit);
                continue;
            };
            let Some(high_polls) = self.wait_for_level(PinState::Low).map_err(Error::Pin)? else {
                #[cfg(feature = "use-defmt")]
                defmt::trace!("dht22: bit {=usize} high phase timed out", bit);
                continue;
            };

            // MSB first.
            if decode_bit(low_polls, high_polls) {
                bytes[bit / 8] |= 0x80 >> (bit % 8);
            }
        }

        Ok(())
    }

    /// Poll the line until it is at `level`.
    ///
    /// Returns how many polls that took, or `None` after `timeout_polls` polls without seeing
    /// it.
    fn wait_for_level(&mut self, level: PinState) -> Result<Option<u32>, L::Error> {
        for polls in 1..=self.timeout_polls {
            let reached = match level {
                PinState::High => self.line.is_high()?,
                PinState::Low => self.line.is_low()?,
            };
            if reached {
                return Ok(Some(polls));
            }
        }

        Ok(None)
    }

    fn store(&mut self, outcome: Result<Reading, Error<L::Error>>) {
        match outcome {
            Ok(reading) => {
                self.reading = reading;
                self.last_error = None;
            }
            Err(error) => {
                #[cfg(feature = "use-defmt")]
                match &error {
                    Error::Pin(_) => defmt::warn!("dht22: line error"),
                    Error::Handshake => defmt::warn!("dht22: no handshake from sensor"),
                    Error::Checksum { expected, actual } => defmt::warn!(
                        "dht22: checksum mismatch, computed {=u8:#x} received {=u8:#x}",
                        *expected,
                        *actual
                    ),
                }

                if self.config.failure_policy == FailurePolicy::ResetToZero {
                    self.reading = Reading::ZERO;
                }
                self.last_error = Some(error);
            }
        }
    }
}
