//! # MightyWatt Core Library
//!
//! Control library for the MightyWatt R3 programmable electronic load. It
//! speaks the device's binary serial protocol, keeps the latest telemetry,
//! runs timed test programs and stops the load when a safety limit is hit.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: wire format. Command ids, run modes, header encoding, the
//!   16-byte telemetry frame and its CRC16/CCITT.
//! - **`transport`**: the serial link with bounded reads and writes, plus the
//!   `Connector` seam used to open it.
//! - **`device`**: device model (`DeviceCapabilities`, `TelemetrySample`,
//!   `DeviceSettings`) and the protocol `Engine` with its poll loop and
//!   outbound command queue.
//! - **`program`**: program items (constant, ramp, pin) and the `Scheduler`
//!   that executes them.
//! - **`watchdog`**: value and series resistance power watchdogs.
//! - **`load`**: `ElectronicLoad`, which wires the engine, scheduler and
//!   watchdogs together.
//! - **`events`**: `LoadEvent` notifications broadcast to observers.
//! - **`config`** / **`logging`**: figment configuration and tracing setup.
//! - **`error`**: the `LoadError` enum shared by everything above.
//!
//! ## Example
//!
//! ```no_run
//! use mightywatt::load::ElectronicLoad;
//! use mightywatt::protocol::RunMode;
//!
//! # async fn demo() -> mightywatt::error::LoadResult<()> {
//! let load = ElectronicLoad::default();
//! load.connect("/dev/ttyACM0", 2).await?;
//! load.set(RunMode::Current, 0.5)?;
//! println!("{:.3} V", load.sample().voltage);
//! load.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod load;
pub mod logging;
pub mod program;
pub mod protocol;
pub mod transport;
pub mod watchdog;

pub use error::{LoadError, LoadResult};
pub use events::{EventBus, LoadEvent};
pub use load::ElectronicLoad;
