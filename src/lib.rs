//! Driver for BJJCZ LMC-class galvanometer laser marking controllers.
//!
//! The controller buffers drawing commands into the board's native
//! 0xC00-byte list packets, interleaves them with immediate realtime
//! commands, and runs submitted jobs on a background spooler thread.
//!
//! ```no_run
//! use lmc_galvo::{GalvoController, Settings};
//!
//! let controller = GalvoController::new(Settings::default());
//! controller.marking(|c| {
//!     c.goto(0x5000, 0x5000)?;
//!     c.mark(0x5000, 0xA000)?;
//!     c.mark(0xA000, 0xA000)?;
//!     c.mark(0xA000, 0x5000)?;
//!     c.mark(0x5000, 0x5000)
//! })?;
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod codec;
pub mod connection;
pub mod consts;
pub mod controller;
pub mod correction;
pub mod settings;
pub mod spooler;

pub use connection::{Connection, MockConnection, UsbConnection};
pub use controller::{GalvoController, LaserConfiguration, ParameterOverrides};
pub use correction::CorTable;
pub use settings::{LaserSource, Settings};
pub use spooler::{Command, Job, command_stream_job};
