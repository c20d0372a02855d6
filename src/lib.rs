//! # daqcore
//!
//! Real-time core of an instrument data-acquisition controller: a single
//! cooperative main loop that merges a pushed event stream, a polled
//! instrument bus and I2C housekeeping into one sequenced 34-byte frame
//! stream, while running the legacy DLE command protocol.
//!
//! ## Features
//!
//! - **Bounded rings**: every queue is statically sized, with explicit
//!   overwrite or refuse-on-full behaviour
//! - **Event boundary scanning**: packets are recovered from a raw byte
//!   stream by trailer search and header probing
//! - **Frame multiplexing**: priority-ordered packing into frames with two
//!   independent consumers and drop accounting
//! - **Command protocol**: per-source parsers, queues, priority forwarding
//!   and self-addressed command interpretation
//! - **Housekeeping**: table-driven I2C sensor collection into a
//!   double-buffered 72-byte record
//!
//! ## Quick Start
//!
//! ```rust
//! use daqcore::sim::SimBoard;
//! use daqcore::{ControllerConfig, DaqController};
//!
//! let mut controller = DaqController::new(ControllerConfig::default()).unwrap();
//! let mut board = SimBoard::default();
//!
//! // One fixed-size coprocessor event packet.
//! controller.on_event_bytes(&[0xDB, 0x00, 0xFF, 0x01, 0x02, 0x03, 0xFF, 0x00, 0xFF]);
//! board.run(&mut controller, 4);
//!
//! assert_eq!(board.primary.writes().len(), 1);
//! ```
//!
//! ## Architecture
//!
//! - [`controller`] - main-loop pass and interrupt-side entry points
//! - [`ring`] - bounded ring channel shared by every path
//! - [`event`] - event stream receiver and boundary scanner
//! - [`poller`] - instrument bus request/response poller
//! - [`frame`], [`mux`] - frame ring and packet multiplexer
//! - [`command`] - DLE command protocol engine
//! - [`i2c`], [`housekeeping`] - I2C scheduler and sensor collection
//! - [`lowrate`] - science-data summary packet
//! - [`hal`] - collaborator traits the board implements
//! - [`sim`] - simulated board for hosts and tests

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod command;
pub mod config;
pub mod controller;
pub mod counters;
pub mod event;
pub mod frame;
pub mod hal;
pub mod housekeeping;
pub mod i2c;
pub mod lowrate;
pub mod mux;
pub mod poller;
pub mod ring;
pub mod sim;

// Re-export main public types for convenience
pub use command::{CommandEngine, CommandSource, CommandWord};
pub use config::ControllerConfig;
pub use controller::{ControllerError, ControllerStatus, DaqController, PassReport};
pub use frame::FrameOutput;
pub use hal::Hardware;
pub use housekeeping::HousekeepingRecord;
pub use ring::RingChannel;
