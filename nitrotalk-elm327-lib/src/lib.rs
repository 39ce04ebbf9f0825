//! ELM327 protocol implementation for OBD2 telemetry
//!
//! This library holds the hardware-agnostic half of the adapter conversation:
//! framing the notification byte stream into lines, classifying what the
//! adapter says, decoding Mode 01 data into a telemetry snapshot, and the
//! command catalog used to initialize and poll the adapter. A simulated
//! adapter is included so the rest of the stack can be exercised on a host.

pub mod commands;
pub mod framer;
pub mod multiframe;
pub mod pid;
pub mod response;
pub mod simulator;
pub mod telemetry;

pub use commands::{InitProfile, InitStep, Pid, Settle};
pub use framer::{Frame, LineFramer, Terminator, LINE_CAPACITY};
pub use multiframe::{split_line_number, strip_line_number, MultiFrameAssembler};
pub use pid::{decode_mode01, PidValue, PidValues};
pub use response::{classify, starts_with_mode01_ack, AdapterError, Response};
pub use simulator::{SimulatedAdapter, VehicleState};
pub use telemetry::{Field, Gear, Reading, Telemetry, TelemetryValues};
