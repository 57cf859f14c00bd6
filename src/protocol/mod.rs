pub mod close_codes;
pub mod control;
pub mod frames;
pub mod viewer;

pub use control::{ControlCommand, ControlEvent, ControlHandshake};
pub use frames::{DataHandshake, FrameError, ProducerFrame, RelayFrame, SnapshotResponse};
pub use viewer::{SetupAction, ViewerEvent, ViewerRequest};
