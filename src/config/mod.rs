pub mod settings;

pub use settings::{AppSettings, RelayConfig};
