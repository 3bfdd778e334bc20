//! Server configuration loading and validation

mod settings;

pub use settings::{
    HeartbeatSettings, LimitsSettings, ListenSettings, Settings,
};
