pub mod gateway;
pub mod loader;

pub use gateway::{
    ApiConfig, DatabaseConfig, GatewayConfig, LogConfig, MediaConfig, RecordConfig,
    ScheduleConfig, SequenceConfig, SipConfig, StreamConfig,
};
pub use loader::ConfigLoader;
