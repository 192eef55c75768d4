// Library exports for integration testing and binary
pub mod audio;
pub mod config;
pub mod detector;
pub mod pitch;
pub mod session;
pub mod song;
pub mod trainer;
