/// Microscope scanner library
///
/// Raster focus-stack scanning on a Klipper/Moonraker stage with a Raspberry
/// Pi camera: grid planning, camera arbitration, per-point capture, storage
/// offload and the scan controller that ties them together.

pub mod config_loader;
pub mod motion;
pub mod camera;
pub mod arbiter;
pub mod grid;
pub mod offload;
pub mod capture;
pub mod calibration;
pub mod preview;
pub mod controller;
pub mod control;
pub mod mock;
