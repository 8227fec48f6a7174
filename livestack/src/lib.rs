//! Live stacking of astronomical exposures.
//!
//! Frames dropped into an input directory are classified by acquisition setup, calibrated
//! against the matching dark and flat composites, aligned and merged into a durable
//! running composite per setup. LIGHT composites are rendered and streamed to viewers.

pub mod broadcast;
pub mod calibration;
pub mod capabilities;
pub mod config;
pub mod fits;
pub mod frame;
pub mod ingest;
pub mod keyer;
pub mod log_stream;
pub mod pipeline;
pub mod server;
pub mod store;

#[cfg(test)]
mod test_utils;
