mod align;
mod position;
mod reader;
mod segments;
pub mod types;

use std::error::Error;
use std::path::Path;

// Re-export types
pub use types::*;

pub use align::{
    align_dio_bridge, align_precision, correct_timestamps_for_lag,
    estimate_camera_to_rec_lag, find_acquisition_timing_pause, frame_rate,
    unwrap_frame_counts, AlignedFrames, FRAME_COUNT_PERIOD, NANOSECONDS_PER_SECOND,
};
pub use position::{
    find_camera_dio_channel, find_camera_dio_channel_per_epoch, load_video_timestamps,
    resolve_epoch, VideoTimestamps, CAMERA_TICKS_MARKER, MIN_EPOCH_TICKS,
};
pub use segments::{
    detect_repeat_timestamps, find_large_frame_jumps, label_spans, segment_breaks,
    DEFAULT_MIN_FRAME_JUMP,
};

/// Loads a Trodes sidecar file and returns a struct representation
///
/// # Examples
///
/// ```no_run
/// use trodes_importer::load;
///
/// let result = load("path/to/your/file.cameraHWSync");
/// match result {
///     Ok(file) => println!("Records read: {}", file.num_records),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load<P: AsRef<Path>>(file_path: P) -> Result<TrodesFile, Box<dyn Error>> {
    Ok(reader::load_file(file_path)?)
}
