use ndarray::Array1;
use std::collections::HashMap;
use std::path::Path;

use crate::align::{self, unwrap_frame_counts};
use crate::reader;
use crate::segments::{self, DEFAULT_MIN_FRAME_JUMP};
use crate::types::*;

/// Substring identifying the camera exposure pulse train among DIO channels.
pub const CAMERA_TICKS_MARKER: &str = "camera ticks";

/// Minimum camera ticks required inside an epoch for regression alignment.
pub const MIN_EPOCH_TICKS: usize = 100;

// Field names in camera HW sync files.
const POS_TIMESTAMP_FIELD: &str = "PosTimestamp";
const FRAME_COUNT_FIELD: &str = "frameCount";
const HW_TIMESTAMP_FIELD: &str = "HWTimestamp";

// Field names in position tracking files: the time index plus one (x, y)
// column pair per tracked LED.
const TRACKING_TIME_FIELD: &str = "time";
const LED_FIELDS: [(&str, &str); 2] = [("xloc", "yloc"), ("xloc2", "yloc2")];

/// Camera frame timestamps for one epoch, loaded and segmented.
///
/// Rows inside detected breaks (segment label 0) are already removed; the
/// remaining parallel arrays all have the same length.
#[derive(Debug, Clone)]
pub struct VideoTimestamps {
    /// Local recorder clock index per frame (`PosTimestamp`)
    pub trodes_time: Vec<i64>,
    /// Unwrapped hardware frame counter per frame
    pub frame_count: Vec<i64>,
    /// Camera hardware timestamp per frame, nanoseconds
    pub hw_timestamp_ns: Vec<i64>,
    /// Original video frame index per frame (0-based, pre-filter)
    pub frame_index: Vec<u32>,
    /// Surviving segment label per frame, all positive
    pub labels: Vec<u32>,
    /// Sorted positive segment ids present
    pub segment_ids: Vec<u32>,
}

/// Reads a `.cameraHWSync` file and segments it at clock breaks.
///
/// Unwraps the 16-bit frame counter, attaches a 0-based video frame index,
/// runs the break detector against the local clock index and the frame
/// counter, and drops every sample inside a detected break.
pub fn load_video_timestamps<P: AsRef<Path>>(
    path: P,
    sink: &dyn DiagnosticSink,
) -> Result<VideoTimestamps, TrodesError> {
    let file = reader::load_file(path)?;
    if file.num_records == 0 {
        return Err(TrodesError::EmptyTimestamps);
    }

    let trodes_time = file.column(POS_TIMESTAMP_FIELD)?.as_i64().to_vec();
    let raw_frame_count = file.column(FRAME_COUNT_FIELD)?.as_i64().to_vec();
    let hw_timestamp_ns = file.column(HW_TIMESTAMP_FIELD)?.as_i64().to_vec();
    let frame_count = unwrap_frame_counts(&raw_frame_count);

    // Disconnects manifest as repeats in the local clock index
    let segment_labels = segments::segment_breaks(
        &trodes_time,
        &frame_count,
        DEFAULT_MIN_FRAME_JUMP,
        sink,
    );
    sink.info(&format!(
        "surviving segment ids: {:?}",
        segment_labels.segment_ids
    ));

    let kept: Vec<usize> = segment_labels
        .labels
        .iter()
        .enumerate()
        .filter_map(|(i, &l)| (l > 0).then_some(i))
        .collect();

    Ok(VideoTimestamps {
        trodes_time: kept.iter().map(|&i| trodes_time[i]).collect(),
        frame_count: kept.iter().map(|&i| frame_count[i]).collect(),
        hw_timestamp_ns: kept.iter().map(|&i| hw_timestamp_ns[i]).collect(),
        frame_index: kept.iter().map(|&i| i as u32).collect(),
        labels: kept.iter().map(|&i| segment_labels.labels[i]).collect(),
        segment_ids: segment_labels.segment_ids,
    })
}

/// Tracked LED positions keyed on the local clock index.
#[derive(Debug, Clone)]
struct TrackedPositions {
    /// Local clock index per tracked row, repeats removed
    time: Vec<i64>,
    /// One (x, y) value pair list per LED present in the file
    leds: Vec<(Vec<f64>, Vec<f64>)>,
}

/// Reads a `.videoPositionTracking` file, dropping repeated timestamps.
fn load_position_tracking<P: AsRef<Path>>(path: P) -> Result<TrackedPositions, TrodesError> {
    let file = reader::load_file(path)?;
    let time = file.column(TRACKING_TIME_FIELD)?.as_i64().to_vec();
    let is_repeat = segments::detect_repeat_timestamps(&time);
    let kept: Vec<usize> = is_repeat
        .iter()
        .enumerate()
        .filter_map(|(i, &r)| (!r).then_some(i))
        .collect();

    let mut leds = Vec::new();
    for (x_name, y_name) in LED_FIELDS {
        if file.columns.contains_key(x_name) && file.columns.contains_key(y_name) {
            let x = file.column(x_name)?.as_f64();
            let y = file.column(y_name)?.as_f64();
            leds.push((
                kept.iter().map(|&i| x[i]).collect(),
                kept.iter().map(|&i| y[i]).collect(),
            ));
        }
    }

    Ok(TrackedPositions {
        time: kept.iter().map(|&i| time[i]).collect(),
        leds,
    })
}

/// Left-joins tracked positions onto the video rows selected by alignment.
///
/// The number of video frames can differ from online tracking because
/// tracking can start late or stop early, and offline tracking skips frames
/// labeled bad. Video rows with no tracking match keep NaN positions;
/// tracking rows with no video match are dropped.
fn join_tracking(
    video_trodes_time: &[i64],
    rows: &[usize],
    tracking: &TrackedPositions,
) -> Vec<LedSeries> {
    let mut by_time: HashMap<i64, usize> = HashMap::with_capacity(tracking.time.len());
    for (i, &t) in tracking.time.iter().enumerate() {
        // First occurrence wins for any residual duplicate
        by_time.entry(t).or_insert(i);
    }

    tracking
        .leds
        .iter()
        .map(|(x, y)| {
            let mut out_x = Array1::from_elem(rows.len(), f64::NAN);
            let mut out_y = Array1::from_elem(rows.len(), f64::NAN);
            for (out_i, &row) in rows.iter().enumerate() {
                if let Some(&track_i) = by_time.get(&video_trodes_time[row]) {
                    out_x[out_i] = x[track_i];
                    out_y[out_i] = y[track_i];
                }
            }
            LedSeries { x: out_x, y: out_y }
        })
        .collect()
}

/// Finds the single camera-tick DIO channel by name.
///
/// Exactly one channel whose name contains `"camera ticks"` must exist;
/// multiple matches are an ambiguity error because multiple cameras without
/// a precision clock are unsupported, and zero matches make alignment
/// impossible.
pub fn find_camera_dio_channel(channels: &[DioChannel]) -> Result<&DioChannel, TrodesError> {
    let matches: Vec<&DioChannel> = channels
        .iter()
        .filter(|c| c.name.contains(CAMERA_TICKS_MARKER))
        .collect();
    match matches.len() {
        0 => Err(TrodesError::CameraChannelNotFound),
        1 => Ok(matches[0]),
        _ => Err(TrodesError::AmbiguousCameraChannel(
            matches.iter().map(|c| c.name.clone()).collect(),
        )),
    }
}

/// Finds camera-tick DIO timestamps for one epoch.
///
/// Searches channels whose name contains `"camera ticks"` and returns the
/// first one with more than [`MIN_EPOCH_TICKS`] edges inside
/// `[epoch_start, epoch_end]`, restricted to those bounds. Too few ticks in
/// every candidate means the channel or the epoch bounds are wrong, which is
/// fatal for the epoch.
pub fn find_camera_dio_channel_per_epoch(
    channels: &[DioChannel],
    epoch_start: f64,
    epoch_end: f64,
) -> Result<Array1<f64>, TrodesError> {
    let candidates: Vec<&DioChannel> = channels
        .iter()
        .filter(|c| c.name.contains(CAMERA_TICKS_MARKER))
        .collect();
    if candidates.is_empty() {
        return Err(TrodesError::CameraChannelNotFound);
    }

    let mut best = 0;
    for channel in candidates {
        let in_epoch: Vec<f64> = channel
            .timestamps
            .iter()
            .copied()
            .filter(|&t| t >= epoch_start && t <= epoch_end)
            .collect();
        if in_epoch.len() > MIN_EPOCH_TICKS {
            return Ok(Array1::from_vec(in_epoch));
        }
        best = best.max(in_epoch.len());
    }

    Err(TrodesError::InsufficientTicks {
        found: best,
        required: MIN_EPOCH_TICKS,
    })
}

/// Resolves one epoch's position data onto the reference clock.
///
/// Loads and segments the camera timestamps, aligns them through whichever
/// clock path applies, and joins tracked positions when a tracking file
/// exists. Without a tracking file the position series is empty but the
/// frame-index and segment-label series still cover every aligned frame.
///
/// The returned table is never mutated afterwards; the output time index,
/// LED series, frame indices, and segment labels all share one length.
pub fn resolve_epoch(
    source: &PositionSource,
    clock: &ClockSource,
    meters_per_pixel: f64,
    sink: &dyn DiagnosticSink,
) -> Result<PositionOutput, TrodesError> {
    let video = load_video_timestamps(source.timestamps_path(), sink)?;

    let aligned = match clock {
        ClockSource::Precision => align::align_precision(&video.hw_timestamp_ns, sink),
        ClockSource::DioBridge {
            rec_clock_times,
            sample_counts,
            dio_camera_times,
        } => align::align_dio_bridge(
            &video.trodes_time,
            &video.frame_count,
            &video.labels,
            &video.segment_ids,
            dio_camera_times,
            rec_clock_times,
            sample_counts,
            sink,
        )?,
    };

    let leds = match source {
        PositionSource::WithTracking { tracking, .. } => {
            let tracked = load_position_tracking(tracking)?;
            join_tracking(&video.trodes_time, &aligned.rows, &tracked)
        }
        PositionSource::TimestampOnly { .. } => Vec::new(),
    };

    let frame_index: Array1<u32> =
        aligned.rows.iter().map(|&r| video.frame_index[r]).collect();
    let segment_labels: Array1<u32> =
        aligned.rows.iter().map(|&r| video.labels[r]).collect();

    Ok(PositionOutput {
        times: aligned.times_s,
        leds,
        frame_index,
        segment_labels,
        meters_per_pixel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MPP: f64 = 0.002;

    fn write_camera_hw_sync(rows: &[(u32, u16, u64)]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "<Start settings>\nFields: <PosTimestamp uint32><frameCount uint16><HWTimestamp uint64>\n<End settings>\n"
        )
        .unwrap();
        for &(t, fc, hw) in rows {
            file.write_u32::<LittleEndian>(t).unwrap();
            file.write_u16::<LittleEndian>(fc).unwrap();
            file.write_u64::<LittleEndian>(hw).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn write_position_tracking(rows: &[(u32, u16, u16)]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "<Start settings>\nFields: <time uint32><xloc uint16><yloc uint16>\n<End settings>\n"
        )
        .unwrap();
        for &(t, x, y) in rows {
            file.write_u32::<LittleEndian>(t).unwrap();
            file.write_u16::<LittleEndian>(x).unwrap();
            file.write_u16::<LittleEndian>(y).unwrap();
        }
        file.flush().unwrap();
        file
    }

    /// Frames at 50 Hz with a three-sample jump window starting at row 100.
    ///
    /// Local clock at 1 kHz: frame i sits at sample count 1000 + 20 * i.
    fn synthetic_frames(n: usize) -> Vec<(u32, u16, u64)> {
        (0..n)
            .map(|i| {
                let trodes_time = 1000 + 20 * i as u32;
                let frame_count = if i < 100 {
                    i as u16
                } else if i < 103 {
                    (i + 21 * (i - 99)) as u16
                } else {
                    (i + 63) as u16
                };
                let hw = 1_001_000_000 + 20_000_000 * i as u64;
                (trodes_time, frame_count, hw)
            })
            .collect()
    }

    fn dio_with_pause(n_ticks: usize) -> Vec<f64> {
        // Five warm-up ticks, a 0.6 s calibration gap, then 50 Hz
        let mut ticks: Vec<f64> = (0..5).map(|i| 0.02 * i as f64).collect();
        for i in 0..n_ticks {
            ticks.push(0.68 + 0.02 * i as f64);
        }
        ticks
    }

    #[test]
    fn dio_bridge_end_to_end_two_segments() {
        let frames = synthetic_frames(220);
        let hw_file = write_camera_hw_sync(&frames);

        let rec_clock_times: Vec<f64> = (0..6000).map(|k| k as f64 * 0.001).collect();
        let sample_counts: Vec<i64> = (0..6000).collect();
        let dio = dio_with_pause(300);

        let source = PositionSource::TimestampOnly {
            timestamps: hw_file.path().to_path_buf(),
        };
        let clock = ClockSource::DioBridge {
            rec_clock_times: &rec_clock_times,
            sample_counts: &sample_counts,
            dio_camera_times: &dio,
        };

        let output = resolve_epoch(&source, &clock, MPP, &NullSink).unwrap();

        // The jump window (rows 100..103) is excluded, everything else kept
        assert_eq!(output.times.len(), 217);
        assert!(output.leds.is_empty());
        assert!(!output.frame_index.iter().any(|&f| (100..103).contains(&f)));

        // Exactly two surviving segments, in order
        let labels = output.segment_labels.to_vec();
        assert_eq!(labels[0], 1);
        assert_eq!(*labels.last().unwrap(), 2);
        let mut unique = labels.clone();
        unique.dedup();
        assert_eq!(unique, vec![1, 2]);

        // Corrected index is strictly increasing with no duplicates
        assert!(output.times.windows(2).into_iter().all(|w| w[0] < w[1]));
        assert_eq!(output.meters_per_pixel, MPP);
    }

    #[test]
    fn precision_path_joins_tracking_with_nan_gaps() {
        // 10 ms warm-up frames, a 0.6 s pause, then 20 ms frames
        let mut frames = Vec::new();
        for i in 0..4u64 {
            frames.push((100 + i as u32, i as u16, 10_000_000 * i));
        }
        for i in 0..8u64 {
            frames.push((
                200 + 20 * i as u32,
                (4 + i) as u16,
                630_000_000 + 20_000_000 * i,
            ));
        }
        let hw_file = write_camera_hw_sync(&frames);

        // Tracking covers only some post-pause frames, with one repeat
        let tracking_file = write_position_tracking(&[
            (200, 10, 11),
            (220, 20, 21),
            (220, 98, 99),
            (260, 30, 31),
            (999, 40, 41),
        ]);

        let source = PositionSource::WithTracking {
            timestamps: hw_file.path().to_path_buf(),
            tracking: tracking_file.path().to_path_buf(),
        };
        let output = resolve_epoch(&source, &ClockSource::Precision, MPP, &NullSink).unwrap();

        // Warm-up frames before the pause midpoint are gone
        assert_eq!(output.times.len(), 8);
        assert!((output.times[0] - 0.63).abs() < 1e-9);
        assert_eq!(output.frame_index.to_vec(), (4..12).collect::<Vec<u32>>());

        // One LED pair; matched rows carry positions, the rest NaN. The
        // repeated tracking timestamp keeps its first occurrence and the
        // unmatched tracking row (time 999) is dropped.
        assert_eq!(output.leds.len(), 1);
        let led = &output.leds[0];
        assert_eq!(led.x[0], 10.0);
        assert_eq!(led.x[1], 20.0);
        assert_eq!(led.y[1], 21.0);
        assert_eq!(led.x[3], 30.0);
        assert!(led.x[2].is_nan());
        assert!(led.x[4].is_nan());
    }

    #[test]
    fn timestamp_only_epoch_has_empty_position_series() {
        let frames: Vec<(u32, u16, u64)> = (0..6)
            .map(|i| (100 + i as u32, i as u16, 20_000_000 * i as u64))
            .collect();
        let hw_file = write_camera_hw_sync(&frames);
        let source = PositionSource::TimestampOnly {
            timestamps: hw_file.path().to_path_buf(),
        };
        let output = resolve_epoch(&source, &ClockSource::Precision, MPP, &NullSink).unwrap();
        assert!(output.leds.is_empty());
        // No pause in the stream: every frame is still recorded
        assert_eq!(output.frame_index.len(), 6);
        assert_eq!(output.segment_labels.len(), 6);
    }

    #[test]
    fn empty_timestamps_file_is_fatal() {
        let hw_file = write_camera_hw_sync(&[]);
        let source = PositionSource::TimestampOnly {
            timestamps: hw_file.path().to_path_buf(),
        };
        let err = resolve_epoch(&source, &ClockSource::Precision, MPP, &NullSink).unwrap_err();
        assert!(matches!(err, TrodesError::EmptyTimestamps));
    }

    #[test]
    fn camera_channel_ambiguity_is_fatal() {
        let channels = vec![
            DioChannel {
                name: "camera ticks 1".to_string(),
                timestamps: Array1::zeros(0),
            },
            DioChannel {
                name: "camera ticks 2".to_string(),
                timestamps: Array1::zeros(0),
            },
        ];
        let err = find_camera_dio_channel(&channels).unwrap_err();
        assert!(matches!(err, TrodesError::AmbiguousCameraChannel(_)));
    }

    #[test]
    fn camera_channel_not_found_is_fatal() {
        let channels = vec![DioChannel {
            name: "reward well".to_string(),
            timestamps: Array1::zeros(0),
        }];
        assert!(matches!(
            find_camera_dio_channel(&channels),
            Err(TrodesError::CameraChannelNotFound)
        ));
        assert!(matches!(
            find_camera_dio_channel_per_epoch(&channels, 0.0, 10.0),
            Err(TrodesError::CameraChannelNotFound)
        ));
    }

    #[test]
    fn epoch_channel_needs_enough_ticks_in_bounds() {
        let ticks: Array1<f64> = (0..300).map(|i| i as f64 * 0.02).collect();
        let channels = vec![DioChannel {
            name: "camera ticks".to_string(),
            timestamps: ticks,
        }];

        // 300 ticks span 6 s; a 1 s epoch holds only 51 of them
        let err = find_camera_dio_channel_per_epoch(&channels, 0.0, 1.0).unwrap_err();
        assert!(matches!(
            err,
            TrodesError::InsufficientTicks { found: 51, required: 100 }
        ));

        let in_epoch = find_camera_dio_channel_per_epoch(&channels, 0.0, 3.0).unwrap();
        assert_eq!(in_epoch.len(), 151);
        assert!(in_epoch.iter().all(|&t| (0.0..=3.0).contains(&t)));
    }

    #[test]
    fn epoch_channel_skips_candidate_with_too_few_ticks() {
        let sparse: Array1<f64> = (0..10).map(|i| i as f64).collect();
        let dense: Array1<f64> = (0..200).map(|i| i as f64 * 0.02).collect();
        let channels = vec![
            DioChannel {
                name: "camera ticks A".to_string(),
                timestamps: sparse,
            },
            DioChannel {
                name: "camera ticks B".to_string(),
                timestamps: dense,
            },
        ];
        let in_epoch = find_camera_dio_channel_per_epoch(&channels, 0.0, 4.0).unwrap();
        assert_eq!(in_epoch.len(), 200);
    }

    #[test]
    fn calibration_lookup_resolves_epoch_camera() {
        let mut calibration = CameraCalibration::default();
        calibration.meters_per_pixel.insert(3, MPP);
        calibration.epoch_to_camera.insert(1, 3);

        assert_eq!(calibration.meters_per_pixel_for_epoch(1).unwrap(), MPP);
        assert!(matches!(
            calibration.meters_per_pixel_for_epoch(2),
            Err(TrodesError::CameraNotFound { epoch: 2 })
        ));
    }
}
