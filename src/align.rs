use ndarray::Array1;

use crate::types::{DiagnosticSink, TrodesError};

/// Nanoseconds per second, the internal time unit until final conversion.
pub const NANOSECONDS_PER_SECOND: f64 = 1e9;

/// The AVT camera hardware frame counter wraps to 0 above this value.
pub const FRAME_COUNT_PERIOD: i64 = u16::MAX as i64;

// Bounds of the deliberate acquisition timing pause inserted near the start
// of each epoch, in seconds.
const PAUSE_MIN_DURATION: f64 = 0.4;
const PAUSE_MAX_DURATION: f64 = 1.0;
// Precision-clock timestamps show a longer apparent gap at the pause.
const PAUSE_MAX_DURATION_PRECISION: f64 = 2.0;
// Number of leading samples searched for the pause.
const PAUSE_SEARCH_WINDOW: usize = 100;

/// Camera frames mapped onto the reference clock for one epoch.
///
/// `times_s` and `rows` have equal length; `rows[i]` is the index of the
/// retained sample in the aligner's input arrays whose reference-clock time
/// is `times_s[i]`.
#[derive(Debug, Clone)]
pub struct AlignedFrames {
    /// Reference-clock time per retained frame, in seconds
    pub times_s: Array1<f64>,
    /// Input-row index per retained frame, ascending
    pub rows: Vec<usize>,
}

/// Median sampling rate implied by a nanosecond timestamp sequence, in Hz.
///
/// Diagnostics only; the correction math never uses it.
pub fn frame_rate(timestamps_ns: &[i64]) -> f64 {
    if timestamps_ns.len() < 2 {
        return f64::NAN;
    }
    let mut diffs: Vec<f64> = timestamps_ns
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64)
        .collect();
    NANOSECONDS_PER_SECOND / median(&mut diffs)
}

/// Finds the midpoint time of the acquisition timing pause.
///
/// Scans successive differences of the first `n_search` samples for the first
/// gap whose duration lies strictly inside `(min_duration, max_duration)`
/// seconds, and returns the midpoint between its bounding samples. The pause
/// is inserted deliberately by the acquisition hardware as a landmark shared
/// across clock domains; everything before it is warm-up and is dropped from
/// alignment.
///
/// Returns [`TrodesError::PauseNotFound`] when no qualifying gap exists in
/// the search window. Callers treat that as "no pause present" and skip
/// trimming rather than failing the epoch.
pub fn find_acquisition_timing_pause(
    timestamps_ns: &[i64],
    min_duration: f64,
    max_duration: f64,
    n_search: usize,
) -> Result<i64, TrodesError> {
    let n = timestamps_ns.len().min(n_search);
    for i in 0..n.saturating_sub(1) {
        let gap = timestamps_ns[i + 1] - timestamps_ns[i];
        let gap_s = gap as f64 / NANOSECONDS_PER_SECOND;
        if gap_s > min_duration && gap_s < max_duration {
            return Ok(timestamps_ns[i] + gap / 2);
        }
    }
    Err(TrodesError::PauseNotFound)
}

/// Unwraps a 16-bit wrapping frame counter into a non-decreasing sequence.
///
/// Differences are mapped into `[-period/2, period/2)` and re-accumulated,
/// so a wrap from 65534 to 0 becomes a forward step.
pub fn unwrap_frame_counts(raw: &[i64]) -> Vec<i64> {
    let period = FRAME_COUNT_PERIOD;
    let half = period / 2;
    let mut unwrapped = Vec::with_capacity(raw.len());
    if let Some(&first) = raw.first() {
        let mut running = first;
        unwrapped.push(running);
        for w in raw.windows(2) {
            let diff = w[1] - w[0];
            let adjusted = (diff + half).rem_euclid(period) - half;
            running += adjusted;
            unwrapped.push(running);
        }
    }
    unwrapped
}

/// Estimates the fixed lag between camera system time and the pulse-train
/// (DIO) time, in nanoseconds.
///
/// With no clock breaks the lag is the median element-wise difference over
/// the overlap of the two sequences (the longer one truncated). With one or
/// more breaks only the first-sample difference is used: a disconnect shifts
/// the clock relationship mid-epoch, so only the first segment's lag is
/// trusted to anchor the regression.
pub fn estimate_camera_to_rec_lag(
    camera_systime_ns: &[f64],
    dio_systime_ns: &[f64],
    n_breaks: usize,
    sink: &dyn DiagnosticSink,
) -> f64 {
    let lag = if n_breaks == 0 {
        let mut diffs: Vec<f64> = camera_systime_ns
            .iter()
            .zip(dio_systime_ns.iter())
            .map(|(&c, &d)| c - d)
            .collect();
        median(&mut diffs)
    } else {
        camera_systime_ns[0] - dio_systime_ns[0]
    };

    sink.info(&format!(
        "estimated recorder to camera lag: {:.3} s",
        lag / NANOSECONDS_PER_SECOND
    ));
    lag
}

/// Maps frame counts to reference-clock time by ordinary least squares.
///
/// Fits `camera_systime - lag` against `frame_count` (slope = time per frame,
/// intercept = zero-frame epoch time) and evaluates the line at every frame
/// count. Outliers must already have been excluded by the break detector;
/// the fit applies no down-weighting.
pub fn correct_timestamps_for_lag(
    frame_count: &[i64],
    camera_systime_ns: &[f64],
    lag_ns: f64,
) -> Vec<f64> {
    let x: Vec<f64> = frame_count.iter().map(|&c| c as f64).collect();
    let y: Vec<f64> = camera_systime_ns.iter().map(|&t| t - lag_ns).collect();
    let (slope, intercept) = linear_regression(&x, &y);
    x.iter().map(|&xi| intercept + xi * slope).collect()
}

/// Aligns frames whose hardware timestamps already sit in the reference
/// domain (precision clock active).
///
/// Converts nanoseconds to seconds and drops every sample at or before the
/// timing pause midpoint. A missing pause is recoverable: trimming is skipped
/// with a warning.
pub fn align_precision(
    hw_timestamps_ns: &[i64],
    sink: &dyn DiagnosticSink,
) -> AlignedFrames {
    let pause = find_acquisition_timing_pause(
        hw_timestamps_ns,
        PAUSE_MIN_DURATION,
        PAUSE_MAX_DURATION_PRECISION,
        PAUSE_SEARCH_WINDOW,
    );

    let rows: Vec<usize> = match pause {
        Ok(pause_mid_ns) => hw_timestamps_ns
            .iter()
            .enumerate()
            .filter_map(|(i, &t)| (t > pause_mid_ns).then_some(i))
            .collect(),
        Err(_) => {
            sink.warn("no timing pause found in precision timestamps; keeping all samples");
            (0..hw_timestamps_ns.len()).collect()
        }
    };

    let times_s: Array1<f64> = rows
        .iter()
        .map(|&i| hw_timestamps_ns[i] as f64 / NANOSECONDS_PER_SECOND)
        .collect();

    if rows.len() > 1 {
        let kept: Vec<i64> = rows.iter().map(|&i| hw_timestamps_ns[i]).collect();
        sink.info(&format!(
            "camera frame rate estimated from precision timestamps: {:.1} frames/s",
            frame_rate(&kept)
        ));
    }

    AlignedFrames { times_s, rows }
}

/// Aligns frames onto the reference clock through the camera-tick DIO pulse
/// train (no precision clock).
///
/// The inputs are parallel per-frame arrays that have already had break
/// samples (segment label 0) removed: the local clock index, the unwrapped
/// frame counter, and the segment label. `dio_camera_times_s` is the
/// epoch-restricted pulse train; `sample_counts` / `rec_clock_times_s` give
/// the reference clock's value at each recorded sample index.
///
/// A frame is usable only when its local clock index appears in
/// `sample_counts`; usable frames are looked up into the reference clock by
/// binary-search rank. Samples at or before the timing pause are dropped
/// consistently from every array, the camera-to-recorder lag is estimated
/// once, and each surviving segment gets an independent least-squares fit of
/// reference time against frame count. The concatenated corrected times
/// become the output index, with duplicate timestamps collapsed to their
/// first occurrence (a known artifact of the correction, never an error).
#[allow(clippy::too_many_arguments)]
pub fn align_dio_bridge(
    trodes_time: &[i64],
    frame_count: &[i64],
    labels: &[u32],
    segment_ids: &[u32],
    dio_camera_times_s: &[f64],
    rec_clock_times_s: &[f64],
    sample_counts: &[i64],
    sink: &dyn DiagnosticSink,
) -> Result<AlignedFrames, TrodesError> {
    // Locate the pause in the pulse train. Not finding one is recoverable:
    // a negative sentinel keeps every sample.
    let dio_ns: Vec<i64> = dio_camera_times_s
        .iter()
        .map(|&s| (s * NANOSECONDS_PER_SECOND).round() as i64)
        .collect();
    let pause_mid_ns = match find_acquisition_timing_pause(
        &dio_ns,
        PAUSE_MIN_DURATION,
        PAUSE_MAX_DURATION,
        PAUSE_SEARCH_WINDOW,
    ) {
        Ok(mid) => {
            let post_pause: Vec<i64> =
                dio_ns.iter().copied().filter(|&t| t > mid).collect();
            if post_pause.len() > 1 {
                sink.info(&format!(
                    "camera frame rate estimated from DIO camera ticks: {:.1} frames/s",
                    frame_rate(&post_pause)
                ));
            }
            mid
        }
        Err(_) => {
            sink.warn("no timing pause found in DIO camera ticks; keeping all samples");
            -1
        }
    };

    // A camera frame is valid only when its local clock index was recorded;
    // rank lookup maps it into the reference clock domain.
    let mut valid_rows = Vec::new();
    let mut camera_systime_ns = Vec::new();
    if !rec_clock_times_s.is_empty() {
        for (i, &t) in trodes_time.iter().enumerate() {
            if sample_counts.binary_search(&t).is_ok() {
                let rank = sample_counts.partition_point(|&s| s <= t);
                let rank = rank.min(rec_clock_times_s.len() - 1);
                valid_rows.push(i);
                camera_systime_ns.push(rec_clock_times_s[rank] * NANOSECONDS_PER_SECOND);
            }
        }
    }

    // Drop everything at or before the pause, consistently across arrays.
    let dio_systime_ns: Vec<f64> = dio_ns
        .iter()
        .filter(|&&t| t > pause_mid_ns)
        .map(|&t| t as f64)
        .collect();
    let keep: Vec<bool> = camera_systime_ns
        .iter()
        .map(|&t| t > pause_mid_ns as f64)
        .collect();
    let rows: Vec<usize> = valid_rows
        .iter()
        .zip(keep.iter())
        .filter_map(|(&r, &k)| k.then_some(r))
        .collect();
    let camera_systime_ns: Vec<f64> = camera_systime_ns
        .iter()
        .zip(keep.iter())
        .filter_map(|(&t, &k)| k.then_some(t))
        .collect();
    let kept_frame_count: Vec<i64> = rows.iter().map(|&r| frame_count[r]).collect();
    let kept_labels: Vec<u32> = rows.iter().map(|&r| labels[r]).collect();

    if camera_systime_ns.is_empty() {
        return Err(TrodesError::Other(
            "no camera frames coincide with recorded samples".to_string(),
        ));
    }
    if dio_systime_ns.is_empty() {
        return Err(TrodesError::Other(
            "no camera tick pulses available for lag estimation".to_string(),
        ));
    }

    let camera_ns_i64: Vec<i64> = camera_systime_ns.iter().map(|&t| t as i64).collect();
    if camera_ns_i64.len() > 1 {
        sink.info(&format!(
            "camera frame rate estimated from camera system time: {:.1} frames/s",
            frame_rate(&camera_ns_i64)
        ));
    }

    let n_breaks = segment_ids.len().saturating_sub(1);
    let lag_ns = estimate_camera_to_rec_lag(
        &camera_systime_ns,
        &dio_systime_ns,
        n_breaks,
        sink,
    );

    // Independent fit per surviving segment; a disconnect may change the
    // effective frame rate across the boundary.
    let mut corrected_ns = vec![0.0f64; rows.len()];
    for &id in segment_ids {
        let chunk: Vec<usize> = kept_labels
            .iter()
            .enumerate()
            .filter_map(|(i, &l)| (l == id).then_some(i))
            .collect();
        if chunk.is_empty() {
            continue;
        }
        let chunk_frames: Vec<i64> = chunk.iter().map(|&i| kept_frame_count[i]).collect();
        let chunk_times: Vec<f64> = chunk.iter().map(|&i| camera_systime_ns[i]).collect();
        let chunk_corrected =
            correct_timestamps_for_lag(&chunk_frames, &chunk_times, lag_ns);
        for (&i, &t) in chunk.iter().zip(chunk_corrected.iter()) {
            corrected_ns[i] = t;
        }
    }

    // Collapse duplicate corrected timestamps, keeping the first occurrence.
    let mut indexed: Vec<(f64, usize)> = corrected_ns
        .iter()
        .zip(rows.iter())
        .map(|(&t, &r)| (t, r))
        .collect();
    indexed.sort_by(|a, b| a.0.total_cmp(&b.0));
    indexed.dedup_by(|a, b| a.0 == b.0);

    let times_s: Array1<f64> = indexed
        .iter()
        .map(|&(t, _)| t / NANOSECONDS_PER_SECOND)
        .collect();
    let rows: Vec<usize> = indexed.iter().map(|&(_, r)| r).collect();

    Ok(AlignedFrames { times_s, rows })
}

/// Ordinary least squares fit of y against x, returning (slope, intercept).
fn linear_regression(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut ss_xx = 0.0;
    let mut ss_xy = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        ss_xx += (xi - mean_x) * (xi - mean_x);
        ss_xy += (xi - mean_x) * (yi - mean_y);
    }
    // A single-point or constant-x chunk degenerates to a flat line
    let slope = if ss_xx > 0.0 { ss_xy / ss_xx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;
    (slope, intercept)
}

/// Median of a slice, averaging the two middle values for even lengths.
fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}
