use crate::types::{DiagnosticSink, SegmentLabels};

// A run of flagged samples shorter than this is treated as single-sample
// jitter, not a genuine break.
const MIN_BREAK_RUN: usize = 2;

/// Default minimum frame-count jump treated as a dropped-frame discontinuity.
pub const DEFAULT_MIN_FRAME_JUMP: i64 = 15;

/// Flags samples whose timestamp does not strictly increase.
///
/// The Trodes time index freezes when the headstage disconnects, which shows
/// up as repeated values. Element `i` (i > 0) is true iff
/// `timestamps[i-1] >= timestamps[i]`; element 0 is always false.
pub fn detect_repeat_timestamps<T: PartialOrd>(timestamps: &[T]) -> Vec<bool> {
    let mut is_repeat = vec![false; timestamps.len()];
    for i in 1..timestamps.len() {
        is_repeat[i] = timestamps[i - 1] >= timestamps[i];
    }
    is_repeat
}

/// Flags samples where the frame counter jumps by more than `min_jump`.
///
/// Element `i` (i > 0) is true iff
/// `frame_count[i] - frame_count[i-1] > min_jump`; element 0 is always false.
pub fn find_large_frame_jumps(
    frame_count: &[i64],
    min_jump: i64,
    sink: &dyn DiagnosticSink,
) -> Vec<bool> {
    let mut is_jump = vec![false; frame_count.len()];
    for i in 1..frame_count.len() {
        is_jump[i] = frame_count[i] - frame_count[i - 1] > min_jump;
    }

    sink.info(&format!("big frame jumps: {:?}", flagged_indices(&is_jump)));

    is_jump
}

/// Labels contiguous runs of true values 1, 2, ... left to right.
///
/// False positions get label 0. One-dimensional connected-component labeling.
pub fn label_spans(mask: &[bool]) -> Vec<u32> {
    let mut labels = vec![0u32; mask.len()];
    let mut current = 0u32;
    let mut in_run = false;
    for (i, &flagged) in mask.iter().enumerate() {
        if flagged {
            if !in_run {
                current += 1;
                in_run = true;
            }
            labels[i] = current;
        } else {
            in_run = false;
        }
    }
    labels
}

/// Segments a timestamp sequence at clock freezes and frame jumps.
///
/// Flags the union of repeated timestamps and large frame-count jumps, keeps
/// only flagged runs longer than two samples as genuine breaks, then labels
/// every maximal surviving span with a positive segment id. Samples inside a
/// break get label 0 and are excluded downstream; each surviving segment's
/// clock regression runs independently because a disconnect can shift the
/// camera-to-recorder lag.
///
/// Re-running on an already-filtered sequence (label-0 samples removed)
/// yields a single surviving segment.
pub fn segment_breaks<T: PartialOrd>(
    timestamps: &[T],
    frame_count: &[i64],
    min_jump: i64,
    sink: &dyn DiagnosticSink,
) -> SegmentLabels {
    let mut is_break = detect_repeat_timestamps(timestamps);
    sink.info(&format!(
        "repeat timestamps ind: {:?}",
        flagged_indices(&is_break)
    ));

    let is_jump = find_large_frame_jumps(frame_count, min_jump, sink);
    for (b, j) in is_break.iter_mut().zip(is_jump) {
        *b |= j;
    }

    // Un-flag runs too short to be a genuine break
    let run_labels = label_spans(&is_break);
    let run_counts = count_labels(&run_labels);
    for (flag, &run) in is_break.iter_mut().zip(run_labels.iter()) {
        if run != 0 && run_counts[run as usize] <= MIN_BREAK_RUN {
            *flag = false;
        }
    }

    let not_break: Vec<bool> = is_break.iter().map(|&b| !b).collect();
    let labels = label_spans(&not_break);

    let mut segment_ids: Vec<u32> = labels.iter().copied().filter(|&l| l != 0).collect();
    segment_ids.sort_unstable();
    segment_ids.dedup();

    SegmentLabels {
        labels,
        segment_ids,
    }
}

/// Sample counts per label; index = label value.
fn count_labels(labels: &[u32]) -> Vec<usize> {
    let max = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut counts = vec![0usize; max + 1];
    for &l in labels {
        counts[l as usize] += 1;
    }
    counts
}

fn flagged_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &f)| f.then_some(i))
        .collect()
}
