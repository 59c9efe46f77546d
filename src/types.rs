use ndarray::Array1;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Numeric type of a single field in a Trodes record layout.
///
/// Trodes sidecar files describe their packed binary layout with a textual
/// `fields` setting such as `<time uint32><xloc uint16><yloc uint16>`. Every
/// value is stored little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Unsigned 8-bit integer
    U8,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 16-bit integer
    U16,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 32-bit integer
    U32,
    /// Signed 32-bit integer
    I32,
    /// Unsigned 64-bit integer
    U64,
    /// Signed 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl FieldType {
    /// Parses a Trodes field type name (e.g. `"uint32"`).
    pub fn from_name(name: &str) -> Result<FieldType, TrodesError> {
        match name {
            "uint8" => Ok(FieldType::U8),
            "int8" => Ok(FieldType::I8),
            "uint16" => Ok(FieldType::U16),
            "int16" => Ok(FieldType::I16),
            "uint32" => Ok(FieldType::U32),
            "int32" => Ok(FieldType::I32),
            "uint64" => Ok(FieldType::U64),
            "int64" => Ok(FieldType::I64),
            "float32" => Ok(FieldType::F32),
            "float64" => Ok(FieldType::F64),
            other => Err(TrodesError::InvalidFieldType(other.to_string())),
        }
    }

    /// Size of one value of this type in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
            FieldType::U64 | FieldType::I64 | FieldType::F64 => 8,
        }
    }
}

/// One field of a Trodes record layout: name, element type, and repeat count.
///
/// A repeat count greater than one means the field stores a small fixed-size
/// array per record (written `3*float32` or `float32*3` in the header).
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field name as given in the settings block
    pub name: String,
    /// Element type
    pub ty: FieldType,
    /// Number of elements per record (usually 1)
    pub repeats: usize,
}

impl FieldSpec {
    /// Bytes occupied by this field in one record.
    pub fn byte_size(&self) -> usize {
        self.ty.byte_size() * self.repeats
    }
}

/// A single column of values read from a Trodes file, stored in its native type.
///
/// Columns with a repeat count above one are stored flattened in record order.
#[derive(Debug, Clone)]
pub enum Column {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Column {
    /// Number of stored values (records times repeats).
    pub fn len(&self) -> usize {
        match self {
            Column::U8(v) => v.len(),
            Column::I8(v) => v.len(),
            Column::U16(v) => v.len(),
            Column::I16(v) => v.len(),
            Column::U32(v) => v.len(),
            Column::I32(v) => v.len(),
            Column::U64(v) => v.len(),
            Column::I64(v) => v.len(),
            Column::F32(v) => v.len(),
            Column::F64(v) => v.len(),
        }
    }

    /// Whether the column holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts the column to an `f64` array.
    ///
    /// Integer values above 2^53 lose precision here; use [`Column::as_i64`]
    /// for nanosecond timestamps.
    pub fn as_f64(&self) -> Array1<f64> {
        match self {
            Column::U8(v) => v.iter().map(|&x| x as f64).collect(),
            Column::I8(v) => v.iter().map(|&x| x as f64).collect(),
            Column::U16(v) => v.iter().map(|&x| x as f64).collect(),
            Column::I16(v) => v.iter().map(|&x| x as f64).collect(),
            Column::U32(v) => v.iter().map(|&x| x as f64).collect(),
            Column::I32(v) => v.iter().map(|&x| x as f64).collect(),
            Column::U64(v) => v.iter().map(|&x| x as f64).collect(),
            Column::I64(v) => v.iter().map(|&x| x as f64).collect(),
            Column::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Column::F64(v) => v.iter().copied().collect(),
        }
    }

    /// Converts the column to an `i64` array, truncating float values.
    pub fn as_i64(&self) -> Array1<i64> {
        match self {
            Column::U8(v) => v.iter().map(|&x| x as i64).collect(),
            Column::I8(v) => v.iter().map(|&x| x as i64).collect(),
            Column::U16(v) => v.iter().map(|&x| x as i64).collect(),
            Column::I16(v) => v.iter().map(|&x| x as i64).collect(),
            Column::U32(v) => v.iter().map(|&x| x as i64).collect(),
            Column::I32(v) => v.iter().map(|&x| x as i64).collect(),
            Column::U64(v) => v.iter().map(|&x| x as i64).collect(),
            Column::I64(v) => v.iter().copied().collect(),
            Column::F32(v) => v.iter().map(|&x| x as i64).collect(),
            Column::F64(v) => v.iter().map(|&x| x as i64).collect(),
        }
    }
}

/// Parsed contents of a Trodes sidecar file.
///
/// Produced by [`crate::load`]. Holds the textual settings block plus one
/// typed column per field of the record layout.
#[derive(Debug, Clone)]
pub struct TrodesFile {
    /// Settings block entries, keys lowercased
    pub settings: HashMap<String, String>,
    /// Record layout parsed from the `fields` setting, in file order
    pub fields: Vec<FieldSpec>,
    /// Column data keyed by field name
    pub columns: HashMap<String, Column>,
    /// Number of complete records read
    pub num_records: usize,
}

impl TrodesFile {
    /// Looks up a column by field name.
    pub fn column(&self, name: &str) -> Result<&Column, TrodesError> {
        self.columns
            .get(name)
            .ok_or_else(|| TrodesError::FieldNotFound(name.to_string()))
    }
}

/// Sink for diagnostic messages emitted while reconciling timestamps.
///
/// The core components report what they detected (repeat indices, frame jumps,
/// estimated lags, frame rates) through an injected sink instead of a
/// process-wide logger, so the library holds no global state. Use [`LogSink`]
/// to forward to the `log` facade, or [`NullSink`] to discard everything.
pub trait DiagnosticSink {
    /// Reports an informational message.
    fn info(&self, message: &str);
    /// Reports a warning.
    fn warn(&self, message: &str);
}

/// Forwards diagnostics to the `log` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn info(&self, message: &str) {
        log::info!("{}", message);
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", message);
    }
}

/// Discards all diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn info(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}
}

/// Per-sample segment labels produced by the sequence-break detector.
///
/// Label 0 marks samples inside a detected break (frozen clock or large frame
/// jump); positive labels number the surviving contiguous runs left to right.
/// Labels are assigned once per sequence and never change afterwards.
#[derive(Debug, Clone)]
pub struct SegmentLabels {
    /// Label for each input sample, 0 = excluded
    pub labels: Vec<u32>,
    /// Sorted positive labels present in `labels`
    pub segment_ids: Vec<u32>,
}

impl SegmentLabels {
    /// Number of clock breaks between surviving segments.
    ///
    /// One surviving segment means no breaks; each additional segment implies
    /// a disconnect boundary before it.
    pub fn num_breaks(&self) -> usize {
        self.segment_ids.len().saturating_sub(1)
    }
}

/// Where an epoch's position data comes from.
///
/// Online tracking can be started late, stopped early, or never run at all,
/// so a camera timestamps file may exist with no tracking file beside it.
#[derive(Debug, Clone)]
pub enum PositionSource {
    /// Camera timestamps plus a tracked-position file
    WithTracking {
        /// Path to the `.cameraHWSync` video timestamps file
        timestamps: PathBuf,
        /// Path to the `.videoPositionTracking` file
        tracking: PathBuf,
    },
    /// Camera timestamps only; the output position series will be empty
    TimestampOnly {
        /// Path to the `.cameraHWSync` video timestamps file
        timestamps: PathBuf,
    },
}

impl PositionSource {
    /// Path to the camera timestamps file for either variant.
    pub fn timestamps_path(&self) -> &Path {
        match self {
            PositionSource::WithTracking { timestamps, .. } => timestamps,
            PositionSource::TimestampOnly { timestamps } => timestamps,
        }
    }
}

/// How camera frames are mapped onto the reference clock for one session.
///
/// Established once from the hardware configuration and constant for every
/// epoch of the session.
#[derive(Debug, Clone)]
pub enum ClockSource<'a> {
    /// A hardware precision-time (PTP) clock stamped each frame directly in
    /// the reference domain; no regression needed.
    Precision,
    /// No precision clock: bridge camera frames to the reference clock through
    /// the camera-tick DIO pulse train.
    DioBridge {
        /// Reference-clock time for each recorded sample, in seconds
        rec_clock_times: &'a [f64],
        /// Sample-count value for each recorded sample, ascending, used for
        /// membership and rank lookup against the camera timestamp index
        sample_counts: &'a [i64],
        /// Camera-tick DIO timestamps restricted to the epoch, in seconds
        dio_camera_times: &'a [f64],
    },
}

/// One LED's tracked positions, aligned to the output time index.
///
/// Samples with no tracking match hold NaN.
#[derive(Debug, Clone)]
pub struct LedSeries {
    /// x position in pixels
    pub x: Array1<f64>,
    /// y position in pixels
    pub y: Array1<f64>,
}

/// Reconciled position data for one epoch.
///
/// All series share the same time index and length. Built fresh per epoch and
/// never mutated afterwards; epochs share no state, so separate epochs can be
/// resolved concurrently.
#[derive(Debug, Clone)]
pub struct PositionOutput {
    /// Reference-clock time index in seconds, strictly increasing
    pub times: Array1<f64>,
    /// Tracked LED series (zero, one, or two entries)
    pub leds: Vec<LedSeries>,
    /// Original video frame index for each output sample
    pub frame_index: Array1<u32>,
    /// Break-detector segment label for each output sample
    pub segment_labels: Array1<u32>,
    /// Spatial scale of the tracked positions, meters per pixel
    pub meters_per_pixel: f64,
}

/// A named digital I/O channel with its edge timestamps in seconds.
///
/// The camera exposure pulse train arrives as one of these; it is located by
/// name (must contain `"camera ticks"`).
#[derive(Debug, Clone)]
pub struct DioChannel {
    /// Channel name from the session metadata
    pub name: String,
    /// Edge timestamps in seconds, ascending
    pub timestamps: Array1<f64>,
}

/// Spatial calibration and epoch assignment for the rig's cameras.
#[derive(Debug, Clone, Default)]
pub struct CameraCalibration {
    /// Camera id → meters per pixel
    pub meters_per_pixel: HashMap<i32, f64>,
    /// Epoch number → camera id recording that epoch
    pub epoch_to_camera: HashMap<i32, i32>,
}

impl CameraCalibration {
    /// Spatial scale factor for the camera that recorded `epoch`.
    pub fn meters_per_pixel_for_epoch(&self, epoch: i32) -> Result<f64, TrodesError> {
        let camera_id = self
            .epoch_to_camera
            .get(&epoch)
            .ok_or(TrodesError::CameraNotFound { epoch })?;
        self.meters_per_pixel
            .get(camera_id)
            .copied()
            .ok_or(TrodesError::CameraNotFound { epoch })
    }
}

/// Errors raised while importing and aligning Trodes position data.
#[derive(Debug)]
pub enum TrodesError {
    /// The file does not begin with a `<Start settings>` block
    UnsupportedSettingsFormat,
    /// A settings line could not be split into `key: value`
    MalformedSettingsLine(String),
    /// The `fields` setting names an unknown value type
    InvalidFieldType(String),
    /// A required field is missing from the record layout
    FieldNotFound(String),
    /// More than one DIO channel name matches "camera ticks"; multiple
    /// cameras without a precision clock are not supported
    AmbiguousCameraChannel(Vec<String>),
    /// No DIO channel name matches "camera ticks"
    CameraChannelNotFound,
    /// No camera DIO channel has enough ticks inside the epoch bounds
    InsufficientTicks {
        /// Most ticks found in any name-matching channel
        found: usize,
        /// Minimum required
        required: usize,
    },
    /// No calibration pause gap found in the search window (recoverable:
    /// callers skip pause trimming)
    PauseNotFound,
    /// No camera assigned to an epoch in the calibration metadata
    CameraNotFound {
        /// Epoch with no camera assignment
        epoch: i32,
    },
    /// The camera timestamps file holds no records
    EmptyTimestamps,
    /// An I/O error occurred while reading a file
    IoError(io::Error),
    /// A general error with a custom message
    Other(String),
}

impl fmt::Display for TrodesError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrodesError::UnsupportedSettingsFormat => {
                write!(f, "Settings format not supported")
            }
            TrodesError::MalformedSettingsLine(line) => {
                write!(f, "Malformed settings line: {}", line)
            }
            TrodesError::InvalidFieldType(ty) => {
                write!(f, "{} is not a valid field type", ty)
            }
            TrodesError::FieldNotFound(name) => {
                write!(f, "Field {} not found in record layout", name)
            }
            TrodesError::AmbiguousCameraChannel(names) => write!(
                f,
                "Multiple camera DIO channels found by name ({}). \
                 Multiple cameras without a precision clock are not supported",
                names.join(", ")
            ),
            TrodesError::CameraChannelNotFound => write!(
                f,
                "No camera DIO channel found by name. Check session metadata; \
                 the name must contain 'camera ticks'"
            ),
            TrodesError::InsufficientTicks { found, required } => write!(
                f,
                "No camera DIO channel has sufficient ticks for this epoch \
                 (best {} of {} required)",
                found, required
            ),
            TrodesError::PauseNotFound => {
                write!(f, "No acquisition timing pause found in search window")
            }
            TrodesError::CameraNotFound { epoch } => {
                write!(f, "No camera calibration found for epoch {}", epoch)
            }
            TrodesError::EmptyTimestamps => {
                write!(f, "Camera timestamps file holds no records")
            }
            TrodesError::IoError(e) => write!(f, "IO error: {}", e),
            TrodesError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for TrodesError {}

impl From<io::Error> for TrodesError {
    fn from(error: io::Error) -> Self {
        TrodesError::IoError(error)
    }
}
