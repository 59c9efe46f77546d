use std::error::Error;
use trodes_importer::{
    load, resolve_epoch, ClockSource, DiagnosticSink, PositionSource,
};

/// Prints diagnostics straight to stdout.
struct StdoutSink;

impl DiagnosticSink for StdoutSink {
    fn info(&self, message: &str) {
        println!("{}", message);
    }

    fn warn(&self, message: &str) {
        println!("Warning: {}", message);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Load a camera HW sync file
    let sync_file = load("data/20230622_155936.1.videoTimeStamps.cameraHWSync")?;

    // Print basic file information
    println!("Records read: {}", sync_file.num_records);
    println!("Record layout:");
    for field in &sync_file.fields {
        println!("  {} ({:?} x{})", field.name, field.ty, field.repeats);
    }
    if let Some(clock_rate) = sync_file.settings.get("clock rate") {
        println!("Clock rate: {}", clock_rate);
    }

    // Resolve one epoch's position data. This session recorded with a
    // hardware precision clock, so camera timestamps are already in the
    // reference domain.
    let source = PositionSource::WithTracking {
        timestamps: "data/20230622_155936.1.videoTimeStamps.cameraHWSync".into(),
        tracking: "data/20230622_155936.1.videoPositionTracking".into(),
    };
    let output = resolve_epoch(&source, &ClockSource::Precision, 0.002, &StdoutSink)?;

    println!("\nAligned position table:");
    println!("  Frames: {}", output.times.len());
    if let (Some(first), Some(last)) = (output.times.first(), output.times.last()) {
        println!("  Time range: {:.3} s to {:.3} s", first, last);
    }
    println!("  Tracked LEDs: {}", output.leds.len());
    for (i, led) in output.leds.iter().enumerate() {
        let tracked = led.x.iter().filter(|x| !x.is_nan()).count();
        println!("    LED {}: {} of {} frames tracked", i, tracked, led.x.len());
    }
    let segments = output
        .segment_labels
        .iter()
        .max()
        .copied()
        .unwrap_or(0);
    println!("  Segments: {}", segments);

    Ok(())
}
