//! Completion notifications, emitted once per finished sample.

use tracing::info;

/// What the controller knows about a sample once it has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReport {
    /// Index of the sample within the test set
    pub sample_idx: u16,
    /// Run counter after the sample was committed
    pub run_counter: u16,
    /// Arg-max of the final output tensor
    pub predicted: usize,
    /// Final output tensor, unfolded
    pub scores: Vec<i32>,
    /// Expected class, when the image carries labels
    pub label: Option<u8>,
    /// Whether a power failure interrupted this sample
    pub recovered: bool,
}

impl SampleReport {
    pub fn is_correct(&self) -> Option<bool> {
        self.label.map(|label| usize::from(label) == self.predicted)
    }
}

/// Observer told about every completed sample.
///
/// Implementations must not block for long and must not fail: the sample is
/// already durable when this is called.
pub trait CompletionSink {
    fn sample_finished(&mut self, report: &SampleReport);
}

/// Sink that turns every completion into a log line.
#[derive(Debug, Default)]
pub struct LogSink;

impl CompletionSink for LogSink {
    fn sample_finished(&mut self, report: &SampleReport) {
        info!(
            sample = report.sample_idx,
            run_counter = report.run_counter,
            predicted = report.predicted,
            label = ?report.label,
            recovered = report.recovered,
            "Sample finished"
        );
    }
}

/// Sink that keeps every report, used for accuracy summaries and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub reports: Vec<SampleReport>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of labelled samples predicted correctly, and labelled total.
    pub fn accuracy(&self) -> (usize, usize) {
        let labelled: Vec<bool> = self.reports.iter().filter_map(|r| r.is_correct()).collect();
        let correct = labelled.iter().filter(|ok| **ok).count();
        (correct, labelled.len())
    }
}

impl CompletionSink for RecordingSink {
    fn sample_finished(&mut self, report: &SampleReport) {
        self.reports.push(report.clone());
    }
}

/// Fans a completion out to two sinks.
pub struct Tee<'a, A: CompletionSink, B: CompletionSink>(pub &'a mut A, pub &'a mut B);

impl<A: CompletionSink, B: CompletionSink> CompletionSink for Tee<'_, A, B> {
    fn sample_finished(&mut self, report: &SampleReport) {
        self.0.sample_finished(report);
        self.1.sample_finished(report);
    }
}
