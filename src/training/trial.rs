//! Hook for an external hyper-parameter search driving the trainer

/// One trial of a hyper-parameter search
///
/// The trainer reports the monitored validation metric once per epoch and
/// stops with a pruned outcome when the search asks for it.
pub trait Trial: Send {
    /// Record the objective `value` at `step` (the zero-based epoch)
    fn report(&mut self, value: f64, step: usize);

    /// Whether the search wants this trial stopped
    fn should_prune(&self) -> bool;

    /// Attach a named value to the trial record
    fn set_user_attr(&mut self, key: &str, value: serde_json::Value);
}
