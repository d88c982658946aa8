//! Job id helpers.
//!
//! A job is either a file path (`./spec/models/user_spec.rb`) or an example
//! inside a file (`./spec/models/user_spec.rb[1:2]`). Only the execution
//! engine interprets them; the helpers here never look past the bracket.

/// The file a job belongs to.
pub fn file_of(job: &str) -> &str {
    match job.find('[') {
        Some(idx) => &job[..idx],
        None => job,
    }
}
